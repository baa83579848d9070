use std::fmt;
use std::future::Future;

use anyhow::Result;
use futures::{stream, StreamExt};

use crate::cancel::Cancellation;
use crate::config::CrawlerConfig;
use crate::extract::PageBatch;
use crate::guard::{GuardStatus, Resolution};
use crate::navigator::NavigationResult;
use crate::renderer::{RenderSession, Renderer};
use crate::sink::RecordSink;
use crate::site::Site;

/// Why a listing traversal stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The last page was reached
    Exhausted,
    /// `max_pages` pages were visited and more remain
    BudgetReached,
    /// A challenge was not resolved within the allowed wait
    GuardTimeout,
    /// The next control kept failing although the page advertises one
    NavigationError,
    /// The renderer session crashed or a page was unreachable
    RendererError,
    Cancelled,
}

impl Termination {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::GuardTimeout | Self::NavigationError | Self::RendererError
        )
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exhausted => "exhausted",
            Self::BudgetReached => "budget-reached",
            Self::GuardTimeout => "guard-timeout",
            Self::NavigationError => "navigation-error",
            Self::RendererError => "renderer-error",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Traversal cursor of one listing.
#[derive(Debug, Clone, Copy)]
pub struct PageState {
    pub page_index: usize,
    pub has_more: bool,
    pub guard_status: GuardStatus,
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            page_index: 1,
            has_more: true,
            guard_status: GuardStatus::Clear,
        }
    }
}

/// Outcome of a listing traversal, enough to resume manually from `page_reached`.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub listing: String,
    pub termination: Termination,
    pub pages_visited: usize,
    pub page_reached: usize,
    pub records_written: usize,
    pub records_lost: usize,
    pub pages_lost: Vec<usize>,
    pub error: Option<String>,
}

impl CrawlSummary {
    pub fn is_fatal(&self) -> bool {
        self.termination.is_fatal()
    }
}

/// One listing to traverse with the sink its records go to.
pub struct Listing {
    pub url: String,
    pub sink: Box<dyn RecordSink>,
}

enum State {
    Start,
    GuardCheck(Then),
    Extract,
    Persist(PageBatch),
    Navigate,
    Done(Termination),
}

/// Where to go once the guard is clear.
#[derive(Debug, Clone, Copy)]
enum Then {
    Extract,
    Navigate,
}

struct Driver<'a> {
    conf: &'a CrawlerConfig,
    site: &'a Site,
    url: &'a str,
    session: &'a mut dyn RenderSession,
    sink: &'a mut dyn RecordSink,
    cancel: &'a Cancellation,
    page: PageState,
    pages_visited: usize,
    records_written: usize,
    records_lost: usize,
    pages_lost: Vec<usize>,
    failed_navigations: usize,
    /// Fingerprint of the page a pending navigation started from
    origin: Option<String>,
}

impl<'a> Driver<'a> {
    async fn run(&mut self) -> Result<Termination> {
        let mut state = State::Start;
        loop {
            state = match state {
                State::Start => self.start().await?,
                State::GuardCheck(then) => self.guard_check(then).await?,
                State::Extract => self.extract().await?,
                State::Persist(batch) => self.persist(batch),
                State::Navigate => self.navigate().await?,
                State::Done(termination) => return Ok(termination),
            };
        }
    }

    async fn start(&mut self) -> Result<State> {
        log::info!("[{}] Loading listing {}", self.site.name, self.url);
        if cancellable(self.cancel, self.session.goto(self.url))
            .await?
            .is_none()
        {
            return Ok(State::Done(Termination::Cancelled));
        }
        if self.site.navigator().pace(self.cancel).await {
            return Ok(State::Done(Termination::Cancelled));
        }
        self.site
            .navigator()
            .dismiss_consent(self.session, self.cancel)
            .await?;
        Ok(State::GuardCheck(Then::Extract))
    }

    async fn guard_check(&mut self, then: Then) -> Result<State> {
        if self.cancel.is_cancelled() {
            return Ok(State::Done(Termination::Cancelled));
        }
        let html = self.session.content().await?;
        self.page.guard_status = self.site.guard().detect(&html);

        if self.page.guard_status == GuardStatus::Challenged {
            let max_wait = self.conf.guard_max_wait();
            log::warn!(
                "Challenge detected on page {}, solve it in the browser (waiting up to {:?})",
                self.page.page_index,
                max_wait
            );
            self.page.guard_status = GuardStatus::AwaitingResolution;
            let resolution = self
                .site
                .guard()
                .await_resolution(
                    self.session,
                    self.conf.guard_poll_interval(),
                    max_wait,
                    self.cancel,
                )
                .await?;
            match resolution {
                Resolution::Resolved => log::info!("Challenge resolved, resuming"),
                Resolution::TimedOut => {
                    log::error!(
                        "Challenge on page {} not resolved within {:?}",
                        self.page.page_index,
                        max_wait
                    );
                    return Ok(State::Done(Termination::GuardTimeout));
                }
                Resolution::Cancelled => return Ok(State::Done(Termination::Cancelled)),
            }
            self.page.guard_status = GuardStatus::Clear;
        }

        Ok(match then {
            Then::Extract => State::Extract,
            Then::Navigate => State::Navigate,
        })
    }

    async fn extract(&mut self) -> Result<State> {
        self.pages_visited += 1;
        let page = self.page.page_index;

        let Some(mut batch) = self.extract_once().await? else {
            return Ok(State::Done(Termination::Cancelled));
        };
        let mut retries = 0;
        while batch.is_empty() && retries < self.conf.empty_page_retries {
            retries += 1;
            log::warn!(
                "Page {page} yielded no records, retrying extraction ({retries}/{})",
                self.conf.empty_page_retries
            );
            if self.cancel.sleep(self.conf.empty_page_retry_delay()).await {
                break;
            }
            match self.extract_once().await? {
                Some(retried) => batch = retried,
                None => break,
            }
        }

        log::info!(
            "Page {page}: {} records extracted, {} empty containers discarded",
            batch.len(),
            batch.discarded
        );
        Ok(State::Persist(batch))
    }

    /// `None` when cancelled while waiting for the containers.
    async fn extract_once(&mut self) -> Result<Option<PageBatch>> {
        let rendered = cancellable(
            self.cancel,
            self.session
                .wait_for(self.site.container_css(), self.conf.render_timeout()),
        )
        .await?;
        match rendered {
            None => return Ok(None),
            Some(false) => log::debug!(
                "No container rendered on page {} within {:?}",
                self.page.page_index,
                self.conf.render_timeout()
            ),
            Some(true) => (),
        }
        let html = self.session.content().await?;
        Ok(Some(
            self.site.extract_page(&html, self.conf.keep_empty_records),
        ))
    }

    /// Never aborts the traversal, a batch that cannot be written is accounted as lost.
    fn persist(&mut self, batch: PageBatch) -> State {
        let page = self.page.page_index;
        if batch.is_empty() {
            return State::Navigate;
        }

        let mut attempt = 0;
        loop {
            match self.sink.append(&batch.records) {
                Ok(()) => {
                    self.records_written += batch.len();
                    log::info!("Page {page}: {} records persisted", batch.len());
                    break;
                }
                Err(e) if attempt < self.conf.persist_retries => {
                    attempt += 1;
                    log::warn!(
                        "Page {page}: persisting failed ({e:#}), retrying ({attempt}/{})",
                        self.conf.persist_retries
                    );
                }
                Err(e) => {
                    log::error!("Page {page}: {} records lost: {e:#}", batch.len());
                    self.records_lost += batch.len();
                    self.pages_lost.push(page);
                    break;
                }
            }
        }
        State::Navigate
    }

    async fn navigate(&mut self) -> Result<State> {
        if self.cancel.is_cancelled() {
            return Ok(State::Done(Termination::Cancelled));
        }
        let page = self.page.page_index;
        let navigator = self.site.navigator();
        let html = self.session.content().await?;
        let here = navigator.fingerprint_of(&self.session.current_url().await?, &html);

        // A blocked attempt may still have landed on the next page.
        if self.origin.as_ref().is_some_and(|origin| *origin != here) {
            log::info!("Left page {page} while navigation was blocked");
            if navigator.pace(self.cancel).await {
                return Ok(State::Done(Termination::Cancelled));
            }
            return Ok(self.advanced());
        }

        self.page.has_more = navigator.has_next(&html);
        if let Some(max_pages) = self.conf.max_pages {
            if page >= max_pages.get() {
                return Ok(State::Done(if self.page.has_more {
                    log::info!("Page budget of {max_pages} reached");
                    Termination::BudgetReached
                } else {
                    Termination::Exhausted
                }));
            }
        }
        if !self.page.has_more {
            log::info!("No next page after page {page}");
            return Ok(State::Done(Termination::Exhausted));
        }

        self.origin.get_or_insert(here);
        let outcome = navigator
            .advance(self.session, self.site.guard(), self.cancel)
            .await?;
        match outcome {
            NavigationResult::Advanced => Ok(self.advanced()),
            NavigationResult::BlockedByGuard | NavigationResult::NoSuchControl => {
                if self.cancel.is_cancelled() {
                    return Ok(State::Done(Termination::Cancelled));
                }
                self.failed_navigations += 1;
                if self.failed_navigations >= self.conf.max_navigation_attempts {
                    log::error!(
                        "Could not leave page {page} after {} attempts",
                        self.failed_navigations
                    );
                    return Ok(State::Done(Termination::NavigationError));
                }
                log::warn!(
                    "Navigation from page {page} failed ({outcome:?}), re-checking guard ({}/{})",
                    self.failed_navigations,
                    self.conf.max_navigation_attempts
                );
                Ok(State::GuardCheck(Then::Navigate))
            }
        }
    }

    fn advanced(&mut self) -> State {
        self.origin = None;
        self.failed_navigations = 0;
        self.page.page_index += 1;
        log::info!("Advanced to page {}", self.page.page_index);
        State::GuardCheck(Then::Extract)
    }
}

async fn cancellable<F, T>(cancel: &Cancellation, fut: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    cancel.run(fut).await.transpose()
}

/// Traverses one listing page by page until it is exhausted, the budget is spent, a
/// fatal condition occurs or `cancel` fires.
///
/// Records are handed to `sink` page by page; nothing is accumulated across pages.
pub async fn crawl_listing(
    conf: &CrawlerConfig,
    site: &Site,
    url: &str,
    session: &mut dyn RenderSession,
    sink: &mut dyn RecordSink,
    cancel: &Cancellation,
) -> CrawlSummary {
    let mut driver = Driver {
        conf,
        site,
        url,
        session,
        sink,
        cancel,
        page: PageState::default(),
        pages_visited: 0,
        records_written: 0,
        records_lost: 0,
        pages_lost: Vec::new(),
        failed_navigations: 0,
        origin: None,
    };

    let (termination, error) = match driver.run().await {
        Ok(termination) => (termination, None),
        Err(e) => (Termination::RendererError, Some(format!("{e:#}"))),
    };

    let summary = CrawlSummary {
        listing: url.to_string(),
        termination,
        pages_visited: driver.pages_visited,
        page_reached: driver.page.page_index,
        records_written: driver.records_written,
        records_lost: driver.records_lost,
        pages_lost: driver.pages_lost,
        error,
    };
    log_summary(&summary);
    summary
}

fn log_summary(summary: &CrawlSummary) {
    if summary.is_fatal() {
        log::error!(
            "Listing {} stopped ({}) on page {} with {} records written{}",
            summary.listing,
            summary.termination,
            summary.page_reached,
            summary.records_written,
            summary
                .error
                .as_ref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );
    } else {
        log::info!(
            "Listing {} finished ({}) after {} pages, {} records written",
            summary.listing,
            summary.termination,
            summary.pages_visited,
            summary.records_written
        );
    }
    if summary.records_lost > 0 {
        log::error!(
            "Listing {}: {} records lost on pages {:?}",
            summary.listing,
            summary.records_lost,
            summary.pages_lost
        );
    }
}

/// Traverses several listings concurrently, each in its own renderer session.
///
/// Summaries are returned in the order of `listings`.
pub async fn crawl_listings(
    conf: &CrawlerConfig,
    site: &Site,
    renderer: &dyn Renderer,
    listings: Vec<Listing>,
    cancel: &Cancellation,
) -> Vec<CrawlSummary> {
    stream::iter(listings)
        .map(|Listing { url, mut sink }| async move {
            let mut session = match renderer.new_session().await {
                Ok(session) => session,
                Err(e) => {
                    let summary = CrawlSummary {
                        listing: url,
                        termination: Termination::RendererError,
                        pages_visited: 0,
                        page_reached: 1,
                        records_written: 0,
                        records_lost: 0,
                        pages_lost: Vec::new(),
                        error: Some(format!("{e:#}")),
                    };
                    log_summary(&summary);
                    return summary;
                }
            };
            let summary =
                crawl_listing(conf, site, &url, session.as_mut(), sink.as_mut(), cancel).await;
            if let Err(e) = session.close().await {
                log::warn!("Couldn't close session of {url}: {e:#}");
            }
            summary
        })
        .buffered(conf.max_concurrent_listings.max(1))
        .collect()
        .await
}

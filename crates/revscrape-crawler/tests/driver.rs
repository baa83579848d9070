use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use revscrape_crawler::anyhow::{self, bail, Result};
use revscrape_crawler::{
    cancellation, crawl_listing, crawl_listings, Cancellation, Click, ConsentConfig,
    CrawlerConfig, FieldRule, FieldValue, GuardConfig, Listing, MemorySink, Pacing,
    PaginationConfig, Parse, Record, RecordSink, RenderSession, Renderer, Site, SiteConfig,
    Termination,
};
use tokio::time::Instant;

const LISTING: &str = "https://reviews.test/hotel";
const CAPTCHA: &str = r#"<iframe src="https://www.google.com/recaptcha/api2/anchor"></iframe>"#;

struct FakePage {
    reviews: usize,
    /// Reviews only show up once the page has been displayed that long
    render_delay: Duration,
    /// Challenge shown until the page has been displayed that long
    challenge: Option<Duration>,
    shown_at: Option<Instant>,
}

impl FakePage {
    fn new(reviews: usize) -> Self {
        Self {
            reviews,
            render_delay: Duration::ZERO,
            challenge: None,
            shown_at: None,
        }
    }

    fn rendered_after(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    fn challenged_for(mut self, duration: Duration) -> Self {
        self.challenge = Some(duration);
        self
    }
}

struct FakeSession {
    pages: Vec<FakePage>,
    current: usize,
    loaded: bool,
    /// Next clicks that land on a stale control and change nothing
    stale_clicks: usize,
    clicks: usize,
    /// Cookie banner shown until rejected, then a modal until closed
    banner: bool,
    modal: bool,
}

impl FakeSession {
    fn new(pages: Vec<FakePage>) -> Self {
        Self {
            pages,
            current: 0,
            loaded: false,
            stale_clicks: 0,
            clicks: 0,
            banner: false,
            modal: false,
        }
    }

    fn with_consent_banner(mut self) -> Self {
        self.banner = true;
        self
    }

    fn with_reviews(counts: &[usize]) -> Self {
        Self::new(counts.iter().map(|&n| FakePage::new(n)).collect())
    }

    fn has_next(&self) -> bool {
        self.current + 1 < self.pages.len()
    }
}

#[async_trait]
impl RenderSession for FakeSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        if !url.starts_with(LISTING) {
            bail!("unreachable {url}");
        }
        self.loaded = true;
        self.current = 0;
        Ok(())
    }

    async fn content(&mut self) -> Result<String> {
        if !self.loaded {
            return Ok(String::from("<html><body></body></html>"));
        }
        let number = self.current + 1;
        let has_next = self.has_next();
        let page = &mut self.pages[self.current];
        let elapsed = page.shown_at.get_or_insert_with(Instant::now).elapsed();

        let mut html = String::from("<html><body>");
        if self.banner {
            html.push_str(r#"<div id="consent"><button id="reject">Tout refuser</button></div>"#);
        }
        if self.modal {
            html.push_str(r#"<div class="modal"><button class="close-modal">x</button></div>"#);
        }
        html.push_str(r#"<div class="reviews">"#);
        if elapsed >= page.render_delay {
            for i in 0..page.reviews {
                html.push_str(&format!(
                    r#"<div class="review"><h3 class="title">Review {number}-{i}</h3><span class="score">8,5</span></div>"#
                ));
            }
        }
        html.push_str("</div>");
        if has_next {
            html.push_str(&format!(r#"<a class="next" href="?page={}">Next</a>"#, number + 1));
        } else {
            html.push_str(r#"<a class="next disabled">Next</a>"#);
        }
        if page.challenge.is_some_and(|until| elapsed < until) {
            html.push_str(CAPTCHA);
        }
        html.push_str("</body></html>");
        Ok(html)
    }

    async fn click(&mut self, selector: &str) -> Result<Click> {
        match selector {
            "#reject" if self.banner => {
                self.banner = false;
                self.modal = true;
                return Ok(Click::Clicked);
            }
            "button.close-modal" if self.modal => {
                self.modal = false;
                return Ok(Click::Clicked);
            }
            "a.next" if self.has_next() => (),
            _ => return Ok(Click::Missing),
        }
        self.clicks += 1;
        if self.stale_clicks > 0 {
            self.stale_clicks -= 1;
        } else {
            self.current += 1;
        }
        Ok(Click::Clicked)
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(format!("{LISTING}?page={}", self.current + 1))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Fails the appends whose (1-based) call number is listed.
#[derive(Default)]
struct FailingSink {
    fail_calls: HashSet<usize>,
    calls: usize,
    records: Vec<Record>,
}

impl RecordSink for FailingSink {
    fn append(&mut self, records: &[Record]) -> anyhow::Result<()> {
        self.calls += 1;
        if self.fail_calls.contains(&self.calls) {
            bail!("disk full");
        }
        self.records.extend_from_slice(records);
        Ok(())
    }
}

/// Hands out scripted sessions in order, `None` entries fail to open.
struct FakeRenderer {
    sessions: Mutex<VecDeque<Option<FakeSession>>>,
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn new_session(&self) -> Result<Box<dyn RenderSession>> {
        let next = self.sessions.lock().unwrap().pop_front().flatten();
        match next {
            Some(session) => Ok(Box::new(session)),
            None => bail!("browser crashed"),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

fn site(conf: &CrawlerConfig) -> Site {
    Site::compile(&site_config(), conf).unwrap()
}

fn site_config() -> SiteConfig {
    SiteConfig {
        name: "fake".into(),
        listing_urls: vec![LISTING.into()],
        container: ".review".into(),
        fields: vec![
            FieldRule::text("content", ".title"),
            FieldRule::text("score", ".score").with_parse(Parse::Number { pattern: None }),
        ],
        guard: GuardConfig::default(),
        pagination: PaginationConfig {
            next: "a.next".into(),
            disabled_class: Some("disabled".into()),
        },
        consent: None,
    }
}

fn conf() -> CrawlerConfig {
    CrawlerConfig {
        pacing: Pacing::none(),
        ..Default::default()
    }
}

fn titles(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.value("content").unwrap().to_string())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn crawls_every_page_until_exhausted() {
    let conf = conf();
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[3, 0, 2]);
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::Exhausted);
    assert_eq!(summary.pages_visited, 3);
    assert_eq!(summary.page_reached, 3);
    assert_eq!(summary.records_written, 5);
    assert!(!summary.is_fatal());
    // the empty page 2 is not written
    assert_eq!(sink.batches.len(), 2);
    let records: Vec<Record> = sink.records().cloned().collect();
    assert_eq!(
        titles(&records),
        vec!["Review 1-0", "Review 1-1", "Review 1-2", "Review 3-0", "Review 3-1"]
    );
    assert_eq!(records[0].value("score"), Some(&FieldValue::Number(8.5)));
}

#[tokio::test(start_paused = true)]
async fn stops_at_page_budget() {
    let conf = CrawlerConfig {
        max_pages: NonZeroUsize::new(2),
        ..conf()
    };
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[1, 1, 1, 1, 1]);
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::BudgetReached);
    assert_eq!(summary.pages_visited, 2);
    assert_eq!(summary.records_written, 2);
    assert_eq!(session.clicks, 1);
}

#[tokio::test(start_paused = true)]
async fn budget_on_last_page_is_exhaustion() {
    let conf = CrawlerConfig {
        max_pages: NonZeroUsize::new(3),
        ..conf()
    };
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[1, 1, 1]);
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::Exhausted);
    assert_eq!(summary.records_written, 3);
}

#[tokio::test(start_paused = true)]
async fn unresolved_challenge_is_fatal() {
    let conf = CrawlerConfig {
        guard_max_wait: 30.0,
        ..conf()
    };
    let site = site(&conf);
    let mut session = FakeSession::new(vec![
        FakePage::new(2),
        FakePage::new(2).challenged_for(Duration::MAX),
        FakePage::new(2),
    ]);
    let mut sink = MemorySink::default();

    let started = Instant::now();
    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::GuardTimeout);
    assert!(summary.is_fatal());
    assert_eq!(summary.page_reached, 1);
    assert_eq!(summary.records_written, 2);
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn resolved_challenge_resumes_on_the_same_page() {
    let conf = conf();
    let site = site(&conf);
    let mut session = FakeSession::new(vec![
        FakePage::new(1),
        FakePage::new(2).challenged_for(Duration::from_secs(20)),
        FakePage::new(1),
    ]);
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::Exhausted);
    assert_eq!(summary.pages_visited, 3);
    // page 2 is neither skipped nor extracted twice
    let records: Vec<Record> = sink.records().cloned().collect();
    assert_eq!(
        titles(&records),
        vec!["Review 1-0", "Review 2-0", "Review 2-1", "Review 3-0"]
    );
    assert_eq!(session.clicks, 2);
}

#[tokio::test(start_paused = true)]
async fn slow_page_is_extracted_again() {
    let conf = conf();
    let site = site(&conf);
    let mut session = FakeSession::new(vec![
        FakePage::new(12),
        FakePage::new(12),
        FakePage::new(12).rendered_after(Duration::from_secs(11)),
        FakePage::new(12),
        FakePage::new(12),
    ]);
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::Exhausted);
    assert_eq!(summary.pages_visited, 5);
    assert_eq!(summary.records_written, 60);
    assert_eq!(sink.batches.iter().map(Vec::len).collect::<Vec<_>>(), [12; 5]);
}

#[tokio::test(start_paused = true)]
async fn stale_next_control_is_retried() {
    let conf = conf();
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[1, 1, 1]);
    session.stale_clicks = 1;
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::Exhausted);
    assert_eq!(
        titles(&sink.records().cloned().collect::<Vec<_>>()),
        vec!["Review 1-0", "Review 2-0", "Review 3-0"]
    );
    assert_eq!(session.clicks, 3);
}

#[tokio::test(start_paused = true)]
async fn dead_next_control_ends_in_navigation_error() {
    let conf = conf();
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[1, 1, 1]);
    session.stale_clicks = usize::MAX;
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::NavigationError);
    assert_eq!(summary.page_reached, 1);
    assert_eq!(summary.records_written, 1);
    assert_eq!(session.clicks, conf.max_navigation_attempts);
}

#[tokio::test(start_paused = true)]
async fn failed_write_is_retried_once() {
    let conf = conf();
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[2, 2, 2]);
    let mut sink = FailingSink {
        fail_calls: HashSet::from([2]),
        ..Default::default()
    };

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::Exhausted);
    assert_eq!(summary.records_written, 6);
    assert_eq!(summary.records_lost, 0);
    assert_eq!(sink.calls, 4);
}

#[tokio::test(start_paused = true)]
async fn lost_batch_does_not_stop_traversal() {
    let conf = conf();
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[2, 2, 2]);
    let mut sink = FailingSink {
        fail_calls: HashSet::from([2, 3]),
        ..Default::default()
    };

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::Exhausted);
    assert_eq!(summary.records_written, 4);
    assert_eq!(summary.records_lost, 2);
    assert_eq!(summary.pages_lost, vec![2]);
    assert_eq!(
        titles(&sink.records),
        vec!["Review 1-0", "Review 1-1", "Review 3-0", "Review 3-1"]
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_listing_is_a_renderer_error() {
    let conf = conf();
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[1]);
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        "https://reviews.test/gone",
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::RendererError);
    assert!(summary.error.unwrap().contains("unreachable"));
    assert_eq!(summary.records_written, 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_keeps_persisted_pages() {
    let conf = CrawlerConfig {
        pacing: Pacing {
            min: 10.0,
            max: 10.0,
        },
        ..conf()
    };
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[2, 2, 2, 2, 2]);
    let mut sink = MemorySink::default();
    let (handle, cancel) = cancellation();

    let crawl = crawl_listing(&conf, &site, LISTING, &mut session, &mut sink, &cancel);
    let stop = async {
        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.cancel();
    };
    let (summary, ()) = tokio::join!(crawl, stop);

    assert_eq!(summary.termination, Termination::Cancelled);
    assert!(!summary.is_fatal());
    assert_eq!(summary.records_written, 4);
    assert!(sink.batches.iter().all(|batch| batch.len() == 2));
}

#[tokio::test(start_paused = true)]
async fn cancellation_while_waiting_for_next_page() {
    let conf = CrawlerConfig {
        max_navigation_attempts: 1,
        ..conf()
    };
    let site = site(&conf);
    let mut session = FakeSession::with_reviews(&[1, 1]);
    session.stale_clicks = usize::MAX;
    let mut sink = MemorySink::default();
    let (handle, cancel) = cancellation();

    let crawl = crawl_listing(&conf, &site, LISTING, &mut session, &mut sink, &cancel);
    let stop = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
    };
    let (summary, ()) = tokio::join!(crawl, stop);

    assert_eq!(summary.termination, Termination::Cancelled);
    assert!(!summary.is_fatal());
    assert_eq!(summary.records_written, 1);
    assert_eq!(session.clicks, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_while_awaiting_challenge() {
    let conf = conf();
    let site = site(&conf);
    let mut session = FakeSession::new(vec![FakePage::new(2).challenged_for(Duration::MAX)]);
    let mut sink = MemorySink::default();
    let (handle, cancel) = cancellation();

    let started = Instant::now();
    let crawl = crawl_listing(&conf, &site, LISTING, &mut session, &mut sink, &cancel);
    let stop = async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.cancel();
    };
    let (summary, ()) = tokio::join!(crawl, stop);

    assert_eq!(summary.termination, Termination::Cancelled);
    assert_eq!(summary.pages_visited, 0);
    assert_eq!(summary.records_written, 0);
    assert!(started.elapsed() < conf.guard_max_wait());
}

#[tokio::test(start_paused = true)]
async fn consent_banner_is_rejected_before_extraction() {
    let conf = conf();
    let site = Site::compile(
        &SiteConfig {
            consent: Some(ConsentConfig {
                banner: "#consent".into(),
                reject: "#reject".into(),
                dismiss: Some("button.close-modal".into()),
            }),
            ..site_config()
        },
        &conf,
    )
    .unwrap();
    let mut session = FakeSession::with_reviews(&[2, 1]).with_consent_banner();
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::Exhausted);
    assert_eq!(summary.records_written, 3);
    assert!(!session.banner);
    assert!(!session.modal);
}

#[tokio::test(start_paused = true)]
async fn missing_consent_banner_is_ignored() {
    let conf = conf();
    let site = Site::compile(
        &SiteConfig {
            consent: Some(ConsentConfig {
                banner: "#consent".into(),
                reject: "#reject".into(),
                dismiss: None,
            }),
            ..site_config()
        },
        &conf,
    )
    .unwrap();
    let mut session = FakeSession::with_reviews(&[1]);
    let mut sink = MemorySink::default();

    let summary = crawl_listing(
        &conf,
        &site,
        LISTING,
        &mut session,
        &mut sink,
        &Cancellation::never(),
    )
    .await;

    assert_eq!(summary.termination, Termination::Exhausted);
    assert_eq!(summary.records_written, 1);
}

fn listings(n: usize) -> Vec<Listing> {
    (1..=n)
        .map(|i| Listing {
            url: format!("{LISTING}/{i}"),
            sink: Box::new(MemorySink::default()),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn listings_are_reported_in_input_order() {
    let conf = CrawlerConfig {
        max_concurrent_listings: 3,
        ..conf()
    };
    let site = site(&conf);
    let renderer = FakeRenderer {
        sessions: Mutex::new(VecDeque::from([
            Some(FakeSession::new(vec![
                FakePage::new(1).rendered_after(Duration::from_secs(5)),
                FakePage::new(1),
                FakePage::new(1),
            ])),
            Some(FakeSession::with_reviews(&[1])),
            Some(FakeSession::with_reviews(&[1, 1])),
        ])),
    };

    let summaries =
        crawl_listings(&conf, &site, &renderer, listings(3), &Cancellation::never()).await;

    assert_eq!(
        summaries.iter().map(|s| s.listing.as_str()).collect::<Vec<_>>(),
        [
            format!("{LISTING}/1"),
            format!("{LISTING}/2"),
            format!("{LISTING}/3")
        ]
    );
    assert!(summaries
        .iter()
        .all(|s| s.termination == Termination::Exhausted));
    assert_eq!(summaries.iter().map(|s| s.records_written).sum::<usize>(), 6);
}

#[tokio::test(start_paused = true)]
async fn session_that_fails_to_open_is_a_renderer_error() {
    let conf = CrawlerConfig {
        max_concurrent_listings: 1,
        ..conf()
    };
    let site = site(&conf);
    let renderer = FakeRenderer {
        sessions: Mutex::new(VecDeque::from([
            Some(FakeSession::with_reviews(&[2])),
            None,
            Some(FakeSession::with_reviews(&[1, 1])),
        ])),
    };

    let summaries =
        crawl_listings(&conf, &site, &renderer, listings(3), &Cancellation::never()).await;

    assert_eq!(
        summaries.iter().map(|s| s.termination).collect::<Vec<_>>(),
        [
            Termination::Exhausted,
            Termination::RendererError,
            Termination::Exhausted
        ]
    );
    let failed = &summaries[1];
    assert!(failed.is_fatal());
    assert_eq!(failed.page_reached, 1);
    assert!(failed.error.as_deref().unwrap().contains("browser crashed"));
    assert_eq!(summaries[2].records_written, 2);
}

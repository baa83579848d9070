use std::time::Duration;

use anyhow::Context;
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cancel::Cancellation;
use crate::config::{CrawlerConfig, Pacing};
use crate::extract::parse_selector;
use crate::guard::{Guard, GuardStatus};
use crate::renderer::{contains, Click, RenderSession};

const MODAL_WAIT: Duration = Duration::from_secs(5);

/// Pagination control of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationConfig {
    /// Selector of the "next page" control
    pub next: String,
    /// Class marking the control as disabled on the last page
    #[serde(default = "default_disabled_class")]
    pub disabled_class: Option<String>,
}

fn default_disabled_class() -> Option<String> {
    Some(String::from("disabled"))
}

/// Cookie consent banner shown on first visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentConfig {
    pub banner: String,
    /// Button rejecting all cookies
    pub reject: String,
    /// Optional modal that pops up once the banner is gone
    #[serde(default)]
    pub dismiss: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationResult {
    Advanced,
    BlockedByGuard,
    NoSuchControl,
}

#[derive(Debug, Clone)]
struct Consent {
    banner: Selector,
    reject: String,
    dismiss: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Navigator {
    next_css: String,
    next: Selector,
    disabled_class: Option<String>,
    containers: Selector,
    consent: Option<Consent>,
    pacing: Pacing,
    render_timeout: Duration,
    poll_interval: Duration,
}

impl Navigator {
    pub fn new(
        pagination: &PaginationConfig,
        consent: Option<&ConsentConfig>,
        containers: &Selector,
        crawler_conf: &CrawlerConfig,
    ) -> anyhow::Result<Self> {
        let consent = consent
            .map(|c| {
                parse_selector(&c.banner)
                    .context("Consent banner selector")
                    .map(|banner| Consent {
                        banner,
                        reject: c.reject.clone(),
                        dismiss: c.dismiss.clone(),
                    })
            })
            .transpose()?;
        Ok(Self {
            next_css: pagination.next.clone(),
            next: parse_selector(&pagination.next).context("Pagination selector")?,
            disabled_class: pagination.disabled_class.clone(),
            containers: containers.clone(),
            consent,
            pacing: crawler_conf.pacing,
            render_timeout: crawler_conf.render_timeout(),
            poll_interval: crawler_conf.poll_interval(),
        })
    }

    /// Whether the page offers an enabled "next" control.
    pub fn has_next(&self, html: &str) -> bool {
        let document = Html::parse_document(html);
        let Some(control) = document.select(&self.next).next() else {
            return false;
        };
        let element = control.value();
        let disabled_by_class = self
            .disabled_class
            .as_deref()
            .is_some_and(|class| element.classes().any(|c| c == class));
        let disabled_by_attr = element.attr("disabled").is_some()
            || element
                .attr("aria-disabled")
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        !(disabled_by_class || disabled_by_attr)
    }

    /// Clicks "next" and confirms the page actually changed.
    ///
    /// A successful advance is followed by the pacing delay. Cancellation while waiting
    /// for the change is reported as `NoSuchControl`, the caller observes the signal on
    /// its next guard check.
    pub async fn advance(
        &self,
        session: &mut dyn RenderSession,
        guard: &Guard,
        cancel: &Cancellation,
    ) -> anyhow::Result<NavigationResult> {
        let before = self.fingerprint(session).await?;

        if session.click(&self.next_css).await? == Click::Missing {
            log::warn!("Next control {:?} missing or stale", self.next_css);
            return Ok(NavigationResult::NoSuchControl);
        }

        let deadline = Instant::now() + self.render_timeout;
        loop {
            let html = session.content().await?;
            let after = self.fingerprint_of(&session.current_url().await?, &html);
            if after != before {
                if guard.detect(&html) == GuardStatus::Challenged {
                    return Ok(NavigationResult::BlockedByGuard);
                }
                self.pace(cancel).await;
                return Ok(NavigationResult::Advanced);
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "Page unchanged {:?} after clicking next",
                    self.render_timeout
                );
                return Ok(match guard.detect(&html) {
                    GuardStatus::Clear => NavigationResult::NoSuchControl,
                    _ => NavigationResult::BlockedByGuard,
                });
            }
            if cancel.sleep(self.poll_interval).await {
                return Ok(NavigationResult::NoSuchControl);
            }
        }
    }

    /// Sleeps a random delay drawn from the pacing bounds, returns `true` if cancelled.
    pub async fn pace(&self, cancel: &Cancellation) -> bool {
        let delay = self.pacing.sample();
        log::debug!("Pacing for {:.2}s", delay.as_secs_f32());
        cancel.sleep(delay).await
    }

    /// Rejects the cookie banner when there is one, failures are only logged.
    pub async fn dismiss_consent(
        &self,
        session: &mut dyn RenderSession,
        cancel: &Cancellation,
    ) -> anyhow::Result<()> {
        let Some(consent) = &self.consent else {
            return Ok(());
        };
        if !contains(&session.content().await?, &consent.banner) {
            log::info!("No consent banner detected");
            return Ok(());
        }

        log::info!("Consent banner detected, rejecting cookies");
        if session.click(&consent.reject).await? == Click::Missing {
            log::warn!("Consent reject button {:?} not found", consent.reject);
            return Ok(());
        }

        let deadline = Instant::now() + self.render_timeout;
        while contains(&session.content().await?, &consent.banner) {
            if Instant::now() >= deadline {
                log::warn!("Consent banner still visible after rejecting");
                return Ok(());
            }
            if cancel.sleep(self.poll_interval).await {
                return Ok(());
            }
        }
        if self.pace(cancel).await {
            return Ok(());
        }

        if let Some(dismiss) = &consent.dismiss {
            let wait = self.render_timeout.min(MODAL_WAIT);
            if session.wait_for(dismiss, wait).await? {
                match session.click(dismiss).await? {
                    Click::Clicked => log::info!("Follow-up modal closed"),
                    Click::Missing => log::warn!("Follow-up modal vanished before closing"),
                }
            } else {
                log::info!("No follow-up modal after consent");
            }
        }
        Ok(())
    }

    async fn fingerprint(&self, session: &mut dyn RenderSession) -> anyhow::Result<String> {
        let html = session.content().await?;
        let url = session.current_url().await?;
        Ok(self.fingerprint_of(&url, &html))
    }

    /// Identity of a listing page: its URL, its record containers and its pagination
    /// control. Unrelated parts of the document (ads, timers) are left out.
    pub(crate) fn fingerprint_of(&self, url: &str, html: &str) -> String {
        let document = Html::parse_document(html);
        let mut fingerprint = String::from(url);
        for element in document.select(&self.containers) {
            canonical(element, &mut fingerprint);
        }
        if let Some(control) = document.select(&self.next).next() {
            canonical(control, &mut fingerprint);
        }
        fingerprint
    }
}

/// Serializes a subtree with attributes sorted by name, parsing keeps no stable order.
fn canonical(element: ElementRef, out: &mut String) {
    for node in element.descendants() {
        match node.value() {
            Node::Element(el) => {
                let mut attrs: Vec<_> = el.attrs().collect();
                attrs.sort_unstable();
                out.push('<');
                out.push_str(el.name());
                for (name, value) in attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(value);
                    out.push('"');
                }
                out.push('>');
            }
            Node::Text(text) => out.push_str(text),
            _ => (),
        }
    }
}

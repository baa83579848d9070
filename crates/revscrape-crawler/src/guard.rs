use std::time::Duration;

use anyhow::Context;
use scraper::{Html, Node, Selector};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cancel::Cancellation;
use crate::extract::{collapse_whitespace, parse_selector};
use crate::renderer::RenderSession;

/// Bot-challenge indicators of a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardConfig {
    /// Selectors of challenge frames or modals
    #[serde(default = "default_frame_selectors")]
    pub frame_selectors: Vec<String>,
    /// Human-verification phrases, matched case-insensitively in the page text
    #[serde(default = "default_text_patterns")]
    pub text_patterns: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            frame_selectors: default_frame_selectors(),
            text_patterns: default_text_patterns(),
        }
    }
}

fn default_frame_selectors() -> Vec<String> {
    vec![
        r#"iframe[src*="captcha"]"#.into(),
        r#"iframe[src*="recaptcha"]"#.into(),
    ]
}

fn default_text_patterns() -> Vec<String> {
    vec!["Please verify you are a human".into()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStatus {
    Clear,
    Challenged,
    AwaitingResolution,
}

/// Outcome of waiting for a challenge to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Guard {
    frames: Vec<Selector>,
    texts: Vec<String>,
}

impl Guard {
    pub fn new(config: &GuardConfig) -> anyhow::Result<Self> {
        let frames = config
            .frame_selectors
            .iter()
            .map(|css| parse_selector(css).context("Guard frame selector"))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let texts = config
            .text_patterns
            .iter()
            .map(|t| collapse_whitespace(t).to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Ok(Self { frames, texts })
    }

    /// Either `Clear` or `Challenged`, depends on nothing but `html`.
    pub fn detect(&self, html: &str) -> GuardStatus {
        let document = Html::parse_document(html);
        if self
            .frames
            .iter()
            .any(|frame| document.select(frame).next().is_some())
        {
            return GuardStatus::Challenged;
        }
        if !self.texts.is_empty() {
            let text = collapse_whitespace(&visible_text(&document)).to_lowercase();
            if self.texts.iter().any(|pattern| text.contains(pattern.as_str())) {
                return GuardStatus::Challenged;
            }
        }
        GuardStatus::Clear
    }

    /// Polls the session until the challenge is gone, `max_wait` elapses or the run is
    /// cancelled. Who solves the challenge (a human in the visible browser, a solving
    /// service) is none of the guard's business.
    pub async fn await_resolution(
        &self,
        session: &mut dyn RenderSession,
        poll_interval: Duration,
        max_wait: Duration,
        cancel: &Cancellation,
    ) -> anyhow::Result<Resolution> {
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Resolution::TimedOut);
            }
            if cancel.sleep(poll_interval.min(remaining)).await {
                return Ok(Resolution::Cancelled);
            }
            let html = match cancel.run(session.content()).await {
                Some(html) => html?,
                None => return Ok(Resolution::Cancelled),
            };
            if self.detect(&html) == GuardStatus::Clear {
                return Ok(Resolution::Resolved);
            }
        }
    }
}

const HIDDEN: [&str; 4] = ["script", "style", "noscript", "template"];

/// Text of the document minus the contents of non-rendered elements.
fn visible_text(document: &Html) -> String {
    let mut text = String::new();
    for node in document.root_element().descendants() {
        let Node::Text(chunk) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| HIDDEN.contains(&el.name()))
        });
        if !hidden {
            text.push_str(chunk);
        }
    }
    text
}

//! Page Renderer abstraction.
//!
//! The engine never talks to a browser directly: it drives a [`RenderSession`] (one tab,
//! exclusively owned by one listing) obtained from a [`Renderer`] (the browser engine).

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use scraper::Html;

use crate::extract::parse_selector;

/// A browser engine able to open rendering sessions.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Open a new session (tab) for one listing.
    async fn new_session(&self) -> Result<Box<dyn RenderSession>>;
    /// Shut down the engine, sessions must have been closed before.
    async fn shutdown(&self) -> Result<()>;
}

/// Outcome of clicking an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Click {
    Clicked,
    /// No element matched, or it went stale before the click landed
    Missing,
}

/// A single rendering session.
///
/// Errors returned by these methods are renderer-level failures (crashed browser,
/// unreachable page) and are fatal for the listing.
#[async_trait]
pub trait RenderSession: Send {
    /// Load `url` and wait for the document to be ready.
    async fn goto(&mut self, url: &str) -> Result<()>;

    /// Rendered HTML of the current document.
    async fn content(&mut self) -> Result<String>;

    /// Click the first element matching a CSS selector.
    async fn click(&mut self, selector: &str) -> Result<Click>;

    async fn current_url(&mut self) -> Result<String>;

    async fn close(self: Box<Self>) -> Result<()>;

    /// Wait up to `timeout` for an element matching `selector` to be rendered.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool> {
        let selector = parse_selector(selector)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let html = self.content().await?;
            if contains(&html, &selector) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(DEFAULT_POLL).await;
        }
    }
}

const DEFAULT_POLL: Duration = Duration::from_millis(250);

/// Whether a rendered document contains an element matching `selector`.
pub fn contains(html: &str, selector: &scraper::Selector) -> bool {
    Html::parse_document(html).select(selector).next().is_some()
}

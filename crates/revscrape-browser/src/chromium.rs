use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use revscrape_crawler::{Click, RenderSession, Renderer};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    /// Run without a visible window, challenges then can't be solved by hand
    pub headless: bool,
    /// Chrome binary, auto detected when `None`
    pub executable: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            user_agent: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Renders listings in a Chromium instance driven over the DevTools protocol, one tab
/// per session.
pub struct ChromiumRenderer {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
}

impl ChromiumRenderer {
    pub async fn launch(config: &ChromiumConfig) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(config.request_timeout)
            .window_size(1920, 1080)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &config.executable {
            builder = builder.chrome_executable(executable);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.arg(format!("--user-agent={user_agent}"));
        }
        let browser_config = builder
            .build()
            .map_err(|e| anyhow!("Invalid browser config: {e}"))?;

        log::info!(
            "Launching Chromium ({})",
            if config.headless { "headless" } else { "headed" }
        );
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Couldn't launch Chromium")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::debug!("Browser handler error: {e:?}");
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(browser),
            handler,
        })
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn new_session(&self) -> Result<Box<dyn RenderSession>> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .context("Couldn't open a new tab")?;
        Ok(Box::new(ChromiumSession { page }))
    }

    async fn shutdown(&self) -> Result<()> {
        let mut browser = self.browser.lock().await;
        let closed = browser.close().await;
        if let Err(e) = browser.wait().await {
            log::warn!("Couldn't wait for Chromium to exit: {e}");
        }
        self.handler.abort();
        closed.context("Couldn't close Chromium")?;
        Ok(())
    }
}

pub struct ChromiumSession {
    page: Page,
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Couldn't load {url}"))?;
        self.page
            .wait_for_navigation()
            .await
            .with_context(|| format!("Couldn't finish loading {url}"))?;
        Ok(())
    }

    async fn content(&mut self) -> Result<String> {
        self.page
            .content()
            .await
            .context("Couldn't read page content")
    }

    async fn click(&mut self, selector: &str) -> Result<Click> {
        let element = match self.page.find_element(selector).await {
            Ok(element) => element,
            Err(e) => {
                log::debug!("No element {selector:?} to click: {e}");
                return Ok(Click::Missing);
            }
        };
        match element.click().await {
            Ok(_) => Ok(Click::Clicked),
            Err(e) => {
                log::debug!("Click on {selector:?} failed: {e}");
                Ok(Click::Missing)
            }
        }
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await
            .context("Couldn't read page URL")?
            .unwrap_or_default())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.page.close().await.context("Couldn't close tab")
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

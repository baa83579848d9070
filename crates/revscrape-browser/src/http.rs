use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use revscrape_crawler::{contains, Click, RenderSession, Renderer};
use scraper::{Html, Selector};

/// Fetches server-rendered pages without running any script.
///
/// Clicking follows the `href` of the matched element, so only listings paginated with
/// plain links can be traversed.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(user_agent: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::ClientBuilder::new()
            .gzip(true)
            .deflate(true)
            .timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn new_session(&self) -> Result<Box<dyn RenderSession>> {
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            url: None,
            html: String::new(),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub struct HttpSession {
    client: reqwest::Client,
    url: Option<Url>,
    html: String,
}

impl HttpSession {
    async fn load(&mut self, url: Url) -> Result<()> {
        log::debug!("GET {url}");
        let html = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .with_context(|| format!("Couldn't download {url}"))?
            .text()
            .await
            .with_context(|| format!("Couldn't read body of {url}"))?;
        self.html = html;
        self.url = Some(url);
        Ok(())
    }
}

#[async_trait]
impl RenderSession for HttpSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        let url = Url::parse(url).with_context(|| format!("Invalid URL {url:?}"))?;
        self.load(url).await
    }

    async fn content(&mut self) -> Result<String> {
        Ok(self.html.clone())
    }

    async fn click(&mut self, selector: &str) -> Result<Click> {
        let Some(base) = &self.url else {
            return Ok(Click::Missing);
        };
        match link_target(&self.html, base, selector)? {
            Some(target) => {
                self.load(target).await?;
                Ok(Click::Clicked)
            }
            None => Ok(Click::Missing),
        }
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self.url.as_ref().map(Url::to_string).unwrap_or_default())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    /// A downloaded page never changes, there is nothing to wait for.
    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<bool> {
        Ok(contains(&self.html, &parse(selector)?))
    }
}

fn parse(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow!("Invalid selector {selector:?}: {e:?}"))
}

/// Absolute URL of the first element matching `selector`, if it is a link.
fn link_target(html: &str, base: &Url, selector: &str) -> Result<Option<Url>> {
    let selector = parse(selector)?;
    let document = Html::parse_document(html);
    let Some(href) = document
        .select(&selector)
        .next()
        .and_then(|element| element.value().attr("href"))
    else {
        return Ok(None);
    };
    match base.join(href.trim()) {
        Ok(url) => Ok(Some(url)),
        Err(e) => {
            log::warn!("Ignoring invalid link {href:?}: {e}");
            Ok(None)
        }
    }
}

use anyhow::Context;
use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::config::CrawlerConfig;
use crate::extract::{extract_page, parse_selector, Extractor, PageBatch};
use crate::guard::{Guard, GuardConfig};
use crate::navigator::{ConsentConfig, Navigator, PaginationConfig};
use crate::rules::FieldRule;

/// Everything site specific: where records live, how fields are read, what a challenge
/// looks like and how pagination works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    pub name: String,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    /// Selector of one record container
    pub container: String,
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub guard: GuardConfig,
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub consent: Option<ConsentConfig>,
}

/// A [`SiteConfig`] with all of its selectors and patterns compiled.
#[derive(Debug, Clone)]
pub struct Site {
    pub name: String,
    container_css: String,
    container: Selector,
    extractor: Extractor,
    guard: Guard,
    navigator: Navigator,
}

impl Site {
    pub fn compile(config: &SiteConfig, crawler_conf: &CrawlerConfig) -> anyhow::Result<Self> {
        crawler_conf.validate().context("Invalid crawler config")?;
        let context = || format!("Invalid site config {:?}", config.name);
        let container = parse_selector(&config.container).with_context(context)?;
        let extractor = Extractor::new(&config.fields).with_context(context)?;
        let guard = Guard::new(&config.guard).with_context(context)?;
        let navigator = Navigator::new(
            &config.pagination,
            config.consent.as_ref(),
            &container,
            crawler_conf,
        )
        .with_context(context)?;
        Ok(Self {
            name: config.name.clone(),
            container_css: config.container.clone(),
            container,
            extractor,
            guard,
            navigator,
        })
    }

    pub fn columns(&self) -> Vec<String> {
        self.extractor.columns()
    }

    pub fn container_css(&self) -> &str {
        &self.container_css
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    pub fn extract_page(&self, html: &str, keep_empty: bool) -> PageBatch {
        extract_page(html, &self.container, &self.extractor, keep_empty)
    }
}

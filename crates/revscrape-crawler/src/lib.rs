mod cancel;
mod config;
mod crawler;
mod extract;
mod guard;
mod navigator;
mod record;
mod renderer;
mod rules;
mod sink;
mod site;

pub use cancel::{cancellation, CancelHandle, Cancellation};
pub use config::{CrawlerConfig, Pacing};
pub use crawler::{crawl_listing, crawl_listings, CrawlSummary, Listing, PageState, Termination};
pub use extract::{extract_page, Container, Detached, Extractor, PageBatch};
pub use guard::{Guard, GuardConfig, GuardStatus, Resolution};
pub use navigator::{ConsentConfig, NavigationResult, Navigator, PaginationConfig};
pub use record::{Absence, Field, FieldValue, Record};
pub use renderer::{contains, Click, RenderSession, Renderer};
pub use rules::{DateTable, FieldRule, Locator, Parse, Read};
pub use sink::{MemorySink, RecordSink};
pub use site::{Site, SiteConfig};

pub use anyhow;
pub use scraper;

use std::cmp;
use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::bail;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Run parameters of the pagination driver.
///
/// Durations are expressed in seconds. Every field has a default so that a partial YAML
/// file (or none at all) yields a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerConfig {
    /// Maximum number of listing pages to visit, `None` means unbounded
    #[serde(default = "default_max_pages")]
    pub max_pages: Option<NonZeroUsize>,

    #[serde(default = "default_pacing")]
    pub pacing: Pacing,

    #[serde(default = "default_guard_poll_interval")]
    pub guard_poll_interval: f32,

    #[serde(default = "default_guard_max_wait")]
    pub guard_max_wait: f32,

    /// Upper bound of every wait on the renderer (containers, page changes, banners)
    #[serde(default = "default_render_timeout")]
    pub render_timeout: f32,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: f32,

    #[serde(default = "default_empty_page_retries")]
    pub empty_page_retries: usize,

    #[serde(default = "default_empty_page_retry_delay")]
    pub empty_page_retry_delay: f32,

    #[serde(default = "default_persist_retries")]
    pub persist_retries: usize,

    #[serde(default = "default_max_navigation_attempts")]
    pub max_navigation_attempts: usize,

    #[serde(default)]
    pub keep_empty_records: bool,

    #[serde(default = "default_max_concurrent_listings")]
    pub max_concurrent_listings: usize,

    #[serde(default = "default_handle_sigint")]
    pub handle_sigint: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            pacing: default_pacing(),
            guard_poll_interval: default_guard_poll_interval(),
            guard_max_wait: default_guard_max_wait(),
            render_timeout: default_render_timeout(),
            poll_interval: default_poll_interval(),
            empty_page_retries: default_empty_page_retries(),
            empty_page_retry_delay: default_empty_page_retry_delay(),
            persist_retries: default_persist_retries(),
            max_navigation_attempts: default_max_navigation_attempts(),
            keep_empty_records: false,
            max_concurrent_listings: default_max_concurrent_listings(),
            handle_sigint: default_handle_sigint(),
        }
    }
}

impl CrawlerConfig {
    /// Rejects durations that are negative, infinite or NaN.
    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("pacing.min", self.pacing.min),
            ("pacing.max", self.pacing.max),
            ("guardPollInterval", self.guard_poll_interval),
            ("guardMaxWait", self.guard_max_wait),
            ("renderTimeout", self.render_timeout),
            ("pollInterval", self.poll_interval),
            ("emptyPageRetryDelay", self.empty_page_retry_delay),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                bail!("{name} must be a finite number of seconds >= 0, got {value}");
            }
        }
        Ok(())
    }

    pub fn guard_poll_interval(&self) -> Duration {
        secs(self.guard_poll_interval)
    }

    pub fn guard_max_wait(&self) -> Duration {
        secs(self.guard_max_wait)
    }

    pub fn render_timeout(&self) -> Duration {
        secs(self.render_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval)
    }

    pub fn empty_page_retry_delay(&self) -> Duration {
        secs(self.empty_page_retry_delay)
    }
}

fn secs(value: f32) -> Duration {
    Duration::try_from_secs_f32(value).unwrap_or_default()
}

fn default_max_pages() -> Option<NonZeroUsize> {
    None
}

fn default_pacing() -> Pacing {
    Pacing::default()
}

fn default_guard_poll_interval() -> f32 {
    2.0
}

fn default_guard_max_wait() -> f32 {
    120.0
}

fn default_render_timeout() -> f32 {
    10.0
}

fn default_poll_interval() -> f32 {
    0.25
}

fn default_empty_page_retries() -> usize {
    1
}

fn default_empty_page_retry_delay() -> f32 {
    2.0
}

fn default_persist_retries() -> usize {
    1
}

fn default_max_navigation_attempts() -> usize {
    3
}

fn default_max_concurrent_listings() -> usize {
    cmp::max(1, num_cpus::get().saturating_sub(2))
}

fn default_handle_sigint() -> bool {
    true
}

/// Bounds in seconds of the randomized delay injected after page transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pacing {
    pub min: f32,
    pub max: f32,
}

impl Default for Pacing {
    fn default() -> Self {
        Self { min: 2.0, max: 4.0 }
    }
}

impl Pacing {
    /// No delay at all, mostly useful for tests and local files.
    pub fn none() -> Self {
        Self { min: 0.0, max: 0.0 }
    }

    /// Draws a delay uniformly from `[min, max]`.
    pub fn sample(&self) -> Duration {
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        let lo = lo.max(0.0);
        let hi = hi.max(0.0);
        if hi <= lo {
            return secs(lo);
        }
        secs(rand::rng().random_range(lo..=hi))
    }
}

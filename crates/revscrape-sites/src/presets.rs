use std::path::Path;

use anyhow::Context;
use revscrape_crawler::{
    ConsentConfig, DateTable, FieldRule, GuardConfig, Locator, PaginationConfig, Parse, SiteConfig,
};
use serde::{Deserialize, Serialize};

use crate::writer::CsvWriterConfig;

pub const PRESETS: &[&str] = &["booking", "tripadvisor"];

/// A site configuration together with the CSV layout its records are written with.
///
/// This is also the shape of a custom site YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    #[serde(flatten)]
    pub site: SiteConfig,
    #[serde(default)]
    pub csv: CsvWriterConfig,
}

impl Preset {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs_err::File::open(path)?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Invalid site config file {}", path.display()))
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

pub fn preset(name: &str) -> Option<Preset> {
    match name {
        "booking" => Some(booking()),
        "tripadvisor" => Some(tripadvisor()),
        _ => None,
    }
}

/// Booking.com hotel reviews, French locale.
pub fn booking() -> Preset {
    let site = SiteConfig {
        name: "booking".into(),
        listing_urls: Vec::new(),
        container: r#"div[data-testid="review-card"]"#.into(),
        fields: vec![
            FieldRule::text("Content", r#"div[data-testid="review-title"]"#),
            // first span following the flag, whatever sits in between
            FieldRule {
                name: "Country".into(),
                locate: Locator::new(r#"div[data-testid="review-avatar"] img ~ span"#).nth(0),
                parse: None,
            },
            FieldRule::text(
                "Score",
                r#"div[data-testid="review-score"] > div > div > div"#,
            )
            .with_parse(Parse::Number { pattern: None }),
            // the first span holds the "liked" label
            FieldRule {
                name: "Positive".into(),
                locate: Locator::new(r#"div[data-testid="review-positive-text"] span"#).nth(1),
                parse: None,
            },
            FieldRule {
                name: "Negative".into(),
                locate: Locator::new(r#"div[data-testid="review-negative-text"] span"#).nth(1),
                parse: None,
            },
            FieldRule::text("Date", r#"span[data-testid="review-date"]"#).with_parse(
                Parse::Date(DateTable::french().strip("Commentaire envoyé le")),
            ),
        ],
        guard: GuardConfig::default(),
        pagination: PaginationConfig {
            next: r#"button[aria-label="Page suivante"]"#.into(),
            disabled_class: None,
        },
        consent: None,
    };
    Preset {
        site,
        csv: CsvWriterConfig::default(),
    }
}

/// TripAdvisor hotel reviews, French locale.
pub fn tripadvisor() -> Preset {
    let site = SiteConfig {
        name: "tripadvisor".into(),
        listing_urls: Vec::new(),
        container: r#"div[data-test-target="reviews-tab"] div[data-test-target="HR_CC_CARD"]"#
            .into(),
        fields: vec![
            FieldRule::text("Review", "div[data-reviewid] div div div span span"),
            FieldRule {
                name: "Rating".into(),
                locate: Locator::new("div[data-test-target] svg title").containing("bulles"),
                parse: Some(Parse::Number {
                    pattern: Some(r"(\d+(?:,\d+)?) sur".into()),
                }),
            },
        ],
        guard: GuardConfig::default(),
        pagination: PaginationConfig {
            next: r#"a[aria-label="Page suivante"]"#.into(),
            disabled_class: Some("disabled".into()),
        },
        consent: Some(ConsentConfig {
            banner: "#onetrust-banner-sdk".into(),
            reject: "#onetrust-reject-all-handler".into(),
            dismiss: Some(r#"button[data-automation="closeModal"]"#.into()),
        }),
    };
    Preset {
        site,
        csv: CsvWriterConfig {
            delimiter: ';',
            ..Default::default()
        },
    }
}

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::record::{Absence, FieldValue};

/// How to locate and parse one field of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRule {
    pub name: String,
    pub locate: Locator,
    #[serde(default)]
    pub parse: Option<Parse>,
}

impl FieldRule {
    pub fn text(name: &str, selector: &str) -> Self {
        Self {
            name: name.to_string(),
            locate: Locator::new(selector),
            parse: None,
        }
    }

    pub fn with_locator(mut self, locate: Locator) -> Self {
        self.locate = locate;
        self
    }

    pub fn with_parse(mut self, parse: Parse) -> Self {
        self.parse = Some(parse);
        self
    }
}

/// Where a field lives inside its record container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locator {
    /// CSS selector evaluated below the container
    pub selector: String,
    /// Keeps only matches whose text contains this phrase, before `nth` and `unique`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    /// Picks the n-th match (0-based) instead of the first one
    #[serde(default)]
    pub nth: Option<usize>,
    /// Several matches make the field absent instead of picking one
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub read: Read,
}

impl Locator {
    pub fn new(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            contains: None,
            nth: None,
            unique: false,
            read: Read::Text,
        }
    }

    pub fn containing(mut self, phrase: &str) -> Self {
        self.contains = Some(phrase.to_string());
        self
    }

    pub fn nth(mut self, n: usize) -> Self {
        self.nth = Some(n);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn attr(mut self, name: &str) -> Self {
        self.read = Read::Attr(name.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Read {
    /// Whitespace-collapsed text content
    #[default]
    Text,
    /// Value of an attribute
    Attr(String),
}

/// Transformation applied to the raw located string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Parse {
    /// A decimal number, `,` is accepted as decimal separator.
    ///
    /// When `pattern` is set its first capture group holds the number, otherwise the first
    /// numeric token of the input is used.
    Number {
        #[serde(default)]
        pattern: Option<String>,
    },
    /// Keeps one capture group of a regex as text.
    Pattern {
        regex: String,
        #[serde(default = "default_group")]
        group: usize,
    },
    /// A date read through an explicit table of month names and formats.
    Date(DateTable),
}

fn default_group() -> usize {
    1
}

/// Explicit date parsing table, independent from the process locale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateTable {
    /// Phrases removed before parsing, e.g. "Commentaire envoyé le"
    #[serde(default)]
    pub strip: Vec<String>,
    /// Lowercase month names mapped to their number
    #[serde(default)]
    pub months: BTreeMap<String, u32>,
    /// chrono formats tried in order once month names became numbers
    pub formats: Vec<String>,
    #[serde(default = "default_date_output")]
    pub output: String,
}

fn default_date_output() -> String {
    String::from("%Y-%m-%d")
}

impl DateTable {
    /// French month names, full and abbreviated.
    pub fn french() -> Self {
        let months = [
            ("janvier", 1),
            ("janv", 1),
            ("février", 2),
            ("fevrier", 2),
            ("févr", 2),
            ("mars", 3),
            ("avril", 4),
            ("avr", 4),
            ("mai", 5),
            ("juin", 6),
            ("juillet", 7),
            ("juil", 7),
            ("août", 8),
            ("aout", 8),
            ("septembre", 9),
            ("sept", 9),
            ("octobre", 10),
            ("oct", 10),
            ("novembre", 11),
            ("nov", 11),
            ("décembre", 12),
            ("decembre", 12),
            ("déc", 12),
        ]
        .into_iter()
        .map(|(name, n)| (name.to_string(), n))
        .collect();

        Self {
            strip: Vec::new(),
            months,
            formats: vec!["%d %m %Y".into(), "%d/%m/%Y".into()],
            output: default_date_output(),
        }
    }

    pub fn strip(mut self, phrase: &str) -> Self {
        self.strip.push(phrase.to_string());
        self
    }

    pub fn parse(&self, raw: &str) -> Option<NaiveDate> {
        let mut cleaned = raw.to_string();
        for phrase in &self.strip {
            cleaned = cleaned.replace(phrase.as_str(), " ");
        }
        let normalized = cleaned
            .split_whitespace()
            .map(|token| {
                let key = token
                    .trim_end_matches(|c| c == '.' || c == ',')
                    .to_lowercase();
                match self.months.get(&key) {
                    Some(month) => month.to_string(),
                    None => token.trim_end_matches(',').to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");

        self.formats
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(&normalized, fmt).ok())
    }
}

/// A [`Parse`] with its regexes compiled.
#[derive(Debug, Clone)]
pub(crate) enum Parser {
    Number(Option<Regex>),
    Pattern(Regex, usize),
    Date(DateTable),
}

lazy_static! {
    static ref NUMBER_TOKEN: Regex = Regex::new(r"\d+(?:[.,]\d+)?").unwrap();
}

impl Parser {
    pub(crate) fn compile(parse: &Parse) -> anyhow::Result<Self> {
        Ok(match parse {
            Parse::Number { pattern: None } => Self::Number(None),
            Parse::Number {
                pattern: Some(pattern),
            } => Self::Number(Some(
                Regex::new(pattern).with_context(|| format!("Invalid number pattern {pattern:?}"))?,
            )),
            Parse::Pattern { regex, group } => {
                let re = Regex::new(regex).with_context(|| format!("Invalid pattern {regex:?}"))?;
                if *group >= re.captures_len() {
                    return Err(anyhow!("Pattern {regex:?} has no capture group {group}"));
                }
                Self::Pattern(re, *group)
            }
            Parse::Date(table) => {
                if table.formats.is_empty() {
                    return Err(anyhow!("Date table requires at least one format"));
                }
                Self::Date(table.clone())
            }
        })
    }

    pub(crate) fn apply(&self, raw: &str) -> Result<FieldValue, Absence> {
        let unparseable = || Absence::Unparseable(raw.to_string());
        match self {
            Self::Number(pattern) => {
                let token = match pattern {
                    Some(re) => re
                        .captures(raw)
                        .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                        .map(|m| m.as_str()),
                    None => NUMBER_TOKEN.find(raw).map(|m| m.as_str()),
                };
                token
                    .and_then(|t| t.trim().replace(',', ".").parse::<f64>().ok())
                    .map(FieldValue::Number)
                    .ok_or_else(unparseable)
            }
            Self::Pattern(re, group) => re
                .captures(raw)
                .and_then(|caps| caps.get(*group))
                .map(|m| FieldValue::Text(m.as_str().trim().to_string()))
                .ok_or_else(unparseable),
            Self::Date(table) => table
                .parse(raw)
                .map(|date| FieldValue::Text(date.format(&table.output).to_string()))
                .ok_or_else(unparseable),
        }
    }
}

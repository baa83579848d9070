use anyhow::{anyhow, Context};
use scraper::{ElementRef, Html, Selector};

use crate::record::{Absence, Field, FieldValue, Record};
use crate::rules::{FieldRule, Parser, Read};

/// Returned by a [`Container`] that can no longer be queried (stale or detached node).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached;

/// A record container that field rules are evaluated against.
pub trait Container {
    /// Elements below the container matching `selector`, in document order.
    fn select_all<'s>(&'s self, selector: &Selector) -> Result<Vec<ElementRef<'s>>, Detached>;
}

impl<'a> Container for ElementRef<'a> {
    fn select_all<'s>(&'s self, selector: &Selector) -> Result<Vec<ElementRef<'s>>, Detached> {
        let found: Vec<ElementRef<'a>> = self.select(selector).collect();
        Ok(found)
    }
}

pub(crate) fn parse_selector(css: &str) -> anyhow::Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Invalid selector {css:?}: {e:?}"))
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    selector: Selector,
    contains: Option<String>,
    nth: Option<usize>,
    unique: bool,
    read: Read,
    parser: Option<Parser>,
}

/// Evaluates an ordered set of field rules against record containers.
#[derive(Debug, Clone)]
pub struct Extractor {
    rules: Vec<CompiledRule>,
}

impl Extractor {
    pub fn new(rules: &[FieldRule]) -> anyhow::Result<Self> {
        if rules.is_empty() {
            return Err(anyhow!("At least one field rule is required"));
        }
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if compiled.iter().any(|c: &CompiledRule| c.name == rule.name) {
                return Err(anyhow!("Duplicate field {:?}", rule.name));
            }
            let parser = rule
                .parse
                .as_ref()
                .map(Parser::compile)
                .transpose()
                .with_context(|| format!("Field {:?}", rule.name))?;
            compiled.push(CompiledRule {
                name: rule.name.clone(),
                selector: parse_selector(&rule.locate.selector)
                    .with_context(|| format!("Field {:?}", rule.name))?,
                contains: rule.locate.contains.clone(),
                nth: rule.locate.nth,
                unique: rule.locate.unique,
                read: rule.locate.read.clone(),
                parser,
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Field names in output order.
    pub fn columns(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name.clone()).collect()
    }

    /// Extracts one record, never failing: every rule yields a field.
    ///
    /// A container that reports itself detached yields an all-absent record, partial
    /// values read before the detachment are not kept.
    pub fn extract<C>(&self, container: &C) -> Record
    where
        C: Container + ?Sized,
    {
        let mut fields = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let field = match locate(rule, container) {
                Ok(raw) => match &rule.parser {
                    Some(parser) => match parser.apply(&raw) {
                        Ok(value) => Field::Present(value),
                        Err(absence) => Field::Absent(absence),
                    },
                    None => Field::Present(FieldValue::Text(raw)),
                },
                Err(Absence::Detached) => {
                    return Record::all_absent(self.columns(), Absence::Detached);
                }
                Err(absence) => Field::Absent(absence),
            };
            if let Field::Absent(reason) = &field {
                log::debug!("Field {} absent: {reason}", rule.name);
            }
            fields.push((rule.name.clone(), field));
        }
        Record::new(fields)
    }
}

fn locate<C>(rule: &CompiledRule, container: &C) -> Result<String, Absence>
where
    C: Container + ?Sized,
{
    let mut matches = container
        .select_all(&rule.selector)
        .map_err(|Detached| Absence::Detached)?;
    if let Some(phrase) = &rule.contains {
        matches.retain(|element| element.text().collect::<String>().contains(phrase.as_str()));
    }

    if rule.unique && matches.len() > 1 {
        return Err(Absence::Ambiguous(matches.len()));
    }

    let element = matches
        .get(rule.nth.unwrap_or(0))
        .ok_or(Absence::NotFound)?;

    let raw = match &rule.read {
        Read::Text => collapse_whitespace(&element.text().collect::<String>()),
        Read::Attr(name) => element
            .value()
            .attr(name)
            .map(|v| v.trim().to_string())
            .unwrap_or_default(),
    };

    if raw.is_empty() {
        Err(Absence::NotFound)
    } else {
        Ok(raw)
    }
}

pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Records extracted from one rendered page.
#[derive(Debug, Clone, Default)]
pub struct PageBatch {
    pub records: Vec<Record>,
    /// Containers whose record was all-absent and got dropped
    pub discarded: usize,
}

impl PageBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Parses a rendered page and extracts one record per container.
pub fn extract_page(
    html: &str,
    container: &Selector,
    extractor: &Extractor,
    keep_empty: bool,
) -> PageBatch {
    let document = Html::parse_document(html);
    let mut batch = PageBatch::default();
    for element in document.select(container) {
        let record = extractor.extract(&element);
        if record.is_all_absent() && !keep_empty {
            batch.discarded += 1;
        } else {
            batch.records.push(record);
        }
    }
    batch
}

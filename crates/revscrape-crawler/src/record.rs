use std::fmt;

/// A successfully extracted value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Why a field could not be extracted.
#[derive(Debug, Clone, PartialEq)]
pub enum Absence {
    /// No element matched, or the matched element had no text.
    NotFound,
    /// Several elements matched where exactly one was required.
    Ambiguous(usize),
    /// An element was found but its content could not be parsed.
    Unparseable(String),
    /// The record container itself could not be queried.
    Detached,
}

impl fmt::Display for Absence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::Ambiguous(n) => write!(f, "{n} ambiguous matches"),
            Self::Unparseable(raw) => write!(f, "unparseable {raw:?}"),
            Self::Detached => f.write_str("detached container"),
        }
    }
}

/// Outcome of extracting one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Present(FieldValue),
    Absent(Absence),
}

impl Field {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn value(&self) -> Option<&FieldValue> {
        match self {
            Self::Present(v) => Some(v),
            Self::Absent(_) => None,
        }
    }
}

/// One extracted review.
///
/// The field set and its order are those of the rules the record was extracted with; a
/// record is never missing a key, failed fields are [`Field::Absent`].
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Vec<(String, Field)>,
}

impl Record {
    pub(crate) fn new(fields: Vec<(String, Field)>) -> Self {
        Self { fields }
    }

    /// A record whose every field is absent for the same reason.
    pub fn all_absent<I, S>(names: I, reason: Absence) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = names
            .into_iter()
            .map(|name| (name.into(), Field::Absent(reason.clone())))
            .collect();
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, field)| field)
    }

    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.get(name).and_then(Field::value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_all_absent(&self) -> bool {
        self.fields.iter().all(|(_, f)| !f.is_present())
    }

    /// Renders the record as output cells, absent fields become `absent`.
    pub fn to_row(&self, absent: &str) -> Vec<String> {
        self.fields
            .iter()
            .map(|(_, field)| match field {
                Field::Present(v) => v.to_string(),
                Field::Absent(_) => absent.to_string(),
            })
            .collect()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, field)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match field {
                Field::Present(v) => write!(f, "{name}: {v:?}")?,
                Field::Absent(reason) => write!(f, "{name}: absent ({reason})")?,
            }
        }
        f.write_str("}")
    }
}

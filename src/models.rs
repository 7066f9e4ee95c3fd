use crate::config::{INDICATOR_SENTINEL, RECORD_ID_TAGS};
use std::fmt;

/// Location of a value inside a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Control {
        tag: String,
    },
    Data {
        tag: String,
        ind1: char,
        ind2: char,
        code: char,
    },
}

impl Address {
    pub fn control(tag: impl Into<String>) -> Self {
        Address::Control { tag: tag.into() }
    }

    /// Blank indicators are stored as the sentinel so omitted and blank compare equal.
    pub fn data(tag: impl Into<String>, ind1: Option<char>, ind2: Option<char>, code: char) -> Self {
        Address::Data {
            tag: tag.into(),
            ind1: normalize_indicator(ind1),
            ind2: normalize_indicator(ind2),
            code,
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Address::Control { tag } | Address::Data { tag, .. } => tag,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Address::Control { .. })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Control { tag } => write!(f, "{tag}"),
            Address::Data {
                tag,
                ind1,
                ind2,
                code,
            } => write!(f, "{tag}${ind1}{ind2}${code}"),
        }
    }
}

pub fn normalize_indicator(ind: Option<char>) -> char {
    match ind {
        Some(c) if !c.is_whitespace() && c != '_' => c,
        _ => INDICATOR_SENTINEL,
    }
}

/// One value at one address. `instance` numbers the enclosing field occurrence
/// so subfields of the same data field can be grouped again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub address: Address,
    pub value: String,
    pub instance: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Record {
    pub id: Option<String>,
    pub fields: Vec<RawField>,
    pub load_timestamp: String,
}

impl Record {
    pub fn control_value(&self, tag: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.address.is_control() && f.address.tag() == tag)
            .map(|f| f.value.as_str())
    }

    /// First non-empty control field among the configured id tags.
    pub fn fallback_id(&self) -> Option<String> {
        RECORD_ID_TAGS
            .iter()
            .filter_map(|tag| self.control_value(tag))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Fields grouped by field occurrence, in document order.
    pub fn instances(&self) -> Vec<&[RawField]> {
        let mut groups = Vec::new();
        let mut start = 0;
        for i in 1..=self.fields.len() {
            if i == self.fields.len() || self.fields[i].instance != self.fields[start].instance {
                groups.push(&self.fields[start..i]);
                start = i;
            }
        }
        groups
    }
}

/// Named output field with ordered values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetField {
    pub name: String,
    pub values: Vec<String>,
}

/// A document as sent to or read back from the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub fields: Vec<TargetField>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> &[String] {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.values.as_slice())
            .unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).first().map(String::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.first(crate::config::ID_FIELD)
    }

    /// Replaces the field's values; an empty list removes the field.
    pub fn set(&mut self, name: &str, values: Vec<String>) {
        if values.is_empty() {
            self.fields.retain(|f| f.name != name);
            return;
        }
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.values = values,
            None => self.fields.push(TargetField {
                name: name.to_string(),
                values,
            }),
        }
    }

    pub fn add(&mut self, name: &str, values: Vec<String>) {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.values.extend(values),
            None if !values.is_empty() => self.fields.push(TargetField {
                name: name.to_string(),
                values,
            }),
            None => {}
        }
    }

    pub fn with(mut self, name: &str, values: &[&str]) -> Self {
        self.set(name, values.iter().map(|v| v.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOp {
    Set(Vec<String>),
    Add(Vec<String>),
}

/// Partial update of an indexed document, produced by the linkers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDocument {
    pub id: String,
    pub ops: Vec<(String, FieldOp)>,
}

impl LinkDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ops: Vec::new(),
        }
    }

    pub fn set(mut self, field: &str, values: Vec<String>) -> Self {
        self.ops.push((field.to_string(), FieldOp::Set(values)));
        self
    }

    pub fn add(mut self, field: &str, values: Vec<String>) -> Self {
        self.ops.push((field.to_string(), FieldOp::Add(values)));
        self
    }

    /// Applies the operations in order to a stored document.
    pub fn apply(&self, doc: &mut Document) {
        for (field, op) in &self.ops {
            match op {
                FieldOp::Set(values) => doc.set(field, values.clone()),
                FieldOp::Add(values) => doc.add(field, values.clone()),
            }
        }
    }
}

/// Restricts linker queries to documents written by one load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationScope {
    pub load_timestamp: String,
}

impl RelationScope {
    pub fn new(load_timestamp: impl Into<String>) -> Self {
        Self {
            load_timestamp: load_timestamp.into(),
        }
    }
}

use crate::config::INDICATOR_SENTINEL;
use crate::models::{Address, RawField, Record};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPattern {
    Control {
        tag: String,
    },
    /// `None` positions are wildcards.
    Data {
        tag: String,
        ind1: Option<char>,
        ind2: Option<char>,
        code: Option<char>,
    },
    Literal(String),
}

impl AddressPattern {
    pub fn parse(token: &str) -> Self {
        let chars: Vec<char> = token.chars().collect();
        if chars.len() == 3 {
            return AddressPattern::Control {
                tag: token.to_string(),
            };
        }
        if chars.len() == 8 && chars[3] == '$' && chars[6] == '$' {
            let slot = |c: char| (c != '*').then(|| normalize_pattern_indicator(c));
            return AddressPattern::Data {
                tag: chars[..3].iter().collect(),
                ind1: slot(chars[4]),
                ind2: slot(chars[5]),
                code: (chars[7] != '*').then_some(chars[7]),
            };
        }
        AddressPattern::Literal(token.to_string())
    }

    /// Tag used by the rule prefilter.
    pub fn tag(&self) -> &str {
        match self {
            AddressPattern::Control { tag } | AddressPattern::Data { tag, .. } => tag,
            AddressPattern::Literal(text) => {
                let end = text.char_indices().nth(3).map(|(i, _)| i).unwrap_or(text.len());
                &text[..end]
            }
        }
    }

    pub fn matches(&self, address: &Address) -> bool {
        match (self, address) {
            (AddressPattern::Control { tag }, Address::Control { tag: t }) => tag == t,
            (
                AddressPattern::Data {
                    tag,
                    ind1,
                    ind2,
                    code,
                },
                Address::Data {
                    tag: t,
                    ind1: i1,
                    ind2: i2,
                    code: c,
                },
            ) => {
                tag == t
                    && ind1.map_or(true, |v| v == *i1)
                    && ind2.map_or(true, |v| v == *i2)
                    && code.map_or(true, |v| v == *c)
            }
            (AddressPattern::Literal(text), address) => *text == address.to_string(),
            _ => false,
        }
    }
}

impl fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = |c: Option<char>| c.unwrap_or('*');
        match self {
            AddressPattern::Control { tag } => write!(f, "{tag}"),
            AddressPattern::Data {
                tag,
                ind1,
                ind2,
                code,
            } => write!(f, "{tag}${}{}${}", slot(*ind1), slot(*ind2), slot(*code)),
            AddressPattern::Literal(text) => write!(f, "{text}"),
        }
    }
}

fn normalize_pattern_indicator(c: char) -> char {
    if c == ' ' || c == '_' {
        INDICATOR_SENTINEL
    } else {
        c
    }
}

/// Inclusive character range applied to a matched value, e.g. `008[35-37]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharWindow {
    pub from: usize,
    pub to: usize,
}

impl CharWindow {
    /// Accepts `from-to` or a single position.
    pub fn parse(arg: &str) -> Option<Self> {
        let (from, to) = match arg.split_once('-') {
            Some((a, b)) => (a.trim().parse().ok()?, b.trim().parse().ok()?),
            None => {
                let pos = arg.trim().parse().ok()?;
                (pos, pos)
            }
        };
        (from <= to).then_some(CharWindow { from, to })
    }

    pub fn apply(&self, value: &str) -> String {
        value
            .chars()
            .skip(self.from)
            .take(self.to - self.from + 1)
            .collect()
    }
}

/// A pattern plus its optional character window, as written in a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    pub pattern: AddressPattern,
    pub window: Option<CharWindow>,
}

/// All fields of `record` matched by `pattern`, in record order.
pub fn match_record<'r>(record: &'r Record, pattern: &AddressPattern) -> Vec<&'r RawField> {
    record
        .fields
        .iter()
        .filter(|f| pattern.matches(&f.address))
        .collect()
}

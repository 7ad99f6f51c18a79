//! Label selectors
//!
//! Textual form is a comma-separated list of requirements, all of which must
//! hold:
//!
//! ```text
//! key=value   key==value   key!=value
//! key in (a,b)   key notin (a,b)
//! key   !key
//! ```
//!
//! The empty string selects everything.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Selector parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("invalid label key: {0:?}")]
    InvalidKey(String),

    #[error("invalid label value {value:?} for key {key:?}")]
    InvalidValue { key: String, value: String },

    #[error("malformed requirement: {0:?}")]
    Malformed(String),

    #[error("unbalanced parentheses in selector")]
    Unbalanced,
}

/// Requirement operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One clause of a selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: SelectorOperator,
    pub values: BTreeSet<String>,
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::Equals | SelectorOperator::In => {
                value.is_some_and(|v| self.values.contains(v))
            }
            SelectorOperator::NotEquals | SelectorOperator::NotIn => {
                value.map_or(true, |v| !self.values.contains(v))
            }
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = || self.values.iter().next().map(String::as_str).unwrap_or("");
        let joined = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            SelectorOperator::Equals => write!(f, "{}={}", self.key, first()),
            SelectorOperator::NotEquals => write!(f, "{}!={}", self.key, first()),
            SelectorOperator::In => write!(f, "{} in ({})", self.key, joined()),
            SelectorOperator::NotIn => write!(f, "{} notin ({})", self.key, joined()),
            SelectorOperator::Exists => write!(f, "{}", self.key),
            SelectorOperator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A predicate over label maps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSelector {
    /// Matches every object
    Everything,
    /// Matches no object
    Nothing,
    /// Matches when every requirement holds
    Requirements(Vec<Requirement>),
}

impl Default for LabelSelector {
    fn default() -> Self {
        LabelSelector::Everything
    }
}

impl LabelSelector {
    /// Parse the textual selector form
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(LabelSelector::Everything);
        }
        let requirements = split_clauses(input)?
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LabelSelector::Requirements(requirements))
    }

    /// Equality selector over every pair in `labels`
    pub fn from_match_labels(labels: &BTreeMap<String, String>) -> Self {
        if labels.is_empty() {
            return LabelSelector::Everything;
        }
        LabelSelector::Requirements(
            labels
                .iter()
                .map(|(k, v)| Requirement {
                    key: k.clone(),
                    operator: SelectorOperator::Equals,
                    values: BTreeSet::from([v.clone()]),
                })
                .collect(),
        )
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            LabelSelector::Everything => true,
            LabelSelector::Nothing => false,
            LabelSelector::Requirements(reqs) => reqs.iter().all(|r| r.matches(labels)),
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelSelector::Everything => Ok(()),
            LabelSelector::Nothing => f.write_str("<nothing>"),
            LabelSelector::Requirements(reqs) => {
                let parts: Vec<String> = reqs.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

impl std::str::FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split on commas outside parentheses
fn split_clauses(input: &str) -> Result<Vec<&str>, SelectorError> {
    let mut clauses = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or(SelectorError::Unbalanced)?,
            ',' if depth == 0 => {
                clauses.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced);
    }
    clauses.push(input[start..].trim());
    Ok(clauses)
}

fn parse_requirement(clause: &str) -> Result<Requirement, SelectorError> {
    if clause.is_empty() {
        return Err(SelectorError::Malformed(clause.to_string()));
    }

    if let Some(key) = clause.strip_prefix('!') {
        let key = validate_key(key.trim())?;
        return Ok(Requirement {
            key,
            operator: SelectorOperator::DoesNotExist,
            values: BTreeSet::new(),
        });
    }

    // Order matters: `!=` and `==` before `=`.
    for (token, operator) in [
        ("!=", SelectorOperator::NotEquals),
        ("==", SelectorOperator::Equals),
        ("=", SelectorOperator::Equals),
    ] {
        if let Some((key, value)) = clause.split_once(token) {
            let key = validate_key(key.trim())?;
            let value = validate_value(&key, value.trim())?;
            return Ok(Requirement {
                key,
                operator,
                values: BTreeSet::from([value]),
            });
        }
    }

    let mut words = clause.splitn(2, char::is_whitespace);
    let key = words.next().unwrap_or_default();
    let rest = words.next().map(str::trim).unwrap_or_default();
    if rest.is_empty() {
        return Ok(Requirement {
            key: validate_key(key)?,
            operator: SelectorOperator::Exists,
            values: BTreeSet::new(),
        });
    }

    let (operator, list) = if let Some(list) = rest.strip_prefix("notin") {
        (SelectorOperator::NotIn, list)
    } else if let Some(list) = rest.strip_prefix("in") {
        (SelectorOperator::In, list)
    } else {
        return Err(SelectorError::Malformed(clause.to_string()));
    };
    let key = validate_key(key)?;
    let inner = list
        .trim()
        .strip_prefix('(')
        .and_then(|l| l.strip_suffix(')'))
        .ok_or_else(|| SelectorError::Malformed(clause.to_string()))?;
    let values = inner
        .split(',')
        .map(|v| validate_value(&key, v.trim()))
        .collect::<Result<BTreeSet<_>, _>>()?;
    if values.is_empty() {
        return Err(SelectorError::Malformed(clause.to_string()));
    }
    Ok(Requirement {
        key,
        operator,
        values,
    })
}

fn validate_key(key: &str) -> Result<String, SelectorError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if ok {
        Ok(key.to_string())
    } else {
        Err(SelectorError::InvalidKey(key.to_string()))
    }
}

fn validate_value(key: &str, value: &str) -> Result<String, SelectorError> {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Ok(value.to_string())
    } else {
        Err(SelectorError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

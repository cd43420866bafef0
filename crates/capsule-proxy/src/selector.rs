//! Label selectors
//!
//! Selectors are kept as lists of `(key, operator, values)` requirements and
//! only turned into the control plane's textual syntax when the outgoing
//! query string is written. Combining selectors is always a conjunction.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use capsule_common::NEVER_MATCHING_LABEL;

/// Requirement operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    /// `key in (a,b)`
    In,
    /// `key notin (a,b)`
    NotIn,
    /// `key=a`
    Equals,
    /// `key==a`
    DoubleEquals,
    /// `key!=a`
    NotEquals,
    /// `key`
    Exists,
    /// `!key`
    DoesNotExist,
    /// `key>1`
    GreaterThan,
    /// `key<1`
    LessThan,
}

/// A single selector requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    /// Build a requirement, checking the value count the operator needs
    pub fn new<I, S>(key: impl Into<String>, operator: Operator, values: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        validate_key(&key)?;

        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        for value in &values {
            validate_value(value)?;
        }

        let ok = match operator {
            Operator::In | Operator::NotIn => !values.is_empty(),
            Operator::Equals | Operator::DoubleEquals | Operator::NotEquals => values.len() == 1,
            Operator::Exists | Operator::DoesNotExist => values.is_empty(),
            Operator::GreaterThan | Operator::LessThan => {
                values.len() == 1 && values.iter().all(|v| v.parse::<i64>().is_ok())
            }
        };
        if !ok {
            return Err(ParseError::new(format!(
                "invalid values {:?} for operator {:?} on key {:?}",
                values, operator, key
            )));
        }

        Ok(Self {
            key,
            operator,
            values,
        })
    }

    /// `key in (values)`
    pub fn is_in<I, S>(key: impl Into<String>, values: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(key, Operator::In, values)
    }

    /// `key`
    pub fn exists(key: impl Into<String>) -> Result<Self, ParseError> {
        Self::new(key, Operator::Exists, Vec::<String>::new())
    }

    /// Label key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Operator
    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// Values, sorted
    pub fn values(&self) -> &BTreeSet<String> {
        &self.values
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In => write!(f, "{} in ({})", self.key, joined()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, joined()),
            Operator::Equals => write!(f, "{}={}", self.key, joined()),
            Operator::DoubleEquals => write!(f, "{}=={}", self.key, joined()),
            Operator::NotEquals => write!(f, "{}!={}", self.key, joined()),
            Operator::Exists => f.write_str(&self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            Operator::GreaterThan => write!(f, "{}>{}", self.key, joined()),
            Operator::LessThan => write!(f, "{}<{}", self.key, joined()),
        }
    }
}

/// Conjunction of requirements, sorted by key
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Selector with the given requirements
    pub fn new(requirements: impl IntoIterator<Item = Requirement>) -> Self {
        let mut selector = Self::default();
        for r in requirements {
            selector = selector.and(r);
        }
        selector
    }

    /// Selector no object satisfies
    pub fn never_matching() -> Self {
        Self {
            requirements: vec![Requirement {
                key: NEVER_MATCHING_LABEL.to_string(),
                operator: Operator::Exists,
                values: BTreeSet::new(),
            }],
        }
    }

    /// This selector with one more requirement
    pub fn and(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self.requirements.sort_by(|a, b| a.key.cmp(&b.key));
        self
    }

    /// Requirements in key order
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

/// Caller supplied a selector the parser does not understand
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unable to parse label selector: {0}")]
pub struct ParseError(String);

impl ParseError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        if s.trim().is_empty() {
            return Ok(Selector::default());
        }

        split_terms(s)?
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Vec<_>, _>>()
            .map(Selector::new)
    }
}

/// Split on commas that are not inside a parenthesised value list
fn split_terms(s: &str) -> Result<Vec<&str>, ParseError> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ParseError::new("unbalanced parenthesis"))?;
            }
            ',' if depth == 0 => {
                terms.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParseError::new("unbalanced parenthesis"));
    }
    terms.push(&s[start..]);
    Ok(terms)
}

fn parse_requirement(term: &str) -> Result<Requirement, ParseError> {
    let term = term.trim();
    if term.is_empty() {
        return Err(ParseError::new("empty requirement"));
    }

    if let Some(key) = term.strip_prefix('!') {
        return Requirement::new(key.trim(), Operator::DoesNotExist, Vec::<String>::new());
    }

    for (token, operator) in [
        ("==", Operator::DoubleEquals),
        ("!=", Operator::NotEquals),
        ("=", Operator::Equals),
        (">", Operator::GreaterThan),
        ("<", Operator::LessThan),
    ] {
        if let Some((key, value)) = term.split_once(token) {
            return Requirement::new(key.trim(), operator, [value.trim()]);
        }
    }

    if let Some((key, rest)) = term.split_once(char::is_whitespace) {
        let rest = rest.trim_start();
        let (operator, list) = if let Some(list) = rest.strip_prefix("notin") {
            (Operator::NotIn, list)
        } else if let Some(list) = rest.strip_prefix("in") {
            (Operator::In, list)
        } else {
            return Err(ParseError::new(format!("unknown operator in {:?}", term)));
        };

        let list = list
            .trim()
            .strip_prefix('(')
            .and_then(|l| l.strip_suffix(')'))
            .ok_or_else(|| ParseError::new(format!("expected value list in {:?}", term)))?;

        let values: Vec<&str> = list.split(',').map(str::trim).collect();
        if values.iter().any(|v| v.is_empty()) {
            return Err(ParseError::new(format!("empty value in {:?}", term)));
        }
        return Requirement::new(key, operator, values);
    }

    Requirement::exists(term)
}

fn validate_key(key: &str) -> Result<(), ParseError> {
    let valid = !key.is_empty()
        && key.len() <= 316
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(ParseError::new(format!("invalid label key {:?}", key)))
    }
}

fn validate_value(value: &str) -> Result<(), ParseError> {
    let valid = value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ParseError::new(format!("invalid label value {:?}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_requirement_serializes_sorted() {
        let r = Requirement::is_in("capsule.clastix.io/tenant", ["oil", "gas"]).unwrap();
        assert_eq!(r.to_string(), "capsule.clastix.io/tenant in (gas,oil)");
    }

    #[test]
    fn test_in_requirement_deduplicates() {
        let r = Requirement::is_in("tenant", ["oil", "oil"]).unwrap();
        assert_eq!(r.values().len(), 1);
    }

    #[test]
    fn test_in_requires_values() {
        assert!(Requirement::is_in("tenant", Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_exists_serializes_as_bare_key() {
        let r = Requirement::exists("dontexistsignoreme").unwrap();
        assert_eq!(r.to_string(), "dontexistsignoreme");
    }

    #[test]
    fn test_selector_sorted_by_key() {
        let s = Selector::new([
            Requirement::new("zone", Operator::Equals, ["a"]).unwrap(),
            Requirement::exists("app").unwrap(),
        ]);
        assert_eq!(s.to_string(), "app,zone=a");
    }

    #[test]
    fn test_parse_all_operators() {
        let s: Selector = "a=1,b==2,c!=3,d in (x, y),e notin (z),f,!g,h>4,i<5"
            .parse()
            .unwrap();
        let ops: Vec<Operator> = s.requirements().iter().map(|r| r.operator()).collect();
        assert_eq!(
            ops,
            vec![
                Operator::Equals,
                Operator::DoubleEquals,
                Operator::NotEquals,
                Operator::In,
                Operator::NotIn,
                Operator::Exists,
                Operator::DoesNotExist,
                Operator::GreaterThan,
                Operator::LessThan,
            ]
        );
        assert_eq!(
            s.requirements()[3].values().iter().collect::<Vec<_>>(),
            vec!["x", "y"]
        );
    }

    #[test]
    fn test_parse_then_display_is_canonical() {
        let s: Selector = "tier=web, capsule.clastix.io/tenant in (oil,gas)".parse().unwrap();
        assert_eq!(s.to_string(), "capsule.clastix.io/tenant in (gas,oil),tier=web");
    }

    #[test]
    fn test_parse_empty_is_empty_selector() {
        assert!("".parse::<Selector>().unwrap().requirements().is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("a in (b".parse::<Selector>().is_err());
        assert!("a in ()".parse::<Selector>().is_err());
        assert!("a,,b".parse::<Selector>().is_err());
        assert!("a foo (b)".parse::<Selector>().is_err());
        assert!("a=b c".parse::<Selector>().is_err());
        assert!("a>x".parse::<Selector>().is_err());
    }
}

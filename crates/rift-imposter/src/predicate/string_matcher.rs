//! Operators and compiled expected values.

use super::matcher::{bytes_contain, CachedValue};
use crate::message::FieldValue;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Field comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    DeepEquals,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Exists,
}

impl Operator {
    pub fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "equals" => Operator::Equals,
            "deepEquals" => Operator::DeepEquals,
            "contains" => Operator::Contains,
            "startsWith" => Operator::StartsWith,
            "endsWith" => Operator::EndsWith,
            "matches" => Operator::Matches,
            "exists" => Operator::Exists,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::DeepEquals => "deepEquals",
            Operator::Contains => "contains",
            Operator::StartsWith => "startsWith",
            Operator::EndsWith => "endsWith",
            Operator::Matches => "matches",
            Operator::Exists => "exists",
        }
    }
}

/// Compiled except regex for stripping patterns before matching.
#[derive(Debug, Clone)]
pub struct CompiledExcept {
    pub regex: Arc<Regex>,
}

impl CompiledExcept {
    pub fn compile(pattern: &str, case_sensitive: bool) -> Result<Self, regex::Error> {
        Ok(CompiledExcept {
            regex: Arc::new(compile_regex(pattern, case_sensitive)?),
        })
    }

    /// Strip every match of the except pattern from the value.
    pub fn apply<'a>(&self, value: &'a str) -> Cow<'a, str> {
        self.regex.replace_all(value, "")
    }
}

pub(super) fn compile_regex(pattern: &str, case_sensitive: bool) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
}

/// Options shared by every field of one predicate.
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    pub case_sensitive: bool,
    pub except: Option<CompiledExcept>,
}

impl MatchOptions {
    fn prepare<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match &self.except {
            Some(except) => except.apply(value),
            None => Cow::Borrowed(value),
        }
    }
}

/// Expected value of one field, compiled for its operator.
#[derive(Debug, Clone)]
pub enum Expected {
    Text(CachedValue),
    Bytes(Vec<u8>),
    Pattern(Arc<Regex>),
    Exists(bool),
    /// JSON body compared structurally
    Json(Value),
    Map {
        entries: Vec<(CachedValue, Expected)>,
        ignore_key_case: bool,
    },
}

impl Expected {
    pub fn matches(&self, op: Operator, actual: Option<FieldValue<'_>>, options: &MatchOptions) -> bool {
        match (self, actual) {
            (Expected::Exists(should_exist), actual) => *should_exist == is_present(actual),
            (_, None) => false,
            (Expected::Text(expected), Some(FieldValue::Text(actual))) => {
                compare_text(op, expected, &options.prepare(actual), options.case_sensitive)
            }
            (Expected::Pattern(regex), Some(FieldValue::Text(actual))) => {
                regex.is_match(&options.prepare(actual))
            }
            (Expected::Bytes(expected), Some(FieldValue::Bytes(actual))) => {
                compare_bytes(op, expected, actual)
            }
            (Expected::Json(expected), Some(FieldValue::Text(actual))) => {
                match serde_json::from_str::<Value>(&options.prepare(actual)) {
                    Ok(actual) => json_matches(
                        expected,
                        &actual,
                        op == Operator::DeepEquals,
                        options.case_sensitive,
                    ),
                    Err(_) => false,
                }
            }
            (
                Expected::Map {
                    entries,
                    ignore_key_case,
                },
                Some(FieldValue::Map(actual)),
            ) => {
                let all = entries.iter().all(|(key, expected)| {
                    let value = lookup(actual, key, *ignore_key_case).map(FieldValue::Text);
                    expected.matches(op, value, options)
                });
                all && (op != Operator::DeepEquals || actual.len() == entries.len())
            }
            _ => false,
        }
    }
}

fn is_present(actual: Option<FieldValue<'_>>) -> bool {
    match actual {
        None => false,
        Some(FieldValue::Text(s)) => !s.is_empty(),
        Some(FieldValue::Bytes(b)) => !b.is_empty(),
        Some(FieldValue::Map(m)) => !m.is_empty(),
    }
}

fn lookup<'a>(
    map: &'a BTreeMap<String, String>,
    key: &CachedValue,
    ignore_case: bool,
) -> Option<&'a str> {
    if ignore_case {
        map.iter()
            .find(|(k, _)| k.to_lowercase() == key.lower)
            .map(|(_, v)| v.as_str())
    } else {
        map.get(&key.value).map(String::as_str)
    }
}

fn compare_text(op: Operator, expected: &CachedValue, actual: &str, case_sensitive: bool) -> bool {
    match op {
        Operator::Equals | Operator::DeepEquals => expected.equals(actual, case_sensitive),
        Operator::Contains => expected.contained_in(actual, case_sensitive),
        Operator::StartsWith => expected.starts(actual, case_sensitive),
        Operator::EndsWith => expected.ends(actual, case_sensitive),
        Operator::Matches | Operator::Exists => false,
    }
}

fn compare_bytes(op: Operator, expected: &[u8], actual: &[u8]) -> bool {
    match op {
        Operator::Equals | Operator::DeepEquals => actual == expected,
        Operator::Contains => bytes_contain(actual, expected),
        Operator::StartsWith => actual.starts_with(expected),
        Operator::EndsWith => actual.ends_with(expected),
        Operator::Matches | Operator::Exists => false,
    }
}

/// `equals` treats objects as subsets; `deepEquals` requires exact equality.
fn json_matches(expected: &Value, actual: &Value, deep: bool, case_sensitive: bool) -> bool {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => {
            (!deep || e.len() == a.len())
                && e.iter().all(|(k, ev)| {
                    a.get(k)
                        .is_some_and(|av| json_matches(ev, av, deep, case_sensitive))
                })
        }
        (Value::Array(e), Value::Array(a)) => {
            e.len() == a.len()
                && e.iter()
                    .zip(a)
                    .all(|(ev, av)| json_matches(ev, av, deep, case_sensitive))
        }
        (Value::String(e), Value::String(a)) if !case_sensitive => {
            e.to_lowercase() == a.to_lowercase()
        }
        // scalar bodies arrive as strings; compare their text form
        (e, Value::String(a)) if !e.is_string() => e.to_string() == *a,
        (e, a) => e == a,
    }
}

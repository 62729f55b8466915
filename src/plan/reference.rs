//! Task parameter values and `<task_id.field.path>` references.
//!
//! A parameter is either a literal JSON value or a reference into the output
//! of another task in the same plan. References may also appear nested inside
//! arrays and objects; every nested reference is resolved before the call.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{DependencyResolutionError, PlanningError};

/// Leading path segment that names the output root rather than a field.
pub const RESULT_ALIAS: &str = "result";

static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<([A-Za-z0-9_-]+)((?:\.[A-Za-z0-9_-]+)*)>$").expect("reference pattern is valid")
});

/// A pointer into another task's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskReference {
    /// Id of the task whose output is read.
    pub task_id: String,
    /// Field path below the output root. Numeric segments index arrays.
    pub path: Vec<String>,
}

impl TaskReference {
    /// Parse a string parameter.
    ///
    /// Returns `Ok(None)` for ordinary strings. A string wrapped in angle
    /// brackets is treated as an attempted reference and must match the
    /// grammar, otherwise it is reported as malformed.
    pub fn parse(owner: &str, raw: &str) -> Result<Option<Self>, PlanningError> {
        if !(raw.starts_with('<') && raw.ends_with('>')) {
            return Ok(None);
        }
        let caps = REFERENCE_PATTERN
            .captures(raw)
            .ok_or_else(|| PlanningError::MalformedReference {
                task: owner.to_string(),
                raw: raw.to_string(),
                reason: "expected <task_id.field.path> with [A-Za-z0-9_-] segments".to_string(),
            })?;

        let task_id = caps[1].to_string();
        let mut path: Vec<String> = caps
            .get(2)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if path.first().map(String::as_str) == Some(RESULT_ALIAS) {
            path.remove(0);
        }

        Ok(Some(Self { task_id, path }))
    }

    /// Dotted field path, or `result` for the output root.
    pub fn path_display(&self) -> String {
        if self.path.is_empty() {
            RESULT_ALIAS.to_string()
        } else {
            self.path.join(".")
        }
    }

    /// Walk `output` along this reference's path.
    pub fn extract<'a>(&self, output: &'a Value) -> Option<&'a Value> {
        let mut current = output;
        for segment in &self.path {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "<{}>", self.task_id)
        } else {
            write!(f, "<{}.{}>", self.task_id, self.path.join("."))
        }
    }
}

/// A task parameter as authored, with references parsed out.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Literal(Value),
    Reference(TaskReference),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Parse a raw JSON value owned by task `owner`.
    ///
    /// Containers that hold no reference collapse back into a single literal.
    pub fn parse(owner: &str, value: Value) -> Result<Self, PlanningError> {
        match value {
            Value::String(s) => match TaskReference::parse(owner, &s)? {
                Some(reference) => Ok(ParamValue::Reference(reference)),
                None => Ok(ParamValue::Literal(Value::String(s))),
            },
            Value::Array(items) => {
                let parsed = items
                    .into_iter()
                    .map(|item| ParamValue::parse(owner, item))
                    .collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(ParamValue::is_literal) {
                    Ok(ParamValue::Literal(Value::Array(
                        parsed.into_iter().map(ParamValue::into_literal).collect(),
                    )))
                } else {
                    Ok(ParamValue::List(parsed))
                }
            }
            Value::Object(map) => {
                let parsed = map
                    .into_iter()
                    .map(|(k, v)| ParamValue::parse(owner, v).map(|p| (k, p)))
                    .collect::<Result<BTreeMap<_, _>, _>>()?;
                if parsed.values().all(ParamValue::is_literal) {
                    Ok(ParamValue::Literal(Value::Object(
                        parsed
                            .into_iter()
                            .map(|(k, v)| (k, v.into_literal()))
                            .collect(),
                    )))
                } else {
                    Ok(ParamValue::Map(parsed))
                }
            }
            other => Ok(ParamValue::Literal(other)),
        }
    }

    fn is_literal(&self) -> bool {
        matches!(self, ParamValue::Literal(_))
    }

    fn into_literal(self) -> Value {
        match self {
            ParamValue::Literal(v) => v,
            other => other.to_json(),
        }
    }

    /// Every reference contained in this value, depth first.
    pub fn references(&self) -> Vec<&TaskReference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a TaskReference>) {
        match self {
            ParamValue::Literal(_) => {}
            ParamValue::Reference(r) => out.push(r),
            ParamValue::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            ParamValue::Map(map) => map.values().for_each(|v| v.collect_references(out)),
        }
    }

    /// Render back to JSON with references in their `<...>` form.
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Literal(v) => v.clone(),
            ParamValue::Reference(r) => Value::String(r.to_string()),
            ParamValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ParamValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    /// Substitute every reference using `lookup`.
    ///
    /// `lookup` must return the referenced value or an explicit error; a
    /// missing value never becomes `null`.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Value, DependencyResolutionError>
    where
        F: Fn(&TaskReference) -> Result<Value, DependencyResolutionError>,
    {
        match self {
            ParamValue::Literal(v) => Ok(v.clone()),
            ParamValue::Reference(r) => lookup(r),
            ParamValue::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            ParamValue::Map(map) => map
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|resolved| (k.clone(), resolved)))
                .collect::<Result<Map<String, Value>, _>>()
                .map(Value::Object),
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

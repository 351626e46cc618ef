//! Input/output values and references between units.
//!
//! Unit inputs may be literals or references to another unit's outputs:
//! - a whole value `${unit.db.outputs.endpoint}` becomes [`Value::Reference`]
//!   and keeps the referenced output's type once resolved
//! - references embedded in a longer string
//!   (`postgres://${unit.db.outputs.host}:5432`) are interpolated as text

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use crate::{Error, Result, UnitId};

/// Named values: unit inputs, outputs and mock outputs.
pub type ValueMap = BTreeMap<String, Value>;

static EMBEDDED_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{unit\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)\}").unwrap()
});

static WHOLE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{unit\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)\}$").unwrap()
});

/// A reference to a named output of another unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputRef {
    pub unit: UnitId,
    pub key: String,
}

impl OutputRef {
    pub fn new(unit: UnitId, key: impl Into<String>) -> Self {
        Self {
            unit,
            key: key.into(),
        }
    }

    /// Parse `unit.<id>.outputs.<key>`.
    pub fn parse(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.split('.').collect();
        match parts.as_slice() {
            ["unit", id, "outputs", key] if !key.is_empty() => {
                Ok(Self::new(UnitId::new(*id)?, *key))
            }
            _ => Err(Error::InvalidInput(format!(
                "invalid output reference '{}', expected unit.<id>.outputs.<key>",
                path
            ))),
        }
    }

    /// Parse a string that consists of exactly one `${unit.<id>.outputs.<key>}`.
    pub fn parse_whole(input: &str) -> Option<Self> {
        let caps = WHOLE_REF.captures(input)?;
        let unit = UnitId::new(&caps[1]).ok()?;
        Some(Self::new(unit, &caps[2]))
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit.{}.outputs.{}", self.unit, self.key)
    }
}

/// Find every reference embedded in a string.
pub fn embedded_refs(input: &str) -> Vec<OutputRef> {
    EMBEDDED_REF
        .captures_iter(input)
        .filter_map(|caps| {
            let unit = UnitId::new(&caps[1]).ok()?;
            Some(OutputRef::new(unit, &caps[2]))
        })
        .collect()
}

/// Replace every embedded reference in `input` using `lookup`.
pub fn interpolate_refs<E>(
    input: &str,
    mut lookup: impl FnMut(&OutputRef) -> std::result::Result<String, E>,
) -> std::result::Result<String, E> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in EMBEDDED_REF.captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let Ok(unit) = UnitId::new(&caps[1]) else {
            continue;
        };
        out.push_str(&input[last..whole.start()]);
        out.push_str(&lookup(&OutputRef::new(unit, &caps[2]))?);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// A dynamically typed input or output value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(ValueMap),
    Reference(OutputRef),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Build a value from a string, recognising a whole-value reference.
    pub fn from_template(s: impl Into<String>) -> Self {
        let s = s.into();
        match OutputRef::parse_whole(&s) {
            Some(reference) => Value::Reference(reference),
            None => Value::String(s),
        }
    }

    /// Collect every reference contained in this value, recursively.
    pub fn collect_refs(&self, refs: &mut BTreeSet<OutputRef>) {
        match self {
            Value::Reference(r) => {
                refs.insert(r.clone());
            }
            Value::String(s) => refs.extend(embedded_refs(s)),
            Value::List(items) => items.iter().for_each(|v| v.collect_refs(refs)),
            Value::Map(map) => map.values().for_each(|v| v.collect_refs(refs)),
            Value::Null | Value::Bool(_) | Value::Integer(_) | Value::Float(_) => {}
        }
    }

    /// Whether the value still contains unresolved references.
    pub fn has_refs(&self) -> bool {
        let mut refs = BTreeSet::new();
        self.collect_refs(&mut refs);
        !refs.is_empty()
    }

    /// Convert to JSON. References are encoded as `{"$ref": "unit.a.outputs.b"}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Reference(r) => {
                let mut obj = serde_json::Map::new();
                obj.insert("$ref".to_string(), serde_json::Value::String(r.to_string()));
                serde_json::Value::Object(obj)
            }
        }
    }

    /// Text used when the value is interpolated into a string.
    pub fn to_interpolated(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            Value::Reference(r) => format!("${{{}}}", r),
            other => other.to_json().to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            Value::Reference(r) => write!(f, "${{{}}}", r),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                if obj.len() == 1 {
                    if let Some(reference) = obj
                        .get("$ref")
                        .and_then(|v| v.as_str())
                        .and_then(|s| OutputRef::parse(s).ok())
                    {
                        return Value::Reference(reference);
                    }
                }
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<OutputRef> for Value {
    fn from(r: OutputRef) -> Self {
        Value::Reference(r)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

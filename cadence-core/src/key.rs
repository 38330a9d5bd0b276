//! Request identities.
//!
//! A [`QueryKey`] is an ordered tuple such as `["track", "42"]` or
//! `["catalog", {"genre": "jazz", "page": 2}]`. Two keys address the same
//! cache entry iff they are structurally equal, so every parameter that
//! affects a result must be part of the key.
//!
//! Floats are not representable: they have no stable structural equality,
//! and a key that silently compared unequal to itself would split one
//! logical query across several entries.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::KeyError;

/// One element of a [`QueryKey`].
///
/// Maps are stored sorted so `{"a":1,"b":2}` and `{"b":2,"a":1}` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum KeySegment {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<KeySegment>),
    Map(BTreeMap<String, KeySegment>),
}

impl KeySegment {
    /// Convert a JSON value, rejecting floats and out-of-range integers.
    pub fn from_json(value: Value) -> Result<Self, KeyError> {
        Self::from_json_at(value, "$")
    }

    fn from_json_at(value: Value, path: &str) -> Result<Self, KeyError> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::String(s) => Ok(Self::Str(s)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Int(i)),
                None => Err(KeyError::UnsupportedSegment {
                    path: path.to_string(),
                    reason: format!("number {} is not a 64-bit signed integer", n),
                }),
            },
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| Self::from_json_at(item, &format!("{}[{}]", path, i)))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Value::Object(fields) => fields
                .into_iter()
                .map(|(k, v)| {
                    let child = format!("{}.{}", path, k);
                    Self::from_json_at(v, &child).map(|seg| (k, seg))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
        }
    }

    /// Lossless conversion back to JSON.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Str(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<KeySegment>> From<Option<T>> for KeySegment {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Deterministic tuple key addressing one cached unit of data.
///
/// The first segment is always a non-empty string naming the entity or
/// remote operation. Construction is the only place keys are validated; the
/// store assumes every key it sees is well formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
    /// Start a key with its entity segment.
    pub fn new(entity: impl Into<String>) -> Result<Self, KeyError> {
        let entity = entity.into();
        if entity.trim().is_empty() {
            return Err(KeyError::InvalidEntity {
                reason: "entity segment must not be empty".to_string(),
            });
        }
        Ok(Self(vec![KeySegment::Str(entity)]))
    }

    /// Append a parameter segment.
    pub fn arg(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Append an arbitrary JSON parameter (e.g. operation variables).
    pub fn arg_json(self, value: Value) -> Result<Self, KeyError> {
        let segment = KeySegment::from_json(value)?;
        Ok(self.arg(segment))
    }

    /// Build a key from a JSON array such as `["track", "42"]`.
    pub fn from_json(value: Value) -> Result<Self, KeyError> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(KeyError::NotAnArray {
                    found: json_kind(&other).to_string(),
                })
            }
        };
        let mut iter = items.into_iter();
        let entity = match iter.next() {
            None => return Err(KeyError::Empty),
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(KeyError::InvalidEntity {
                    reason: format!("expected string, got {}", json_kind(&other)),
                })
            }
        };
        let mut key = Self::new(entity)?;
        for (i, item) in iter.enumerate() {
            let segment = KeySegment::from_json_at(item, &format!("$[{}]", i + 1))?;
            key.0.push(segment);
        }
        Ok(key)
    }

    /// Entity or operation name (the first segment).
    pub fn entity(&self) -> &str {
        self.0.first().and_then(KeySegment::as_str).unwrap_or_default()
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; a key has at least its entity segment.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `prefix` matches the leading segments of this key.
    ///
    /// `["track"]` is a prefix of `["track", "42"]` and of itself.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.0.iter().map(KeySegment::to_json).collect())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        QueryKey::from_json(value).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<Value> for QueryKey {
    type Error = KeyError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(value)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

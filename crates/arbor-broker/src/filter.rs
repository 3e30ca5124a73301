//! Subscription predicates.
//!
//! Routing treats filters as opaque: it only needs equality (to merge
//! identical subscriptions) and [`Filter::matches`]. [`AttributeFilter`]
//! over [`Attributes`] is the stock implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// A predicate over published messages, compared by value.
pub trait Filter:
    Clone + Eq + Hash + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Application payload carried by messages this filter inspects.
    type Content: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    fn matches(&self, message: &Message<Self::Content>) -> bool;
}

// ── Attributes ──────────────────────────────────────────────────────

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl Value {
    /// Parse with type inference: integers, then booleans, else a string.
    pub fn infer(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            Value::Int(i)
        } else if let Ok(b) = raw.parse::<bool>() {
            Value::Bool(b)
        } else {
            Value::Str(raw.trim_matches('"').to_string())
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "\"{s}\""),
            Value::Int(i) => write!(f, "{i}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Message content made of named attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(BTreeMap<String, Value>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Parse `key=value` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut attrs = Attributes::new();
        for pair in pairs {
            let (k, v) = pair.split_once('=')?;
            attrs.set(k.trim(), Value::infer(v.trim()));
        }
        Some(attrs)
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}

// ── AttributeFilter ─────────────────────────────────────────────────

/// A single condition on one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Constraint {
    Eq(Value),
    Exists,
    Prefix(String),
}

impl Constraint {
    fn holds(&self, value: Option<&Value>) -> bool {
        match (self, value) {
            (_, None) => false,
            (Constraint::Exists, Some(_)) => true,
            (Constraint::Eq(expected), Some(v)) => expected == v,
            (Constraint::Prefix(p), Some(Value::Str(s))) => s.starts_with(p.as_str()),
            (Constraint::Prefix(_), Some(_)) => false,
        }
    }
}

/// Conjunction of per-attribute constraints. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeFilter {
    constraints: BTreeMap<String, Constraint>,
}

impl AttributeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.constraints
            .insert(key.to_string(), Constraint::Eq(value.into()));
        self
    }

    pub fn exists(mut self, key: &str) -> Self {
        self.constraints.insert(key.to_string(), Constraint::Exists);
        self
    }

    pub fn prefix(mut self, key: &str, prefix: &str) -> Self {
        self.constraints
            .insert(key.to_string(), Constraint::Prefix(prefix.to_string()));
        self
    }

    /// Parse `key=value` equality pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut filter = AttributeFilter::new();
        for pair in pairs {
            let (k, v) = pair.split_once('=')?;
            filter = filter.equals(k.trim(), Value::infer(v.trim()));
        }
        Some(filter)
    }

    pub fn matches_attributes(&self, attrs: &Attributes) -> bool {
        self.constraints
            .iter()
            .all(|(key, c)| c.holds(attrs.get(key)))
    }
}

impl Filter for AttributeFilter {
    type Content = Attributes;

    fn matches(&self, message: &Message<Attributes>) -> bool {
        self.matches_attributes(message.content())
    }
}

impl fmt::Display for AttributeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, c)) in self.constraints.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match c {
                Constraint::Eq(v) => write!(f, "{k}={v}")?,
                Constraint::Exists => write!(f, "{k}=*")?,
                Constraint::Prefix(p) => write!(f, "{k}=\"{p}*\"")?,
            }
        }
        write!(f, "}}")
    }
}

//! The concrete metric model produced by collectors and consumed by
//! publishers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::namespace::Namespace;

pub type Tags = BTreeMap<String, String>;

/// A scalar metric value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
            Value::Bytes(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// A single collected measurement.
#[derive(Debug, Clone)]
pub struct Metric {
    pub(crate) namespace: Namespace,
    pub(crate) value: Value,
    pub(crate) tags: Tags,
    pub(crate) unit: String,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) description: String,
}

impl Metric {
    pub(crate) fn new(namespace: Namespace, value: Value) -> Self {
        Self {
            namespace,
            value,
            tags: Tags::new(),
            unit: String::new(),
            timestamp: Utc::now(),
            description: String::new(),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.namespace, self.value, self.tags)
    }
}

/// A bounded, task-scoped warning raised by user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

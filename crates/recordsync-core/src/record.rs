//! Local objects and remote records.
//!
//! A [`LocalObject`] is the store-neutral view of a typed domain entity: scalar
//! and array fields plus live relationships held as target identifiers. A
//! [`RemoteRecord`] is the flat attribute bag exchanged with the remote store,
//! where relationships survive only as identifier references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::schema::ScalarType;

/// A single scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Scalar type of a non-null value.
    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ScalarType::Bool),
            Value::Int(_) => Some(ScalarType::Int),
            Value::Double(_) => Some(ScalarType::Double),
            Value::String(_) => Some(ScalarType::String),
            Value::Date(_) => Some(ScalarType::Date),
            Value::Bytes(_) => Some(ScalarType::Bytes),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Date(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A field of a local object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Scalar(Value),
    Array(Vec<Value>),
    /// Live to-one relationship, `None` when unset.
    ToOne(Option<String>),
    /// Live to-many relationship, in order.
    ToMany(Vec<String>),
}

/// Store-neutral view of a typed local object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalObject {
    pub object_type: String,
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl LocalObject {
    pub fn new(object_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style scalar setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields
            .insert(name.to_string(), FieldValue::Scalar(value.into()));
        self
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<&Value> {
        match self.fields.get(name) {
            Some(FieldValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    pub fn array(&self, name: &str) -> Option<&[Value]> {
        match self.fields.get(name) {
            Some(FieldValue::Array(v)) => Some(v),
            _ => None,
        }
    }

    /// Target of a to-one relationship, if set.
    pub fn to_one(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::ToOne(Some(id))) => Some(id),
            _ => None,
        }
    }

    /// Targets of a to-many relationship (empty when unset).
    pub fn to_many(&self, name: &str) -> &[String] {
        match self.fields.get(name) {
            Some(FieldValue::ToMany(ids)) => ids,
            _ => &[],
        }
    }

    /// Overlay `other`'s fields onto this object, keeping fields `other` lacks.
    pub fn absorb(&mut self, other: LocalObject) {
        self.fields.extend(other.fields);
    }
}

/// A named partition of the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(pub String);

impl ZoneId {
    /// Name of the platform default zone.
    pub const DEFAULT_NAME: &'static str = "_defaultZone";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn default_zone() -> Self {
        Self(Self::DEFAULT_NAME.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a record in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub record_type: String,
    pub record_name: String,
    pub zone: ZoneId,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.record_type, self.record_name, self.zone)
    }
}

/// An attribute of a remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecordValue {
    Value(Value),
    List(Vec<Value>),
    Reference(String),
    ReferenceList(Vec<String>),
}

/// Flat record exchanged with the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: RecordId,
    pub fields: BTreeMap<String, RecordValue>,
    /// Local schema version at conversion time.
    pub schema_version: u32,
}

impl RemoteRecord {
    pub fn new(id: RecordId, schema_version: u32) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
            schema_version,
        }
    }

    pub fn record_type(&self) -> &str {
        &self.id.record_type
    }

    pub fn record_name(&self) -> &str {
        &self.id.record_name
    }

    pub fn get(&self, name: &str) -> Option<&RecordValue> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: RecordValue) {
        self.fields.insert(name.to_string(), value);
    }
}

//! Registration-time schema for synchronizable types.
//!
//! Every type taking part in sync implements [`Cloudable`] and describes its
//! properties once through a [`SchemaDescriptor`]. The descriptors are
//! collected into a [`SchemaRegistry`], validated, and never mutated again.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SchemaValidationError, SyncError};
use crate::record::LocalObject;

/// Scalar storage types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Bool,
    Int,
    Double,
    String,
    Date,
    Bytes,
}

/// Shape of a declared property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyKind {
    Scalar { scalar: ScalarType },
    Array { scalar: ScalarType },
    ToOne { target: String },
    ToMany { target: String },
    /// Computed linkage (inverse/back-reference). Not stored, never synced.
    Derived { target: String },
}

impl PropertyKind {
    /// Target type of a relationship, including derived ones.
    pub fn target(&self) -> Option<&str> {
        match self {
            PropertyKind::ToOne { target }
            | PropertyKind::ToMany { target }
            | PropertyKind::Derived { target } => Some(target),
            _ => None,
        }
    }
}

/// A declared property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    pub optional: bool,
}

/// Property metadata for one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub record_type: String,
    pub primary_key: String,
    pub properties: Vec<PropertyDescriptor>,
    pub non_synced: BTreeSet<String>,
}

impl SchemaDescriptor {
    pub fn new(record_type: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            primary_key: primary_key.into(),
            properties: Vec::new(),
            non_synced: BTreeSet::new(),
        }
    }

    pub fn scalar(self, name: &str, scalar: ScalarType) -> Self {
        self.property(name, PropertyKind::Scalar { scalar }, false)
    }

    pub fn optional(self, name: &str, scalar: ScalarType) -> Self {
        self.property(name, PropertyKind::Scalar { scalar }, true)
    }

    pub fn array(self, name: &str, scalar: ScalarType) -> Self {
        self.property(name, PropertyKind::Array { scalar }, false)
    }

    pub fn to_one(self, name: &str, target: &str) -> Self {
        self.property(
            name,
            PropertyKind::ToOne {
                target: target.to_string(),
            },
            true,
        )
    }

    pub fn to_many(self, name: &str, target: &str) -> Self {
        self.property(
            name,
            PropertyKind::ToMany {
                target: target.to_string(),
            },
            false,
        )
    }

    pub fn derived(self, name: &str, target: &str) -> Self {
        self.property(
            name,
            PropertyKind::Derived {
                target: target.to_string(),
            },
            true,
        )
    }

    /// Exclude a property from translation.
    pub fn not_synced(mut self, name: &str) -> Self {
        self.non_synced.insert(name.to_string());
        self
    }

    pub fn property(mut self, name: &str, kind: PropertyKind, optional: bool) -> Self {
        self.properties.push(PropertyDescriptor {
            name: name.to_string(),
            kind,
            optional,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Properties that take part in translation, primary key excluded.
    pub fn synced_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties
            .iter()
            .filter(|p| p.name != self.primary_key && !self.non_synced.contains(&p.name))
    }

    fn validate(&self) -> Result<(), SchemaValidationError> {
        if self.record_type.is_empty() {
            return Err(SchemaValidationError::EmptyRecordType);
        }

        let mut seen = BTreeSet::new();
        for property in &self.properties {
            if !seen.insert(property.name.as_str()) {
                return Err(SchemaValidationError::DuplicateProperty {
                    record_type: self.record_type.clone(),
                    property: property.name.clone(),
                });
            }
        }

        let key = self
            .get(&self.primary_key)
            .ok_or_else(|| SchemaValidationError::MissingPrimaryKey {
                record_type: self.record_type.clone(),
                key: self.primary_key.clone(),
            })?;
        let is_required_string = !key.optional
            && key.kind
                == PropertyKind::Scalar {
                    scalar: ScalarType::String,
                };
        if !is_required_string {
            return Err(SchemaValidationError::PrimaryKeyNotString {
                record_type: self.record_type.clone(),
                key: self.primary_key.clone(),
            });
        }
        if self.non_synced.contains(&self.primary_key) {
            return Err(SchemaValidationError::PrimaryKeyNotSynced {
                record_type: self.record_type.clone(),
                key: self.primary_key.clone(),
            });
        }
        Ok(())
    }
}

/// Capability contract of a synchronizable domain type.
pub trait Cloudable: Sized {
    /// Stable record-type tag.
    const RECORD_TYPE: &'static str;

    /// Property metadata. Called once at registration.
    fn schema() -> SchemaDescriptor;

    fn primary_key(&self) -> &str;

    fn to_object(&self) -> LocalObject;

    fn from_object(object: &LocalObject) -> Result<Self>;
}

/// Immutable set of registered schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    version: u32,
    types: BTreeMap<String, SchemaDescriptor>,
}

impl SchemaRegistry {
    pub fn builder(version: u32) -> SchemaRegistryBuilder {
        SchemaRegistryBuilder {
            version,
            descriptors: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Local schema version stamped onto outbound records.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get(&self, record_type: &str) -> Option<&SchemaDescriptor> {
        self.types.get(record_type)
    }

    pub fn record_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn contains(&self, record_type: &str) -> bool {
        self.types.contains_key(record_type)
    }
}

/// Collects descriptors and validates them as a whole.
pub struct SchemaRegistryBuilder {
    version: u32,
    descriptors: Vec<SchemaDescriptor>,
    /// Type tags claimed by registered `Cloudable` types, with the record
    /// type their descriptor declares.
    tags: Vec<(&'static str, String)>,
}

impl SchemaRegistryBuilder {
    pub fn register<T: Cloudable>(mut self) -> Self {
        let descriptor = T::schema();
        self.tags.push((T::RECORD_TYPE, descriptor.record_type.clone()));
        self.descriptor(descriptor)
    }

    pub fn descriptor(mut self, descriptor: SchemaDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Validate every descriptor and freeze the registry.
    ///
    /// # Errors
    /// Returns [`SyncError::SchemaValidation`] on the first contract violation.
    pub fn build(self) -> Result<SchemaRegistry> {
        for (tag, declared) in &self.tags {
            if tag != declared {
                return Err(SchemaValidationError::RecordTypeMismatch {
                    tag: tag.to_string(),
                    declared: declared.clone(),
                }
                .into());
            }
        }

        let mut types = BTreeMap::new();
        for descriptor in self.descriptors {
            descriptor.validate()?;
            let record_type = descriptor.record_type.clone();
            if types.insert(record_type.clone(), descriptor).is_some() {
                return Err(SchemaValidationError::DuplicateType(record_type).into());
            }
        }

        for descriptor in types.values() {
            for property in &descriptor.properties {
                if let Some(target) = property.kind.target() {
                    if !types.contains_key(target) {
                        return Err(SyncError::SchemaValidation(
                            SchemaValidationError::UnknownTarget {
                                record_type: descriptor.record_type.clone(),
                                property: property.name.clone(),
                                target: target.to_string(),
                            },
                        ));
                    }
                }
            }
        }

        Ok(SchemaRegistry {
            version: self.version,
            types,
        })
    }
}

//! Bidirectional mapping between local objects and remote records.
//!
//! Outbound, relationships are linearized into identifier references.
//! Inbound, they are never written directly: each relationship property
//! becomes a [`PendingRelationship`] for the caller to queue.

use chrono::Utc;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::record::{FieldValue, LocalObject, RecordId, RecordValue, RemoteRecord, Value};
use crate::schema::{PropertyDescriptor, PropertyKind, ScalarType, SchemaDescriptor, SchemaRegistry};
use crate::sync::pending::PendingRelationship;
use crate::sync::zone::ZonePolicy;

/// Stateless converter bound to a schema registry and zone policy.
#[derive(Debug, Clone)]
pub struct ObjectConverter {
    registry: SchemaRegistry,
    zones: ZonePolicy,
}

impl ObjectConverter {
    pub fn new(registry: SchemaRegistry, zones: ZonePolicy) -> Self {
        Self { registry, zones }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn zone_policy(&self) -> &ZonePolicy {
        &self.zones
    }

    /// Remote address of a local object.
    pub fn record_id(&self, record_type: &str, id: &str) -> RecordId {
        RecordId {
            record_type: record_type.to_string(),
            record_name: id.to_string(),
            zone: self.zones.zone_for(record_type),
        }
    }

    fn schema(&self, record_type: &str, id: &str) -> Result<&SchemaDescriptor> {
        self.registry
            .get(record_type)
            .ok_or_else(|| SyncError::corrupted(record_type, id, "record type is not registered"))
    }

    /// Convert a local object into its remote record.
    ///
    /// # Errors
    /// Returns [`SyncError::Corrupted`] if the type is unknown or a field does
    /// not match its declared kind.
    pub fn object_to_record(&self, object: &LocalObject) -> Result<RemoteRecord> {
        let schema = self.schema(&object.object_type, &object.id)?;
        let mut record = RemoteRecord::new(
            self.record_id(&object.object_type, &object.id),
            self.registry.version(),
        );

        for property in schema.synced_properties() {
            let Some(field) = object.field(&property.name) else {
                continue;
            };
            let value = match (&property.kind, field) {
                (PropertyKind::Scalar { .. }, FieldValue::Scalar(Value::Null)) => None,
                (PropertyKind::Scalar { .. }, FieldValue::Scalar(value)) => {
                    Some(RecordValue::Value(value.clone()))
                }
                (PropertyKind::Array { .. }, FieldValue::Array(values)) => {
                    Some(RecordValue::List(values.clone()))
                }
                (PropertyKind::ToOne { .. }, FieldValue::ToOne(target)) => {
                    target.clone().map(RecordValue::Reference)
                }
                (PropertyKind::ToMany { .. }, FieldValue::ToMany(targets)) => {
                    (!targets.is_empty()).then(|| RecordValue::ReferenceList(targets.clone()))
                }
                (PropertyKind::Derived { .. }, _) => None,
                (kind, field) => {
                    return Err(SyncError::corrupted(
                        &object.object_type,
                        &object.id,
                        format!("field '{}' holds {:?}, declared {:?}", property.name, field, kind),
                    ))
                }
            };
            if let Some(value) = value {
                record.set(&property.name, value);
            }
        }

        Ok(record)
    }

    /// Build a local object from a remote record.
    ///
    /// Returns the object with scalar and array fields populated, plus one
    /// pending relationship per stored relationship property.
    ///
    /// # Errors
    /// Returns [`SyncError::Corrupted`] if the record type is unknown or a
    /// relationship property holds a non-reference value.
    pub fn record_to_object(
        &self,
        record: &RemoteRecord,
    ) -> Result<(LocalObject, Vec<PendingRelationship>)> {
        let record_type = record.record_type();
        let id = record.record_name();
        let schema = self.schema(record_type, id)?;

        if record.schema_version > self.registry.version() {
            warn!(
                object_type = record_type,
                identifier = id,
                record_version = record.schema_version,
                local_version = self.registry.version(),
                "record written by a newer schema"
            );
        }

        let mut object = LocalObject::new(record_type, id);
        object.fields.insert(
            schema.primary_key.clone(),
            FieldValue::Scalar(Value::String(id.to_string())),
        );
        let mut relationships = Vec::new();

        for property in schema.synced_properties() {
            let value = record.get(&property.name);
            match &property.kind {
                PropertyKind::Scalar { scalar } => {
                    let scalar = read_scalar(record, property, *scalar, value);
                    object.fields.insert(property.name.clone(), FieldValue::Scalar(scalar));
                }
                PropertyKind::Array { scalar } => {
                    let values = read_array(record, property, *scalar, value);
                    object.fields.insert(property.name.clone(), FieldValue::Array(values));
                }
                PropertyKind::ToOne { target } | PropertyKind::ToMany { target } => {
                    let targets = match value {
                        None => Vec::new(),
                        Some(RecordValue::Reference(id)) => vec![id.clone()],
                        Some(RecordValue::ReferenceList(ids)) => ids.clone(),
                        Some(other) => {
                            return Err(SyncError::corrupted(
                                record_type,
                                id,
                                format!("relationship '{}' holds {:?}", property.name, other),
                            ))
                        }
                    };
                    relationships.push(PendingRelationship {
                        from_type: record_type.to_string(),
                        from_identifier: id.to_string(),
                        property: property.name.clone(),
                        to_type: target.clone(),
                        targets,
                    });
                }
                PropertyKind::Derived { .. } => {}
            }
        }

        Ok((object, relationships))
    }
}

/// Value used when a scalar is absent from an inbound record.
///
/// Optional properties become null. Required ones take the type's zero
/// value, with dates defaulting to the current time.
pub fn absent_value(scalar: ScalarType, optional: bool) -> Value {
    if optional {
        return Value::Null;
    }
    match scalar {
        ScalarType::Bool => Value::Bool(false),
        ScalarType::Int => Value::Int(0),
        ScalarType::Double => Value::Double(0.0),
        ScalarType::String => Value::String(String::new()),
        ScalarType::Date => Value::Date(Utc::now()),
        ScalarType::Bytes => Value::Bytes(Vec::new()),
    }
}

/// Coerce a value into `scalar`. Integers widen to doubles; nothing else converts.
fn coerce(value: &Value, scalar: ScalarType) -> Option<Value> {
    match (value, scalar) {
        (Value::Int(i), ScalarType::Double) => Some(Value::Double(*i as f64)),
        (value, scalar) if value.scalar_type() == Some(scalar) => Some(value.clone()),
        _ => None,
    }
}

fn read_scalar(
    record: &RemoteRecord,
    property: &PropertyDescriptor,
    scalar: ScalarType,
    value: Option<&RecordValue>,
) -> Value {
    match value {
        None | Some(RecordValue::Value(Value::Null)) => absent_value(scalar, property.optional),
        Some(RecordValue::Value(value)) => coerce(value, scalar).unwrap_or_else(|| {
            warn!(
                record = %record.id,
                property = %property.name,
                expected = ?scalar,
                "mismatched scalar, using default"
            );
            absent_value(scalar, property.optional)
        }),
        Some(other) => {
            warn!(record = %record.id, property = %property.name, value = ?other, "expected a scalar, using default");
            absent_value(scalar, property.optional)
        }
    }
}

fn read_array(
    record: &RemoteRecord,
    property: &PropertyDescriptor,
    scalar: ScalarType,
    value: Option<&RecordValue>,
) -> Vec<Value> {
    match value {
        None | Some(RecordValue::Value(Value::Null)) => Vec::new(),
        Some(RecordValue::List(values)) => {
            let coerced: Option<Vec<Value>> = values.iter().map(|v| coerce(v, scalar)).collect();
            coerced.unwrap_or_else(|| {
                warn!(record = %record.id, property = %property.name, expected = ?scalar, "mismatched array element, using empty list");
                Vec::new()
            })
        }
        Some(other) => {
            warn!(record = %record.id, property = %property.name, value = ?other, "expected a list, using empty list");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ZoneId;
    use crate::schema::SchemaDescriptor;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder(2)
            .descriptor(
                SchemaDescriptor::new("Pilot", "id")
                    .scalar("id", ScalarType::String)
                    .scalar("name", ScalarType::String)
                    .scalar("age", ScalarType::Int)
                    .optional("nickname", ScalarType::String)
                    .scalar("rating", ScalarType::Double)
                    .scalar("active", ScalarType::Bool)
                    .scalar("hired_at", ScalarType::Date)
                    .array("licences", ScalarType::String)
                    .scalar("session_token", ScalarType::String)
                    .not_synced("session_token")
                    .derived("flights", "Flight"),
            )
            .descriptor(
                SchemaDescriptor::new("Flight", "id")
                    .scalar("id", ScalarType::String)
                    .scalar("number", ScalarType::String)
                    .to_one("pilot", "Pilot")
                    .to_many("crew", "Pilot"),
            )
            .build()
            .unwrap()
    }

    fn converter() -> ObjectConverter {
        ObjectConverter::new(registry(), ZonePolicy::PerType)
    }

    #[test]
    fn test_outbound_copies_synced_fields_only() {
        let pilot = LocalObject::new("Pilot", "p1339")
            .with("id", "p1339")
            .with("name", "Amy")
            .with("age", 30_i64)
            .with("nickname", None::<String>)
            .with("session_token", "secret")
            .with_field("licences", FieldValue::Array(vec!["A320".into()]))
            .with_field("flights", FieldValue::ToMany(vec!["f1".into()]));

        let record = converter().object_to_record(&pilot).unwrap();
        assert_eq!(record.id.zone, ZoneId::new("Pilot"));
        assert_eq!(record.record_name(), "p1339");
        assert_eq!(record.schema_version, 2);
        assert_eq!(record.get("name"), Some(&RecordValue::Value("Amy".into())));
        assert_eq!(record.get("age"), Some(&RecordValue::Value(Value::Int(30))));
        assert_eq!(record.get("licences"), Some(&RecordValue::List(vec!["A320".into()])));
        assert!(record.get("id").is_none());
        assert!(record.get("nickname").is_none());
        assert!(record.get("session_token").is_none());
        assert!(record.get("flights").is_none());
    }

    #[test]
    fn test_outbound_linearizes_relationships() {
        let flight = LocalObject::new("Flight", "f1")
            .with("id", "f1")
            .with("number", "LH400")
            .with_field("pilot", FieldValue::ToOne(Some("p1339".into())))
            .with_field("crew", FieldValue::ToMany(vec!["p2".into(), "p1".into()]));
        let record = converter().object_to_record(&flight).unwrap();
        assert_eq!(record.get("pilot"), Some(&RecordValue::Reference("p1339".into())));
        assert_eq!(
            record.get("crew"),
            Some(&RecordValue::ReferenceList(vec!["p2".into(), "p1".into()]))
        );

        let bare = LocalObject::new("Flight", "f2")
            .with("id", "f2")
            .with_field("pilot", FieldValue::ToOne(None))
            .with_field("crew", FieldValue::ToMany(Vec::new()));
        let record = converter().object_to_record(&bare).unwrap();
        assert!(record.get("pilot").is_none());
        assert!(record.get("crew").is_none());
    }

    #[test]
    fn test_outbound_rejects_mismatched_field() {
        let flight = LocalObject::new("Flight", "f1").with("pilot", "p1339");
        let err = converter().object_to_record(&flight).unwrap_err();
        assert!(matches!(err, SyncError::Corrupted { .. }));
    }

    #[test]
    fn test_unknown_type_is_corrupted() {
        let err = converter()
            .object_to_record(&LocalObject::new("Hangar", "h1"))
            .unwrap_err();
        assert!(matches!(err, SyncError::Corrupted { .. }));
    }

    #[test]
    fn test_inbound_defaults_absent_fields() {
        let c = converter();
        let record = RemoteRecord::new(c.record_id("Pilot", "p7"), 2);
        let before = Utc::now();
        let (pilot, relationships) = c.record_to_object(&record).unwrap();

        assert!(relationships.is_empty());
        assert_eq!(pilot.scalar("id"), Some(&Value::from("p7")));
        assert_eq!(pilot.scalar("name"), Some(&Value::from("")));
        assert_eq!(pilot.scalar("age"), Some(&Value::Int(0)));
        assert_eq!(pilot.scalar("rating"), Some(&Value::Double(0.0)));
        assert_eq!(pilot.scalar("active"), Some(&Value::Bool(false)));
        assert_eq!(pilot.scalar("nickname"), Some(&Value::Null));
        assert_eq!(pilot.array("licences"), Some(&[][..]));
        assert!(pilot.scalar("hired_at").and_then(Value::as_date).unwrap() >= before);
        assert!(pilot.field("session_token").is_none());
        assert!(pilot.field("flights").is_none());
    }

    #[test]
    fn test_inbound_coerces_and_defaults_mismatches() {
        let c = converter();
        let mut record = RemoteRecord::new(c.record_id("Pilot", "p7"), 2);
        record.set("rating", RecordValue::Value(Value::Int(4)));
        record.set("age", RecordValue::Value("thirty".into()));
        record.set("licences", RecordValue::List(vec![Value::Int(1)]));

        let (pilot, _) = c.record_to_object(&record).unwrap();
        assert_eq!(pilot.scalar("rating"), Some(&Value::Double(4.0)));
        assert_eq!(pilot.scalar("age"), Some(&Value::Int(0)));
        assert_eq!(pilot.array("licences"), Some(&[][..]));
    }

    #[test]
    fn test_inbound_defers_every_relationship() {
        let c = converter();
        let mut record = RemoteRecord::new(c.record_id("Flight", "f1"), 2);
        record.set("number", RecordValue::Value("LH400".into()));
        record.set("pilot", RecordValue::Reference("p1339".into()));

        let (flight, relationships) = c.record_to_object(&record).unwrap();
        assert!(flight.field("pilot").is_none());
        assert!(flight.field("crew").is_none());
        assert_eq!(
            relationships,
            vec![
                PendingRelationship {
                    from_type: "Flight".into(),
                    from_identifier: "f1".into(),
                    property: "pilot".into(),
                    to_type: "Pilot".into(),
                    targets: vec!["p1339".into()],
                },
                PendingRelationship {
                    from_type: "Flight".into(),
                    from_identifier: "f1".into(),
                    property: "crew".into(),
                    to_type: "Pilot".into(),
                    targets: vec![],
                },
            ]
        );
    }

    #[test]
    fn test_inbound_relationship_with_scalar_is_corrupted() {
        let c = converter();
        let mut record = RemoteRecord::new(c.record_id("Flight", "f1"), 2);
        record.set("pilot", RecordValue::Value(Value::Int(5)));
        assert!(matches!(
            c.record_to_object(&record),
            Err(SyncError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_newer_schema_version_still_applies() {
        let c = converter();
        let mut record = RemoteRecord::new(c.record_id("Pilot", "p1"), 9);
        record.set("name", RecordValue::Value("Amy".into()));
        let (pilot, _) = c.record_to_object(&record).unwrap();
        assert_eq!(pilot.scalar("name"), Some(&Value::from("Amy")));
    }

    #[test]
    fn test_shared_zone_addressing() {
        let c = ObjectConverter::new(registry(), ZonePolicy::Shared("Fleet".into()));
        assert_eq!(c.record_id("Pilot", "p1").zone, ZoneId::new("Fleet"));
        assert_eq!(c.record_id("Flight", "f1").zone, ZoneId::new("Fleet"));
    }

    mod roundtrip {
        use super::*;
        use chrono::TimeZone;
        use proptest::prelude::*;

        fn pilot_strategy() -> impl Strategy<Value = LocalObject> {
            (
                "[a-z0-9]{1,12}",
                ".{0,20}",
                any::<i64>(),
                proptest::option::of("[a-zA-Z ]{0,10}"),
                -1.0e9..1.0e9f64,
                any::<bool>(),
                0i64..4_000_000_000,
                proptest::collection::vec("[A-Z0-9]{1,6}", 0..4),
            )
                .prop_map(|(id, name, age, nickname, rating, active, secs, licences)| {
                    LocalObject::new("Pilot", id.clone())
                        .with("id", id)
                        .with("name", name)
                        .with("age", age)
                        .with("nickname", nickname)
                        .with("rating", rating)
                        .with("active", active)
                        .with("hired_at", Utc.timestamp_opt(secs, 0).unwrap())
                        .with_field(
                            "licences",
                            FieldValue::Array(licences.into_iter().map(Value::from).collect()),
                        )
                        .with("session_token", "local only")
                })
        }

        proptest! {
            #[test]
            fn synced_scalars_survive_a_round_trip(pilot in pilot_strategy()) {
                let c = converter();
                let record = c.object_to_record(&pilot).unwrap();
                let (back, relationships) = c.record_to_object(&record).unwrap();

                prop_assert!(relationships.is_empty());
                prop_assert_eq!(&back.id, &pilot.id);
                for name in ["id", "name", "age", "nickname", "rating", "active", "hired_at", "licences"] {
                    prop_assert_eq!(back.field(name), pilot.field(name), "field {}", name);
                }
                prop_assert!(back.field("session_token").is_none());
            }
        }
    }
}

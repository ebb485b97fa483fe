//! Zone partitioning policy.

use std::fmt;
use std::sync::Arc;

use crate::record::ZoneId;

/// Selects the remote zone for a record type. Chosen once at startup.
#[derive(Clone, Default)]
pub enum ZonePolicy {
    /// One zone per record type, named after the type.
    #[default]
    PerType,
    /// Every type in a single named zone.
    Shared(String),
    /// The platform default zone.
    Default,
    /// Caller-supplied rule.
    Custom(Arc<dyn Fn(&str) -> ZoneId + Send + Sync>),
}

impl ZonePolicy {
    pub fn custom<F>(rule: F) -> Self
    where
        F: Fn(&str) -> ZoneId + Send + Sync + 'static,
    {
        ZonePolicy::Custom(Arc::new(rule))
    }

    pub fn zone_for(&self, record_type: &str) -> ZoneId {
        match self {
            ZonePolicy::PerType => ZoneId::new(record_type),
            ZonePolicy::Shared(name) => ZoneId::new(name.clone()),
            ZonePolicy::Default => ZoneId::default_zone(),
            ZonePolicy::Custom(rule) => rule(record_type),
        }
    }
}

impl fmt::Debug for ZonePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZonePolicy::PerType => f.write_str("PerType"),
            ZonePolicy::Shared(name) => f.debug_tuple("Shared").field(name).finish(),
            ZonePolicy::Default => f.write_str("Default"),
            ZonePolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for ZonePolicy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ZonePolicy::PerType, ZonePolicy::PerType) => true,
            (ZonePolicy::Default, ZonePolicy::Default) => true,
            (ZonePolicy::Shared(a), ZonePolicy::Shared(b)) => a == b,
            (ZonePolicy::Custom(a), ZonePolicy::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

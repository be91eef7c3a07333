// ABOUTME: Identity values and id generation for the connector.
// ABOUTME: Non-empty string newtypes, the client identity, and injectable id generators.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axon_proto::control::ClientIdentification;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConnectorError;

macro_rules! identity_value {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, ConnectorError> {
                let value = value.into();
                if value.is_empty() {
                    Err(ConnectorError::InvalidArgument(format!(
                        "{} must not be empty",
                        $label
                    )))
                } else {
                    Ok(Self(value))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Wrap a value that is non-empty by construction.
            #[allow(dead_code)]
            pub(crate) fn from_generated(value: String) -> Self {
                debug_assert!(!value.is_empty());
                Self(value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ConnectorError;
            fn try_from(value: String) -> Result<Self, Self::Error> {
                $name::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ConnectorError;
            fn try_from(value: &str) -> Result<Self, Self::Error> {
                $name::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

identity_value!(
    /// Identifies one running instance of a client application.
    ClientInstanceId,
    "client instance id"
);
identity_value!(
    /// Logical name of the application component.
    ComponentName,
    "component name"
);
identity_value!(
    /// A logical partition on the server that a connection targets.
    Context,
    "context"
);
identity_value!(CommandName, "command name");
identity_value!(QueryName, "query name");
identity_value!(
    /// Correlates an instruction with its acknowledgement.
    InstructionId,
    "instruction id"
);
identity_value!(SubscriptionId, "subscription id");
identity_value!(
    /// Identifies one handler registration.
    RegistrationId,
    "registration id"
);
identity_value!(AggregateId, "aggregate id");
identity_value!(EventProcessorName, "event processor name");
identity_value!(
    /// Server handle of a scheduled event, used to cancel or reschedule it.
    ScheduledEventToken,
    "scheduled event token"
);

/// One segment of an event processor's token space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(i32);

impl SegmentId {
    pub fn new(value: i32) -> Self {
        Self(value)
    }

    pub fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Context {
    pub const DEFAULT: &'static str = "default";
}

impl Default for Context {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

/// Weight advertised with a command subscription. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct LoadFactor(i32);

impl LoadFactor {
    pub fn new(value: i32) -> Result<Self, ConnectorError> {
        if value <= 0 {
            return Err(ConnectorError::InvalidArgument(format!(
                "load factor must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl Default for LoadFactor {
    fn default() -> Self {
        Self(100)
    }
}

impl TryFrom<i32> for LoadFactor {
    type Error = ConnectorError;
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        LoadFactor::new(value)
    }
}

impl From<LoadFactor> for i32 {
    fn from(value: LoadFactor) -> i32 {
        value.0
    }
}

/// A query name together with the result type its handlers produce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryDefinition {
    pub query_name: QueryName,
    pub result_type: String,
}

impl QueryDefinition {
    pub fn new(query_name: QueryName, result_type: impl Into<String>) -> Self {
        Self {
            query_name,
            result_type: result_type.into(),
        }
    }
}

/// Identifies this client to the server on every handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub component_name: ComponentName,
    pub client_instance_id: ClientInstanceId,
    pub tags: HashMap<String, String>,
    pub version: String,
}

impl ClientIdentity {
    pub fn new(component_name: ComponentName, client_instance_id: ClientInstanceId) -> Self {
        Self {
            component_name,
            client_instance_id,
            tags: HashMap::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn to_identification(&self) -> ClientIdentification {
        ClientIdentification {
            client_id: self.client_instance_id.to_string(),
            component_name: self.component_name.to_string(),
            tags: self.tags.clone(),
            version: self.version.clone(),
        }
    }
}

/// Produces instruction, subscription and registration ids.
///
/// Passed explicitly to every component that mints ids, so tests can swap in
/// a deterministic sequence.
#[derive(Debug, Clone, Default)]
pub enum IdGenerator {
    #[default]
    Random,
    Sequential { prefix: String, next: Arc<AtomicU64> },
}

impl IdGenerator {
    pub fn random() -> Self {
        IdGenerator::Random
    }

    /// Ids of the form `{prefix}-1`, `{prefix}-2`, ...
    pub fn sequential(prefix: impl Into<String>) -> Self {
        IdGenerator::Sequential {
            prefix: prefix.into(),
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_id(&self) -> String {
        match self {
            IdGenerator::Random => Uuid::new_v4().to_string(),
            IdGenerator::Sequential { prefix, next } => {
                let value = next.fetch_add(1, Ordering::Relaxed);
                format!("{prefix}-{value}")
            }
        }
    }

    pub fn instruction_id(&self) -> InstructionId {
        InstructionId::from_generated(self.next_id())
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        SubscriptionId::from_generated(self.next_id())
    }

    pub fn registration_id(&self) -> RegistrationId {
        RegistrationId::from_generated(self.next_id())
    }

    pub fn client_instance_id(&self) -> ClientInstanceId {
        ClientInstanceId::from_generated(self.next_id())
    }
}

/// Monotonic tokens for [`crate::task_cache::TaskCache`] and scheduler handles.
///
/// Clones share the sequence, so a token is never handed out twice.
#[derive(Debug, Default, Clone)]
pub struct TokenSequence {
    last: Arc<AtomicU64>,
}

impl TokenSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_values_are_rejected() {
        assert!(ComponentName::new("").is_err());
        assert!(CommandName::new(String::new()).is_err());
        assert!(InstructionId::try_from("").is_err());
        assert!(AggregateId::new("").is_err());
        assert!(ScheduledEventToken::try_from("").is_err());
        assert!(Context::new("orders").is_ok());
    }

    #[test]
    fn test_values_compare_by_content() {
        let a = CommandName::new("ping").unwrap();
        let b = CommandName::new(String::from("ping")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "ping");
        assert_eq!(format!("{a:?}"), "CommandName(\"ping\")");
    }

    #[test]
    fn test_default_context() {
        assert_eq!(Context::default().as_str(), "default");
    }

    #[test]
    fn test_serde_validates_identity_values() {
        let name: QueryName = serde_json::from_str("\"orders\"").unwrap();
        assert_eq!(name.as_str(), "orders");
        assert!(serde_json::from_str::<QueryName>("\"\"").is_err());
        assert!(serde_json::from_str::<LoadFactor>("0").is_err());
    }

    #[test]
    fn test_load_factor_must_be_positive() {
        assert!(LoadFactor::new(0).is_err());
        assert!(LoadFactor::new(-3).is_err());
        assert_eq!(LoadFactor::new(1).unwrap().value(), 1);
    }

    #[test]
    fn test_sequential_ids_are_deterministic_and_shared_across_clones() {
        let ids = IdGenerator::sequential("test");
        let clone = ids.clone();
        assert_eq!(ids.instruction_id().as_str(), "test-1");
        assert_eq!(clone.subscription_id().as_str(), "test-2");
        assert_eq!(ids.registration_id().as_str(), "test-3");
    }

    #[test]
    fn test_random_ids_are_unique() {
        let ids = IdGenerator::random();
        assert_ne!(ids.instruction_id(), ids.instruction_id());
    }

    #[test]
    fn test_token_sequence_is_monotonic() {
        let tokens = TokenSequence::new();
        assert_eq!(tokens.next(), 1);
        assert_eq!(tokens.next(), 2);
    }

    #[test]
    fn test_client_identity_to_identification() {
        let identity = ClientIdentity::new(
            ComponentName::new("orders").unwrap(),
            ClientInstanceId::new("orders-1").unwrap(),
        )
        .with_tags(HashMap::from([("region".to_string(), "eu".to_string())]))
        .with_version("1.2.3");

        let identification = identity.to_identification();
        assert_eq!(identification.client_id, "orders-1");
        assert_eq!(identification.component_name, "orders");
        assert_eq!(identification.tags.get("region").map(String::as_str), Some("eu"));
        assert_eq!(identification.version, "1.2.3");
    }
}

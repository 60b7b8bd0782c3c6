//! Identifier and addressing types shared by every bus component.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form transport headers. `BTreeMap` keeps serialization order deterministic.
pub type Headers = BTreeMap<String, String>;

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// UUID-backed identifiers
// ---------------------------------------------------------------------------

/// Generate a UUID newtype with random construction, parsing and `Display`.
macro_rules! uuid_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random (v4) identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Globally unique key of a saga instance, and of the conversation a message belongs to.
    CorrelationId
);

uuid_id!(
    /// Identity of a single message. Preserved across scheduled redeliveries.
    MessageId
);

// ---------------------------------------------------------------------------
// EndpointAddress
// ---------------------------------------------------------------------------

/// Logical address of a receive endpoint (a queue name for most transports).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointAddress(Arc<str>);

impl EndpointAddress {
    /// Suffix appended to an address to form its dead-letter queue.
    pub const ERROR_SUFFIX: &'static str = "_error";

    #[must_use]
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(Arc::from(address.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address of the dead-letter queue paired with this endpoint.
    #[must_use]
    pub fn error_queue(&self) -> Self {
        Self::new(format!("{}{}", self.0, Self::ERROR_SUFFIX))
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

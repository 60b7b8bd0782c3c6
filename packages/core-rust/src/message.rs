//! Message contract and the immutable, type-tagged envelope that carries it.
//!
//! Payloads are encoded as named `MsgPack` via `rmp_serde::to_vec_named()` so
//! field names survive schema evolution on either side of the wire.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A payload type that can travel through the bus.
///
/// `MESSAGE_TYPE` is the stable wire name used to select the filter chain for
/// the message; it must be unique among the types registered with a dispatcher.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire name of this message type (e.g. `"service.check-status"`).
    const MESSAGE_TYPE: &'static str;
}

/// Errors from encoding or decoding an [`Envelope`] payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {message_type}: {source}")]
    Encode {
        message_type: &'static str,
        #[source]
        source: rmp_serde::encode::Error,
    },
    #[error("failed to decode {message_type}: {source}")]
    Decode {
        message_type: String,
        #[source]
        source: rmp_serde::decode::Error,
    },
    #[error("envelope carries {actual}, expected {expected}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },
}

/// Immutable serialized message tagged with its wire type name.
///
/// Cloning is cheap: both the type name and the payload are reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    message_type: Arc<str>,
    payload: Bytes,
}

impl Envelope {
    /// Encodes `message` into a new envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the message cannot be serialized.
    pub fn encode<M: Message>(message: &M) -> Result<Self, CodecError> {
        let payload = rmp_serde::to_vec_named(message).map_err(|source| CodecError::Encode {
            message_type: M::MESSAGE_TYPE,
            source,
        })?;
        Ok(Self {
            message_type: Arc::from(M::MESSAGE_TYPE),
            payload: Bytes::from(payload),
        })
    }

    /// Rebuilds an envelope from raw parts received off a transport.
    #[must_use]
    pub fn from_parts(message_type: impl AsRef<str>, payload: Bytes) -> Self {
        Self {
            message_type: Arc::from(message_type.as_ref()),
            payload,
        }
    }

    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether this envelope carries a message of type `M`.
    #[must_use]
    pub fn is<M: Message>(&self) -> bool {
        &*self.message_type == M::MESSAGE_TYPE
    }

    /// Decodes the payload as `M`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] if the envelope carries a different
    /// message type, or [`CodecError::Decode`] if the payload is malformed.
    pub fn decode<M: Message>(&self) -> Result<M, CodecError> {
        if !self.is::<M>() {
            return Err(CodecError::TypeMismatch {
                expected: M::MESSAGE_TYPE,
                actual: self.message_type.to_string(),
            });
        }
        rmp_serde::from_slice(&self.payload).map_err(|source| CodecError::Decode {
            message_type: self.message_type.to_string(),
            source,
        })
    }
}

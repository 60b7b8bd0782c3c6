//! Courier core: message envelopes, identifiers, delivery metadata and consume context.

pub mod context;
pub mod fault;
pub mod message;
pub mod outbound;
pub mod types;

pub use context::{ConsumeContext, DeliveryMetadata};
pub use fault::Fault;
pub use message::{CodecError, Envelope, Message};
pub use outbound::{OutboundMessage, Route};
pub use types::{now_millis, CorrelationId, EndpointAddress, Headers, MessageId};

/// Re-exported so downstream crates share one cancellation token type.
pub use tokio_util::sync::CancellationToken;

//! Delivery metadata and the per-dispatch consume context.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::message::{CodecError, Envelope, Message};
use crate::outbound::{OutboundMessage, Route};
use crate::types::{now_millis, CorrelationId, EndpointAddress, Headers, MessageId};

/// Transport-level metadata travelling alongside an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    /// Identity of the message. Kept unchanged when the message is redelivered.
    pub message_id: MessageId,
    /// Conversation / saga correlation carried by the sender, if any.
    pub correlation_id: Option<CorrelationId>,
    /// Set on requests; copied onto responses so the requester can match them.
    pub request_id: Option<MessageId>,
    /// Endpoint that produced the message.
    pub source_address: Option<EndpointAddress>,
    /// Endpoint the message was sent to.
    pub destination_address: Option<EndpointAddress>,
    /// Where responses should be sent. Responses are published when absent.
    pub response_address: Option<EndpointAddress>,
    /// Where fault notifications should be sent.
    pub fault_address: Option<EndpointAddress>,
    pub headers: Headers,
    /// Number of scheduled redeliveries this copy has gone through.
    pub redelivery_count: u32,
    pub sent_at_millis: u64,
}

impl DeliveryMetadata {
    /// Metadata for a brand-new message: fresh id, current timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: None,
            request_id: None,
            source_address: None,
            destination_address: None,
            response_address: None,
            fault_address: None,
            headers: Headers::new(),
            redelivery_count: 0,
            sent_at_millis: now_millis(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Marks the message as a request whose responses go to `response_address`.
    #[must_use]
    pub fn as_request(mut self, response_address: EndpointAddress) -> Self {
        self.request_id = Some(self.message_id);
        self.response_address = Some(response_address);
        self
    }

    #[must_use]
    pub fn with_fault_address(mut self, fault_address: EndpointAddress) -> Self {
        self.fault_address = Some(fault_address);
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

impl Default for DeliveryMetadata {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ConsumeContext
// ---------------------------------------------------------------------------

/// A received message plus its delivery metadata and cancellation signal.
///
/// Owned by the dispatch call that received it. Stages may adjust headers but
/// never the envelope, which stays immutable for the lifetime of the message.
#[derive(Debug, Clone)]
pub struct ConsumeContext {
    envelope: Envelope,
    delivery: DeliveryMetadata,
    cancellation: CancellationToken,
}

impl ConsumeContext {
    #[must_use]
    pub fn new(
        envelope: Envelope,
        delivery: DeliveryMetadata,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            envelope,
            delivery,
            cancellation,
        }
    }

    /// Convenience constructor for a freshly sent message with its own token.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the message cannot be serialized.
    pub fn for_message<M: Message>(message: &M) -> Result<Self, CodecError> {
        Ok(Self::new(
            Envelope::encode(message)?,
            DeliveryMetadata::new(),
            CancellationToken::new(),
        ))
    }

    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    #[must_use]
    pub fn message_type(&self) -> &str {
        self.envelope.message_type()
    }

    #[must_use]
    pub fn delivery(&self) -> &DeliveryMetadata {
        &self.delivery
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.delivery.headers
    }

    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.delivery.message_id
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.delivery.correlation_id
    }

    #[must_use]
    pub fn redelivery_count(&self) -> u32 {
        self.delivery.redelivery_count
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Decodes the carried message as `M`.
    ///
    /// # Errors
    ///
    /// See [`Envelope::decode`].
    pub fn message<M: Message>(&self) -> Result<M, CodecError> {
        self.envelope.decode().inspect_err(|err| {
            tracing::debug!(
                message_id = %self.delivery.message_id,
                error = %err,
                "failed to decode consumed message"
            );
        })
    }

    /// Replaces the consume context's metadata with `delivery` (e.g. with overridden
    /// correlation). The envelope and cancellation token are kept.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryMetadata) -> Self {
        self.delivery = delivery;
        self
    }

    // --- Outbound message construction ---

    fn derived_metadata(&self) -> DeliveryMetadata {
        DeliveryMetadata {
            correlation_id: self.delivery.correlation_id,
            source_address: self.delivery.destination_address.clone(),
            ..DeliveryMetadata::new()
        }
    }

    /// Builds a response to this message, routed to its response address (or
    /// published when the sender supplied none).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the response cannot be serialized.
    pub fn respond<M: Message>(&self, message: &M) -> Result<OutboundMessage, CodecError> {
        let route = self
            .delivery
            .response_address
            .clone()
            .map_or(Route::Publish, Route::Send);
        let delivery = DeliveryMetadata {
            request_id: self.delivery.request_id,
            ..self.derived_metadata()
        };
        Ok(OutboundMessage::new(route, Envelope::encode(message)?, delivery))
    }

    /// Builds a publish of `message` correlated with this one.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the message cannot be serialized.
    pub fn publish<M: Message>(&self, message: &M) -> Result<OutboundMessage, CodecError> {
        Ok(OutboundMessage::new(
            Route::Publish,
            Envelope::encode(message)?,
            self.derived_metadata(),
        ))
    }

    /// Builds a send of `message` to `destination`, correlated with this one.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the message cannot be serialized.
    pub fn send<M: Message>(
        &self,
        destination: EndpointAddress,
        message: &M,
    ) -> Result<OutboundMessage, CodecError> {
        Ok(OutboundMessage::new(
            Route::Send(destination),
            Envelope::encode(message)?,
            self.derived_metadata(),
        ))
    }

    /// Builds the copy of this message used for scheduled redelivery attempt
    /// `attempt`: same envelope, same message id, bumped redelivery count.
    #[must_use]
    pub fn redelivery(&self, destination: EndpointAddress, attempt: u32) -> OutboundMessage {
        let delivery = DeliveryMetadata {
            redelivery_count: attempt,
            ..self.delivery.clone()
        };
        OutboundMessage::new(Route::Send(destination), self.envelope.clone(), delivery)
    }
}

//! Transport collaborator contracts plus an in-memory loopback implementation.
//!
//! The dispatch core only talks to a transport through [`SendTransport`]
//! (outbound send/publish) and [`FaultSink`] (fault notifications). Inbound
//! delivery is driven by a [`ReceiveEndpoint`], which turns each dispatch
//! result into a [`Disposition`].

pub mod endpoint;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{
    ConsumeContext, DeliveryMetadata, EndpointAddress, Envelope, Fault, OutboundMessage, Route,
};

use crate::error::DispatchError;
use crate::pipeline::{ConsumeOutcome, ConsumeResponse};

pub use endpoint::ReceiveEndpoint;
pub use memory::{InMemoryTransport, InboundDelivery};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no endpoint is bound at {address}")]
    NoRoute { address: EndpointAddress },
    #[error("endpoint {address} is closed")]
    Closed { address: EndpointAddress },
}

// ---------------------------------------------------------------------------
// SendTransport
// ---------------------------------------------------------------------------

/// Outbound half of a transport.
///
/// A successful call means the message was durably enqueued, not delivered.
#[async_trait]
pub trait SendTransport: Send + Sync {
    async fn send(
        &self,
        destination: &EndpointAddress,
        envelope: Envelope,
        delivery: DeliveryMetadata,
    ) -> Result<(), TransportError>;

    async fn publish(
        &self,
        envelope: Envelope,
        delivery: DeliveryMetadata,
    ) -> Result<(), TransportError>;

    /// Routes a message produced while consuming.
    async fn dispatch_outbound(&self, message: OutboundMessage) -> Result<(), TransportError> {
        match message.route {
            Route::Send(destination) => self.send(&destination, message.envelope, message.delivery).await,
            Route::Publish => self.publish(message.envelope, message.delivery).await,
        }
    }
}

// ---------------------------------------------------------------------------
// FaultSink
// ---------------------------------------------------------------------------

/// Receives fault notifications for messages that could not be processed.
#[async_trait]
pub trait FaultSink: Send + Sync {
    /// Reports `ctx`'s message as faulted.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Transport`] if the fault could not be
    /// enqueued.
    async fn fault(&self, ctx: &ConsumeContext, reason: &str) -> Result<(), DispatchError>;
}

/// Fault sink that sends a [`Fault`] message through a transport.
///
/// Faults go to the message's fault address, else its response address, else
/// they are published.
pub struct TransportFaultSink {
    transport: Arc<dyn SendTransport>,
}

impl TransportFaultSink {
    #[must_use]
    pub fn new(transport: Arc<dyn SendTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl FaultSink for TransportFaultSink {
    async fn fault(&self, ctx: &ConsumeContext, reason: &str) -> Result<(), DispatchError> {
        let fault = Fault::for_message(ctx, reason);
        let envelope = Envelope::encode(&fault)?;
        let delivery = DeliveryMetadata {
            correlation_id: ctx.correlation_id(),
            request_id: ctx.delivery().request_id,
            source_address: ctx.delivery().destination_address.clone(),
            ..DeliveryMetadata::new()
        };
        let route = ctx
            .delivery()
            .fault_address
            .clone()
            .or_else(|| ctx.delivery().response_address.clone())
            .map_or(Route::Publish, Route::Send);
        tracing::debug!(
            message_id = %ctx.message_id(),
            message_type = ctx.message_type(),
            reason,
            "sending fault"
        );
        self.transport
            .dispatch_outbound(OutboundMessage::new(route, envelope, delivery))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// What the receiving transport does with a delivery after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Put the message back on its queue for another attempt.
    Requeue,
    /// Move the message to the endpoint's error queue.
    DeadLetter,
}

impl Disposition {
    /// Maps a dispatch result to a disposition.
    ///
    /// Discarded and redelivered messages are acknowledged: the former was
    /// dropped on purpose, the latter lives on as a scheduled copy. A faulted
    /// message already produced its fault notification and is dead-lettered.
    #[must_use]
    pub fn for_result(result: &Result<ConsumeResponse, DispatchError>) -> Self {
        match result {
            Ok(resp) => match resp.outcome {
                ConsumeOutcome::Faulted { .. } => Self::DeadLetter,
                ConsumeOutcome::Consumed { .. }
                | ConsumeOutcome::Handled
                | ConsumeOutcome::Discarded { .. }
                | ConsumeOutcome::Redelivered { .. } => Self::Ack,
            },
            Err(err) if err.is_transient() || matches!(err, DispatchError::Cancelled) => {
                Self::Requeue
            }
            Err(_) => Self::DeadLetter,
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{CorrelationId, Message};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    impl Message for Order {
        const MESSAGE_TYPE: &'static str = "test.order";
    }

    #[test]
    fn dispositions_follow_outcome() {
        let ok = |outcome| Ok(ConsumeResponse::new(outcome));
        assert_eq!(Disposition::for_result(&ok(ConsumeOutcome::Handled)), Disposition::Ack);
        assert_eq!(
            Disposition::for_result(&ok(ConsumeOutcome::Discarded {
                reason: "x".to_string()
            })),
            Disposition::Ack
        );
        assert_eq!(
            Disposition::for_result(&ok(ConsumeOutcome::Redelivered { attempt: 1 })),
            Disposition::Ack
        );
        assert_eq!(
            Disposition::for_result(&ok(ConsumeOutcome::Faulted {
                reason: "x".to_string()
            })),
            Disposition::DeadLetter
        );
        assert_eq!(
            Disposition::for_result(&Err(DispatchError::Overloaded)),
            Disposition::Requeue
        );
        assert_eq!(
            Disposition::for_result(&Err(DispatchError::Cancelled)),
            Disposition::Requeue
        );
        assert_eq!(
            Disposition::for_result(&Err(DispatchError::NoInstanceFound {
                saga: "s".to_string(),
                message_type: "m".to_string(),
            })),
            Disposition::DeadLetter
        );
    }

    #[tokio::test]
    async fn faults_prefer_fault_address() {
        let transport = Arc::new(InMemoryTransport::new(8));
        let mut faults = transport.bind(EndpointAddress::new("faults"));
        let mut replies = transport.bind(EndpointAddress::new("replies"));
        let sink = TransportFaultSink::new(transport.clone());

        let correlation_id = CorrelationId::new();
        let delivery = DeliveryMetadata::new()
            .with_correlation_id(correlation_id)
            .as_request(EndpointAddress::new("replies"))
            .with_fault_address(EndpointAddress::new("faults"));
        let ctx = ConsumeContext::new(
            Envelope::encode(&Order { id: 4 }).unwrap(),
            delivery,
            courier_core::CancellationToken::new(),
        );

        sink.fault(&ctx, "no instance").await.unwrap();

        let delivered = faults.try_recv().unwrap();
        let fault: Fault = delivered.envelope.decode().unwrap();
        assert_eq!(fault.reason, "no instance");
        assert_eq!(fault.faulted_message_id, ctx.message_id());
        assert_eq!(delivered.delivery.correlation_id, Some(correlation_id));
        assert_eq!(delivered.delivery.request_id, Some(ctx.message_id()));
        assert!(replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn faults_fall_back_to_response_address() {
        let transport = Arc::new(InMemoryTransport::new(8));
        let mut replies = transport.bind(EndpointAddress::new("replies"));
        let sink = TransportFaultSink::new(transport.clone());

        let ctx = ConsumeContext::new(
            Envelope::encode(&Order { id: 4 }).unwrap(),
            DeliveryMetadata::new().as_request(EndpointAddress::new("replies")),
            courier_core::CancellationToken::new(),
        );
        sink.fault(&ctx, "boom").await.unwrap();

        let delivered = replies.try_recv().unwrap();
        assert_eq!(delivered.envelope.message_type(), Fault::MESSAGE_TYPE);
    }
}

//! Messages produced while consuming, addressed but not yet handed to a transport.

use crate::context::DeliveryMetadata;
use crate::message::Envelope;
use crate::types::EndpointAddress;

/// How an outbound message reaches its consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Point-to-point send to a single endpoint.
    Send(EndpointAddress),
    /// Fan-out to every endpoint subscribed to the message type.
    Publish,
}

/// A message waiting to be sent or published.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub route: Route,
    pub envelope: Envelope,
    pub delivery: DeliveryMetadata,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(route: Route, envelope: Envelope, delivery: DeliveryMetadata) -> Self {
        Self {
            route,
            envelope,
            delivery,
        }
    }

    #[must_use]
    pub fn message_type(&self) -> &str {
        self.envelope.message_type()
    }
}

//! Loopback transport: bounded per-address queues and publish fan-out.

use async_trait::async_trait;
use courier_core::{CancellationToken, ConsumeContext, DeliveryMetadata, EndpointAddress, Envelope};
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{SendTransport, TransportError};

/// A message waiting in an endpoint queue.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub envelope: Envelope,
    pub delivery: DeliveryMetadata,
}

impl InboundDelivery {
    #[must_use]
    pub fn into_context(self, cancellation: CancellationToken) -> ConsumeContext {
        ConsumeContext::new(self.envelope, self.delivery, cancellation)
    }
}

/// In-process transport.
///
/// Every bound address owns a bounded queue; `send` waits for queue space.
/// Published messages are copied to every address subscribed to their type.
pub struct InMemoryTransport {
    capacity: usize,
    queues: DashMap<EndpointAddress, mpsc::Sender<InboundDelivery>>,
    subscriptions: DashMap<String, Vec<EndpointAddress>>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Creates (or replaces) the queue at `address` and returns its receiver.
    pub fn bind(&self, address: EndpointAddress) -> mpsc::Receiver<InboundDelivery> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.queues.insert(address, tx);
        rx
    }

    pub fn unbind(&self, address: &EndpointAddress) {
        self.queues.remove(address);
    }

    /// Routes published messages of `message_type` to `address`.
    pub fn subscribe(&self, message_type: impl Into<String>, address: EndpointAddress) {
        let mut subscribers = self.subscriptions.entry(message_type.into()).or_default();
        if !subscribers.contains(&address) {
            subscribers.push(address);
        }
    }

    fn sender(&self, address: &EndpointAddress) -> Result<mpsc::Sender<InboundDelivery>, TransportError> {
        self.queues
            .get(address)
            .map(|tx| tx.clone())
            .ok_or_else(|| TransportError::NoRoute {
                address: address.clone(),
            })
    }
}

#[async_trait]
impl SendTransport for InMemoryTransport {
    async fn send(
        &self,
        destination: &EndpointAddress,
        envelope: Envelope,
        mut delivery: DeliveryMetadata,
    ) -> Result<(), TransportError> {
        let tx = self.sender(destination)?;
        delivery.destination_address = Some(destination.clone());
        tx.send(InboundDelivery { envelope, delivery })
            .await
            .map_err(|_| TransportError::Closed {
                address: destination.clone(),
            })
    }

    async fn publish(
        &self,
        envelope: Envelope,
        delivery: DeliveryMetadata,
    ) -> Result<(), TransportError> {
        let subscribers = self
            .subscriptions
            .get(envelope.message_type())
            .map(|s| s.clone())
            .unwrap_or_default();
        if subscribers.is_empty() {
            tracing::debug!(
                message_type = envelope.message_type(),
                "published message has no subscribers"
            );
        }
        for address in &subscribers {
            self.send(address, envelope.clone(), delivery.clone()).await?;
        }
        Ok(())
    }
}

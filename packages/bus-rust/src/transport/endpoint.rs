//! Receive loop feeding an endpoint queue through the dispatcher.

use std::sync::Arc;

use courier_core::{CancellationToken, EndpointAddress};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use super::{Disposition, InboundDelivery, SendTransport};
use crate::dispatch::TypeIndexedDispatcher;

/// Consumes one endpoint queue.
///
/// Each delivery runs on its own task, at most `max_concurrent` at a time,
/// with a cancellation token derived from the endpoint's. Dispatch results
/// are turned into a [`Disposition`]: requeued deliveries go back to the
/// endpoint address, dead-lettered ones to its error queue. A delivery gives
/// its permit back before it settles, so a requeue waiting for space in this
/// endpoint's own queue never stalls the receive loop.
pub struct ReceiveEndpoint {
    address: EndpointAddress,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveEndpoint {
    /// Starts receiving from `receiver`, which must be the queue bound at
    /// `address`.
    pub fn start(
        address: EndpointAddress,
        mut receiver: mpsc::Receiver<InboundDelivery>,
        dispatcher: Arc<TypeIndexedDispatcher>,
        transport: Arc<dyn SendTransport>,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let queue = address.clone();

        let handle = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(max_concurrent));
            loop {
                let delivery = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    delivery = receiver.recv() => match delivery {
                        Some(d) => d,
                        None => break,
                    },
                };
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };

                let ctx = delivery.clone().into_context(token.child_token());
                let dispatcher = dispatcher.clone();
                let transport = transport.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let result = dispatcher.dispatch(ctx).await;
                    drop(permit);
                    settle(&queue, delivery, Disposition::for_result(&result), transport.as_ref())
                        .await;
                });
            }

            // Keep the queue open until in-flight dispatches have finished.
            let Ok(total) = u32::try_from(max_concurrent) else {
                return;
            };
            let _drained = permits.acquire_many(total).await;
            tracing::debug!(address = %queue, "receive endpoint stopped");
        });

        tracing::info!(%address, max_concurrent, "receive endpoint started");
        Self {
            address,
            shutdown,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Stops receiving, cancels in-flight deliveries and waits for them to
    /// settle.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::error!(address = %self.address, error = %err, "receive loop panicked");
            }
        }
    }
}

impl Drop for ReceiveEndpoint {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn settle(
    queue: &EndpointAddress,
    delivery: InboundDelivery,
    disposition: Disposition,
    transport: &dyn SendTransport,
) {
    let message_id = delivery.delivery.message_id;
    let destination = match disposition {
        Disposition::Ack => return,
        Disposition::Requeue => queue.clone(),
        Disposition::DeadLetter => queue.error_queue(),
    };
    tracing::debug!(%message_id, ?disposition, %destination, "settling delivery");
    if let Err(err) = transport
        .send(&destination, delivery.envelope, delivery.delivery)
        .await
    {
        tracing::warn!(%message_id, ?disposition, error = %err, "failed to settle delivery");
    }
}

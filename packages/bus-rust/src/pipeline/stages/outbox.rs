//! Outbox stage: releases messages produced while consuming only after the
//! downstream chain succeeded.
//!
//! A failed attempt (e.g. an optimistic conflict that the retry stage will
//! re-run) drops its buffered messages, so a retried event never publishes twice.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::ConsumeContext;
use tower::util::BoxCloneService;
use tower::{Layer, Service};

use crate::error::{ChainBuildError, DispatchError};
use crate::pipeline::chain::{ConsumeResponse, ConsumeService, Stage};
use crate::transport::SendTransport;

// ---------------------------------------------------------------------------
// OutboxLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OutboxLayer {
    transport: Arc<dyn SendTransport>,
}

impl OutboxLayer {
    #[must_use]
    pub fn new(transport: Arc<dyn SendTransport>) -> Self {
        Self { transport }
    }
}

impl<S> Layer<S> for OutboxLayer {
    type Service = OutboxService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OutboxService {
            inner,
            transport: self.transport.clone(),
        }
    }
}

impl Stage for OutboxLayer {
    fn name(&self) -> &'static str {
        "outbox"
    }

    fn wrap(
        &self,
        _message_type: &str,
        inner: ConsumeService,
    ) -> Result<ConsumeService, ChainBuildError> {
        Ok(BoxCloneService::new(self.layer(inner)))
    }
}

// ---------------------------------------------------------------------------
// OutboxService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OutboxService<S> {
    inner: S,
    transport: Arc<dyn SendTransport>,
}

impl<S> Service<ConsumeContext> for OutboxService<S>
where
    S: Service<ConsumeContext, Response = ConsumeResponse, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = ConsumeResponse;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<ConsumeResponse, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, ctx: ConsumeContext) -> Self::Future {
        let transport = self.transport.clone();
        let fut = self.inner.call(ctx);
        Box::pin(async move {
            let mut resp = fut.await?;
            for message in resp.outbox.drain(..) {
                transport.dispatch_outbound(message).await?;
            }
            Ok(resp)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

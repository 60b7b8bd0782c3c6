//! Load shedding for dispatches.
//!
//! Rejects a dispatch with `DispatchError::Overloaded` when the endpoint already
//! runs `max_concurrent_dispatches` messages.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::ConsumeContext;
use tokio::sync::Semaphore;
use tower::util::BoxCloneService;
use tower::{Layer, Service};

use crate::error::{ChainBuildError, DispatchError};
use crate::pipeline::chain::{ConsumeResponse, ConsumeService, Stage};
use crate::probe::ProbeScope;

// ---------------------------------------------------------------------------
// ConcurrencyLimitLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent dispatches via a semaphore.
///
/// The semaphore is shared by every chain built from the same layer, so the
/// limit applies to the endpoint as a whole rather than per message type.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimitLayer {
    semaphore: Arc<Semaphore>,
    limit: u32,
}

impl ConcurrencyLimitLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
            limit: max_concurrent,
        }
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<S> Layer<S> for ConcurrencyLimitLayer {
    type Service = ConcurrencyLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConcurrencyLimitService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

impl Stage for ConcurrencyLimitLayer {
    fn name(&self) -> &'static str {
        "concurrency-limit"
    }

    fn wrap(
        &self,
        _message_type: &str,
        inner: ConsumeService,
    ) -> Result<ConsumeService, ChainBuildError> {
        Ok(BoxCloneService::new(self.layer(inner)))
    }

    fn probe(&self, scope: &mut ProbeScope) {
        scope.add("limit", self.limit);
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyLimitService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConcurrencyLimitService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<ConsumeContext> for ConcurrencyLimitService<S>
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
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            return Box::pin(async { Err(DispatchError::Overloaded) });
        };

        let fut = self.inner.call(ctx);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

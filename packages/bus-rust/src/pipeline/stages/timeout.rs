//! Timeout and cancellation for dispatches.
//!
//! Fails a dispatch with `DispatchError::Timeout` once it exceeds the configured
//! duration, or with `DispatchError::Cancelled` as soon as the delivery's
//! cancellation token fires.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::ConsumeContext;
use tower::util::BoxCloneService;
use tower::{Layer, Service};

use crate::error::{ChainBuildError, DispatchError};
use crate::pipeline::chain::{ConsumeResponse, ConsumeService, Stage};
use crate::probe::ProbeScope;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// `None` disables the timeout but keeps cancellation.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    timeout: Option<Duration>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

impl Stage for TimeoutLayer {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn wrap(
        &self,
        _message_type: &str,
        inner: ConsumeService,
    ) -> Result<ConsumeService, ChainBuildError> {
        Ok(BoxCloneService::new(self.layer(inner)))
    }

    fn probe(&self, scope: &mut ProbeScope) {
        let timeout_ms = self
            .timeout
            .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        scope.add("timeoutMs", timeout_ms);
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Option<Duration>,
}

impl<S> Service<ConsumeContext> for TimeoutService<S>
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
        let token = ctx.cancellation().clone();
        let timeout = self.timeout;
        let fut = self.inner.call(ctx);
        Box::pin(async move {
            let bounded = async move {
                match timeout {
                    Some(duration) => match tokio::time::timeout(duration, fut).await {
                        Ok(result) => result,
                        Err(_elapsed) => Err(DispatchError::Timeout {
                            timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                        }),
                    },
                    None => fut.await,
                }
            };
            tokio::select! {
                biased;
                () = token.cancelled() => Err(DispatchError::Cancelled),
                result = bounded => result,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Retry of transient dispatch failures.
//!
//! Re-runs the downstream chain when it fails with an error for which
//! [`DispatchError::is_transient`] holds (optimistic conflict, row lock timeout,
//! overload), backing off between attempts per [`RetryConfig`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use courier_core::ConsumeContext;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

use crate::config::RetryConfig;
use crate::error::{ChainBuildError, DispatchError};
use crate::pipeline::chain::{ConsumeResponse, ConsumeService, Stage};
use crate::probe::ProbeScope;

// ---------------------------------------------------------------------------
// RetryLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryLayer {
    config: RetryConfig,
}

impl RetryLayer {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            config: self.config.clone(),
        }
    }
}

impl Stage for RetryLayer {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn wrap(
        &self,
        _message_type: &str,
        inner: ConsumeService,
    ) -> Result<ConsumeService, ChainBuildError> {
        Ok(BoxCloneService::new(self.layer(inner)))
    }

    fn probe(&self, scope: &mut ProbeScope) {
        scope.add("limit", self.config.limit);
        scope.add("initialIntervalMs", self.config.initial_interval_ms);
        scope.add("maxIntervalMs", self.config.max_interval_ms);
    }
}

// ---------------------------------------------------------------------------
// RetryService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> Service<ConsumeContext> for RetryService<S>
where
    S: Service<ConsumeContext, Response = ConsumeResponse, Error = DispatchError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = ConsumeResponse;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<ConsumeResponse, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, ctx: ConsumeContext) -> Self::Future {
        // Take the service that was driven to readiness, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();

        Box::pin(async move {
            let mut retries = 0_u32;
            loop {
                let result = inner.ready().await?.call(ctx.clone()).await;
                let err = match result {
                    Err(err) if err.is_transient() && retries < config.limit => err,
                    other => return other,
                };

                retries += 1;
                let delay = config.backoff(retries);
                tracing::debug!(
                    message_type = ctx.message_type(),
                    message_id = %ctx.message_id(),
                    retry = retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying dispatch"
                );

                tokio::select! {
                    () = ctx.cancellation().cancelled() => return Err(DispatchError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

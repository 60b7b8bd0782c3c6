//! Observation stage: tracing span plus observer notifications per dispatch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use courier_core::ConsumeContext;
use tower::util::BoxCloneService;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::error::{ChainBuildError, DispatchError};
use crate::observer::BusObserver;
use crate::pipeline::chain::{ConsumeResponse, ConsumeService, Stage};

// ---------------------------------------------------------------------------
// ObserveLayer
// ---------------------------------------------------------------------------

/// Tower layer that reports every dispatch to a [`BusObserver`] and records
/// duration and outcome on a `consume` span.
#[derive(Clone)]
pub struct ObserveLayer {
    observer: Arc<dyn BusObserver>,
}

impl ObserveLayer {
    #[must_use]
    pub fn new(observer: Arc<dyn BusObserver>) -> Self {
        Self { observer }
    }
}

impl<S> Layer<S> for ObserveLayer {
    type Service = ObserveService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ObserveService {
            inner,
            observer: self.observer.clone(),
        }
    }
}

impl Stage for ObserveLayer {
    fn name(&self) -> &'static str {
        "observe"
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
// ObserveService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ObserveService<S> {
    inner: S,
    observer: Arc<dyn BusObserver>,
}

impl<S> Service<ConsumeContext> for ObserveService<S>
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
        let span = info_span!(
            "consume",
            message_type = ctx.message_type(),
            message_id = %ctx.message_id(),
            redelivery = ctx.redelivery_count(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let observer = self.observer.clone();
        let observed = ctx.clone();
        let fut = self.inner.call(ctx);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(resp) => {
                        observer.on_consumed(&observed, &resp.outcome, elapsed);
                        resp.outcome.label()
                    }
                    Err(err) => {
                        observer.on_consume_fault(&observed, err);
                        err.kind()
                    }
                };

                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Runtime notification sink for the dispatch pipeline.
//!
//! Defines [`BusObserver`] for reacting to consume, saga and redelivery events,
//! and [`CompositeObserver`] which fans out notifications to multiple observers.
//! Observers are receive-only: nothing they do feeds back into control flow.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{ConsumeContext, CorrelationId, MessageId};
use metrics::counter;
use parking_lot::Mutex;

use crate::error::DispatchError;
use crate::pipeline::ConsumeOutcome;

/// Observer for dispatch and saga lifecycle events.
///
/// Every method has a no-op default so implementations only override what
/// they care about. Used as `Arc<dyn BusObserver>`.
pub trait BusObserver: Send + Sync {
    /// Called after a message made it through its filter chain.
    fn on_consumed(&self, _ctx: &ConsumeContext, _outcome: &ConsumeOutcome, _elapsed: Duration) {}

    /// Called when a dispatch returned an error.
    fn on_consume_fault(&self, _ctx: &ConsumeContext, _error: &DispatchError) {}

    /// Called after a message was correlated to a saga instance and the
    /// mutation committed. `created` is true for a freshly inserted instance.
    fn on_saga_correlated(
        &self,
        _saga: &str,
        _ctx: &ConsumeContext,
        _correlation_id: CorrelationId,
        _created: bool,
    ) {
    }

    /// Called when a saga event produced a fault notification.
    fn on_saga_faulted(&self, _saga: &str, _ctx: &ConsumeContext, _reason: &str) {}

    /// Called when a message was dropped on purpose.
    fn on_discarded(&self, _saga: &str, _ctx: &ConsumeContext, _reason: &str) {}

    /// Called when a redelivery of the message was scheduled.
    fn on_redelivery_scheduled(&self, _ctx: &ConsumeContext, _attempt: u32, _delay: Duration) {}

    /// Called once when a message exhausted its redelivery schedule.
    fn on_redelivery_limit_reached(&self, _ctx: &ConsumeContext, _attempts: u32) {}

    /// Called once per message type when its filter chain is built.
    fn on_chain_built(&self, _message_type: &str, _stages: usize) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BusObserver for NoopObserver {}

// ---------------------------------------------------------------------------
// CompositeObserver
// ---------------------------------------------------------------------------

/// Composite observer that fans out to multiple observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn BusObserver>>,
}

impl CompositeObserver {
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn BusObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn BusObserver>) {
        self.observers.push(observer);
    }
}

impl BusObserver for CompositeObserver {
    fn on_consumed(&self, ctx: &ConsumeContext, outcome: &ConsumeOutcome, elapsed: Duration) {
        for observer in &self.observers {
            observer.on_consumed(ctx, outcome, elapsed);
        }
    }

    fn on_consume_fault(&self, ctx: &ConsumeContext, error: &DispatchError) {
        for observer in &self.observers {
            observer.on_consume_fault(ctx, error);
        }
    }

    fn on_saga_correlated(
        &self,
        saga: &str,
        ctx: &ConsumeContext,
        correlation_id: CorrelationId,
        created: bool,
    ) {
        for observer in &self.observers {
            observer.on_saga_correlated(saga, ctx, correlation_id, created);
        }
    }

    fn on_saga_faulted(&self, saga: &str, ctx: &ConsumeContext, reason: &str) {
        for observer in &self.observers {
            observer.on_saga_faulted(saga, ctx, reason);
        }
    }

    fn on_discarded(&self, saga: &str, ctx: &ConsumeContext, reason: &str) {
        for observer in &self.observers {
            observer.on_discarded(saga, ctx, reason);
        }
    }

    fn on_redelivery_scheduled(&self, ctx: &ConsumeContext, attempt: u32, delay: Duration) {
        for observer in &self.observers {
            observer.on_redelivery_scheduled(ctx, attempt, delay);
        }
    }

    fn on_redelivery_limit_reached(&self, ctx: &ConsumeContext, attempts: u32) {
        for observer in &self.observers {
            observer.on_redelivery_limit_reached(ctx, attempts);
        }
    }

    fn on_chain_built(&self, message_type: &str, stages: usize) {
        for observer in &self.observers {
            observer.on_chain_built(message_type, stages);
        }
    }
}

// ---------------------------------------------------------------------------
// TracingObserver
// ---------------------------------------------------------------------------

/// Logs every notification through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BusObserver for TracingObserver {
    fn on_consumed(&self, ctx: &ConsumeContext, outcome: &ConsumeOutcome, elapsed: Duration) {
        tracing::debug!(
            message_type = ctx.message_type(),
            message_id = %ctx.message_id(),
            outcome = outcome.label(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "message consumed"
        );
    }

    fn on_consume_fault(&self, ctx: &ConsumeContext, error: &DispatchError) {
        tracing::warn!(
            message_type = ctx.message_type(),
            message_id = %ctx.message_id(),
            error_kind = error.kind(),
            error = %error,
            "dispatch failed"
        );
    }

    fn on_saga_correlated(
        &self,
        saga: &str,
        ctx: &ConsumeContext,
        correlation_id: CorrelationId,
        created: bool,
    ) {
        tracing::info!(
            saga,
            message_type = ctx.message_type(),
            %correlation_id,
            created,
            "saga instance correlated"
        );
    }

    fn on_saga_faulted(&self, saga: &str, ctx: &ConsumeContext, reason: &str) {
        tracing::error!(
            saga,
            message_type = ctx.message_type(),
            message_id = %ctx.message_id(),
            reason,
            "saga event faulted"
        );
    }

    fn on_discarded(&self, saga: &str, ctx: &ConsumeContext, reason: &str) {
        tracing::info!(
            saga,
            message_type = ctx.message_type(),
            message_id = %ctx.message_id(),
            reason,
            "message discarded"
        );
    }

    fn on_redelivery_scheduled(&self, ctx: &ConsumeContext, attempt: u32, delay: Duration) {
        tracing::info!(
            message_type = ctx.message_type(),
            message_id = %ctx.message_id(),
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "redelivery scheduled"
        );
    }

    fn on_redelivery_limit_reached(&self, ctx: &ConsumeContext, attempts: u32) {
        tracing::warn!(
            message_type = ctx.message_type(),
            message_id = %ctx.message_id(),
            attempts,
            "redelivery limit reached"
        );
    }

    fn on_chain_built(&self, message_type: &str, stages: usize) {
        tracing::debug!(message_type, stages, "filter chain built");
    }
}

// ---------------------------------------------------------------------------
// MetricsObserver
// ---------------------------------------------------------------------------

/// Increments `metrics` counters. Installing a recorder is up to the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl BusObserver for MetricsObserver {
    fn on_consumed(&self, ctx: &ConsumeContext, outcome: &ConsumeOutcome, _elapsed: Duration) {
        counter!(
            "courier_messages_consumed_total",
            "message_type" => ctx.message_type().to_string(),
            "outcome" => outcome.label()
        )
        .increment(1);
    }

    fn on_consume_fault(&self, ctx: &ConsumeContext, error: &DispatchError) {
        counter!(
            "courier_messages_faulted_total",
            "message_type" => ctx.message_type().to_string(),
            "kind" => error.kind()
        )
        .increment(1);
    }

    fn on_saga_correlated(
        &self,
        saga: &str,
        _ctx: &ConsumeContext,
        _correlation_id: CorrelationId,
        created: bool,
    ) {
        counter!(
            "courier_saga_correlated_total",
            "saga" => saga.to_string(),
            "created" => if created { "true" } else { "false" }
        )
        .increment(1);
    }

    fn on_discarded(&self, saga: &str, ctx: &ConsumeContext, _reason: &str) {
        counter!(
            "courier_messages_discarded_total",
            "saga" => saga.to_string(),
            "message_type" => ctx.message_type().to_string()
        )
        .increment(1);
    }

    fn on_redelivery_scheduled(&self, ctx: &ConsumeContext, _attempt: u32, _delay: Duration) {
        counter!(
            "courier_redeliveries_scheduled_total",
            "message_type" => ctx.message_type().to_string()
        )
        .increment(1);
    }
}

// ---------------------------------------------------------------------------
// RecordingObserver
// ---------------------------------------------------------------------------

/// A notification captured by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Consumed {
        message_type: String,
        message_id: MessageId,
        outcome: &'static str,
    },
    ConsumeFault {
        message_type: String,
        kind: &'static str,
    },
    SagaCorrelated {
        saga: String,
        correlation_id: CorrelationId,
        created: bool,
    },
    SagaFaulted {
        saga: String,
        message_type: String,
        reason: String,
    },
    Discarded {
        saga: String,
        message_type: String,
        reason: String,
    },
    RedeliveryScheduled {
        message_id: MessageId,
        attempt: u32,
        delay: Duration,
    },
    RedeliveryLimitReached {
        message_id: MessageId,
        attempts: u32,
    },
    ChainBuilt {
        message_type: String,
    },
}

/// Keeps every notification in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&ObservedEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    fn record(&self, event: ObservedEvent) {
        self.events.lock().push(event);
    }
}

impl BusObserver for RecordingObserver {
    fn on_consumed(&self, ctx: &ConsumeContext, outcome: &ConsumeOutcome, _elapsed: Duration) {
        self.record(ObservedEvent::Consumed {
            message_type: ctx.message_type().to_string(),
            message_id: ctx.message_id(),
            outcome: outcome.label(),
        });
    }

    fn on_consume_fault(&self, ctx: &ConsumeContext, error: &DispatchError) {
        self.record(ObservedEvent::ConsumeFault {
            message_type: ctx.message_type().to_string(),
            kind: error.kind(),
        });
    }

    fn on_saga_correlated(
        &self,
        saga: &str,
        _ctx: &ConsumeContext,
        correlation_id: CorrelationId,
        created: bool,
    ) {
        self.record(ObservedEvent::SagaCorrelated {
            saga: saga.to_string(),
            correlation_id,
            created,
        });
    }

    fn on_saga_faulted(&self, saga: &str, ctx: &ConsumeContext, reason: &str) {
        self.record(ObservedEvent::SagaFaulted {
            saga: saga.to_string(),
            message_type: ctx.message_type().to_string(),
            reason: reason.to_string(),
        });
    }

    fn on_discarded(&self, saga: &str, ctx: &ConsumeContext, reason: &str) {
        self.record(ObservedEvent::Discarded {
            saga: saga.to_string(),
            message_type: ctx.message_type().to_string(),
            reason: reason.to_string(),
        });
    }

    fn on_redelivery_scheduled(&self, ctx: &ConsumeContext, attempt: u32, delay: Duration) {
        self.record(ObservedEvent::RedeliveryScheduled {
            message_id: ctx.message_id(),
            attempt,
            delay,
        });
    }

    fn on_redelivery_limit_reached(&self, ctx: &ConsumeContext, attempts: u32) {
        self.record(ObservedEvent::RedeliveryLimitReached {
            message_id: ctx.message_id(),
            attempts,
        });
    }

    fn on_chain_built(&self, message_type: &str, _stages: usize) {
        self.record(ObservedEvent::ChainBuilt {
            message_type: message_type.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl courier_core::Message for Ping {
        const MESSAGE_TYPE: &'static str = "test.ping";
    }

    #[test]
    fn composite_fans_out_to_all_observers() {
        let first = Arc::new(RecordingObserver::new());
        let second = Arc::new(RecordingObserver::new());
        let mut composite = CompositeObserver::new(vec![first.clone()]);
        composite.add(second.clone());

        let ctx = ConsumeContext::for_message(&Ping).unwrap();
        composite.on_discarded("status", &ctx, "no instance");
        composite.on_chain_built("test.ping", 3);

        for observer in [&first, &second] {
            assert_eq!(observer.events().len(), 2);
            assert_eq!(
                observer.count(|e| matches!(e, ObservedEvent::Discarded { .. })),
                1
            );
        }
    }

    #[test]
    fn tracing_and_metrics_observers_accept_every_event() {
        let ctx = ConsumeContext::for_message(&Ping).unwrap();
        let observers: Vec<Arc<dyn BusObserver>> =
            vec![Arc::new(TracingObserver), Arc::new(MetricsObserver), Arc::new(NoopObserver)];
        let composite = CompositeObserver::new(observers);

        composite.on_consumed(&ctx, &ConsumeOutcome::Handled, Duration::from_millis(2));
        composite.on_consume_fault(&ctx, &DispatchError::Overloaded);
        composite.on_saga_correlated("s", &ctx, CorrelationId::new(), true);
        composite.on_saga_faulted("s", &ctx, "boom");
        composite.on_redelivery_scheduled(&ctx, 1, Duration::from_secs(1));
        composite.on_redelivery_limit_reached(&ctx, 5);
    }
}

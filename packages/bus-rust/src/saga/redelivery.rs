//! Bounded, delayed redelivery of messages that found no saga instance.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{ConsumeContext, EndpointAddress, MessageId};
use dashmap::DashMap;
use parking_lot::Mutex;
use quick_cache::sync::Cache;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::observer::BusObserver;
use crate::transport::SendTransport;

// ---------------------------------------------------------------------------
// RedeliverySchedule
// ---------------------------------------------------------------------------

/// Ordered delay intervals plus a maximum attempt count.
///
/// Attempt `n` (1-based) waits `intervals[n - 1]`, clamped to the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliverySchedule {
    intervals: Vec<Duration>,
    limit: u32,
}

impl RedeliverySchedule {
    /// `limit` attempts, each after the same `delay`.
    #[must_use]
    pub fn interval(limit: u32, delay: Duration) -> Self {
        Self {
            intervals: vec![delay],
            limit,
        }
    }

    /// One attempt per listed delay.
    #[must_use]
    pub fn intervals(intervals: Vec<Duration>) -> Self {
        let limit = u32::try_from(intervals.len()).unwrap_or(u32::MAX);
        Self { intervals, limit }
    }

    /// `initial`, `initial + step`, `initial + 2 * step`, ...
    #[must_use]
    pub fn incremental(limit: u32, initial: Duration, step: Duration) -> Self {
        let intervals = (0..limit)
            .map(|i| initial.saturating_add(step.saturating_mul(i)))
            .collect();
        Self { intervals, limit }
    }

    /// `min * factor^i`, capped at `max`.
    #[must_use]
    pub fn exponential(limit: u32, min: Duration, max: Duration, factor: u32) -> Self {
        let mut intervals = Vec::with_capacity(limit as usize);
        let mut delay = min;
        for _ in 0..limit {
            intervals.push(delay.min(max));
            delay = delay.saturating_mul(factor.max(1));
        }
        Self { intervals, limit }
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Delay before attempt `attempt`, or `None` once the limit is passed.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.limit {
            return None;
        }
        let index = (attempt as usize - 1).min(self.intervals.len().saturating_sub(1));
        Some(self.intervals.get(index).copied().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// RedeliveryScheduler
// ---------------------------------------------------------------------------

/// A scheduled, not yet fired redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryAttempt {
    pub message_id: MessageId,
    pub attempt: u32,
    pub delay: Duration,
    pub due: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled(RedeliveryAttempt),
    /// The schedule is used up; the caller runs its limit-reached policy.
    LimitReached { attempts: u32 },
    /// The limit for this message id already fired once.
    AlreadyExhausted,
}

struct PendingRedelivery {
    saga: String,
    attempt: u32,
    ctx: ConsumeContext,
    wake: Arc<Notify>,
}

/// Re-sends messages to an endpoint after a delay.
///
/// Each redelivered copy keeps the original message id and carries the
/// attempt number in its redelivery count. A timer stops without sending when
/// the message's cancellation token fires; [`expedite_where`](Self::expedite_where)
/// makes pending timers fire immediately.
pub struct RedeliveryScheduler {
    transport: Arc<dyn SendTransport>,
    observer: Arc<dyn BusObserver>,
    address: EndpointAddress,
    pending: Arc<DashMap<MessageId, PendingRedelivery>>,
    exhausted: Cache<MessageId, ()>,
    /// Serializes the check-then-insert on `exhausted`.
    exhausting: Mutex<()>,
}

impl RedeliveryScheduler {
    /// Creates a scheduler re-sending to `address`. `exhausted_capacity`
    /// bounds how many exhausted message ids are remembered.
    #[must_use]
    pub fn new(
        transport: Arc<dyn SendTransport>,
        observer: Arc<dyn BusObserver>,
        address: EndpointAddress,
        exhausted_capacity: usize,
    ) -> Self {
        Self {
            transport,
            observer,
            address,
            pending: Arc::new(DashMap::new()),
            exhausted: Cache::new(exhausted_capacity.max(1)),
            exhausting: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Schedules the next redelivery of `ctx`'s message for `saga`.
    pub fn schedule(
        &self,
        saga: &str,
        ctx: &ConsumeContext,
        schedule: &RedeliverySchedule,
    ) -> ScheduleOutcome {
        let message_id = ctx.message_id();
        if self.exhausted.get(&message_id).is_some() {
            return ScheduleOutcome::AlreadyExhausted;
        }

        let attempt = ctx.redelivery_count().saturating_add(1);
        let Some(delay) = schedule.delay_for(attempt) else {
            if !self.mark_exhausted(message_id) {
                return ScheduleOutcome::AlreadyExhausted;
            }
            let attempts = ctx.redelivery_count();
            self.observer.on_redelivery_limit_reached(ctx, attempts);
            return ScheduleOutcome::LimitReached { attempts };
        };

        let due = Instant::now() + delay;
        let wake = Arc::new(Notify::new());
        self.pending.insert(
            message_id,
            PendingRedelivery {
                saga: saga.to_string(),
                attempt,
                ctx: ctx.clone(),
                wake: wake.clone(),
            },
        );
        self.observer.on_redelivery_scheduled(ctx, attempt, delay);

        let pending = self.pending.clone();
        let transport = self.transport.clone();
        let outbound = ctx.redelivery(self.address.clone(), attempt);
        let cancellation = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => {
                    pending.remove_if(&message_id, |_, p| p.attempt == attempt);
                    tracing::debug!(%message_id, attempt, "redelivery cancelled");
                    return;
                }
                () = tokio::time::sleep_until(due) => {}
                () = wake.notified() => {
                    tracing::debug!(%message_id, attempt, "redelivery expedited");
                }
            }
            pending.remove_if(&message_id, |_, p| p.attempt == attempt);
            if let Err(err) = transport.dispatch_outbound(outbound).await {
                tracing::warn!(%message_id, attempt, error = %err, "redelivery send failed");
            }
        });

        ScheduleOutcome::Scheduled(RedeliveryAttempt {
            message_id,
            attempt,
            delay,
            due,
        })
    }

    /// Records `message_id` as exhausted. Returns `false` if another caller
    /// already did.
    fn mark_exhausted(&self, message_id: MessageId) -> bool {
        let _guard = self.exhausting.lock();
        if self.exhausted.get(&message_id).is_some() {
            return false;
        }
        self.exhausted.insert(message_id, ());
        true
    }

    /// Fires every pending redelivery of `saga` whose message satisfies
    /// `predicate` right away. Returns how many were woken.
    pub fn expedite_where(&self, saga: &str, predicate: impl Fn(&ConsumeContext) -> bool) -> usize {
        let mut woken = 0;
        for entry in self.pending.iter() {
            if entry.saga == saga && predicate(&entry.ctx) {
                entry.wake.notify_one();
                woken += 1;
            }
        }
        woken
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, message_id: MessageId) -> bool {
        self.pending.contains_key(&message_id)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{DeliveryMetadata, Message};
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::observer::{NoopObserver, ObservedEvent, RecordingObserver};
    use crate::transport::{InMemoryTransport, InboundDelivery};

    #[derive(Debug, Serialize, Deserialize)]
    struct CheckStatus {
        service_name: String,
    }

    impl Message for CheckStatus {
        const MESSAGE_TYPE: &'static str = "test.check-status";
    }

    fn check() -> ConsumeContext {
        ConsumeContext::for_message(&CheckStatus {
            service_name: "A".to_string(),
        })
        .unwrap()
    }

    fn scheduler(
        observer: Arc<dyn BusObserver>,
    ) -> (RedeliveryScheduler, tokio::sync::mpsc::Receiver<InboundDelivery>) {
        let transport = Arc::new(InMemoryTransport::new(16));
        let rx = transport.bind(EndpointAddress::new("input"));
        (
            RedeliveryScheduler::new(transport, observer, EndpointAddress::new("input"), 16),
            rx,
        )
    }

    #[test]
    fn interval_schedule_repeats_delay() {
        let schedule = RedeliverySchedule::interval(5, Duration::from_secs(1));
        assert_eq!(schedule.delay_for(0), None);
        assert_eq!(schedule.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(schedule.delay_for(5), Some(Duration::from_secs(1)));
        assert_eq!(schedule.delay_for(6), None);
    }

    #[test]
    fn explicit_intervals_set_the_limit() {
        let schedule = RedeliverySchedule::intervals(vec![
            Duration::from_millis(10),
            Duration::from_millis(50),
        ]);
        assert_eq!(schedule.limit(), 2);
        assert_eq!(schedule.delay_for(2), Some(Duration::from_millis(50)));
        assert_eq!(schedule.delay_for(3), None);
    }

    #[test]
    fn exponential_schedule_caps_at_max() {
        let schedule = RedeliverySchedule::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_millis(500),
            2,
        );
        let delays: Vec<_> = (1..=5).filter_map(|a| schedule.delay_for(a)).collect();
        assert_eq!(
            delays,
            vec![100, 200, 400, 500, 500]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn incremental_delays_never_decrease(limit in 1u32..20, initial in 0u64..1000, step in 0u64..1000) {
            let schedule = RedeliverySchedule::incremental(
                limit,
                Duration::from_millis(initial),
                Duration::from_millis(step),
            );
            let delays: Vec<_> = (1..=limit).map(|a| schedule.delay_for(a)).collect();
            prop_assert!(delays.iter().all(Option::is_some));
            prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
            prop_assert_eq!(schedule.delay_for(limit + 1), None);
        }

        #[test]
        fn attempts_clamp_to_last_interval(count in 1usize..6, extra in 0u32..10) {
            let intervals: Vec<_> = (1..=count as u64).map(Duration::from_millis).collect();
            let last = *intervals.last().unwrap();
            let schedule = RedeliverySchedule {
                intervals,
                limit: u32::try_from(count).unwrap() + extra,
            };
            let attempt = u32::try_from(count).unwrap() + extra;
            prop_assert_eq!(schedule.delay_for(attempt), Some(last));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay_with_same_identity() {
        let (scheduler, mut rx) = scheduler(Arc::new(NoopObserver));
        let ctx = check();
        let outcome = scheduler.schedule(
            "monitor",
            &ctx,
            &RedeliverySchedule::interval(5, Duration::from_secs(1)),
        );
        let ScheduleOutcome::Scheduled(attempt) = outcome else {
            panic!("expected a scheduled attempt, got {outcome:?}");
        };
        assert_eq!(attempt.attempt, 1);
        assert!(scheduler.is_pending(ctx.message_id()));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(rx.try_recv().is_err());

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.delivery.message_id, ctx.message_id());
        assert_eq!(delivered.delivery.redelivery_count, 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_context_never_fires() {
        let (scheduler, mut rx) = scheduler(Arc::new(NoopObserver));
        let ctx = check();
        scheduler.schedule(
            "monitor",
            &ctx,
            &RedeliverySchedule::interval(5, Duration::from_secs(1)),
        );

        ctx.cancellation().cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_fires_once_per_message() {
        let recorder = Arc::new(RecordingObserver::new());
        let (scheduler, _rx) = scheduler(recorder.clone());
        let schedule = RedeliverySchedule::interval(5, Duration::from_secs(1));
        let delivery = DeliveryMetadata {
            redelivery_count: 5,
            ..check().delivery().clone()
        };
        let ctx = check().with_delivery(delivery);

        assert_eq!(
            scheduler.schedule("monitor", &ctx, &schedule),
            ScheduleOutcome::LimitReached { attempts: 5 }
        );
        assert_eq!(
            scheduler.schedule("monitor", &ctx, &schedule),
            ScheduleOutcome::AlreadyExhausted
        );
        assert_eq!(
            recorder.count(|e| matches!(e, ObservedEvent::RedeliveryLimitReached { attempts: 5, .. })),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_at_the_limit_fire_once() {
        let recorder = Arc::new(RecordingObserver::new());
        let (scheduler, _rx) = scheduler(recorder.clone());
        let scheduler = Arc::new(scheduler);
        let schedule = RedeliverySchedule::interval(5, Duration::from_secs(1));
        let delivery = DeliveryMetadata {
            redelivery_count: 5,
            ..check().delivery().clone()
        };
        let ctx = check().with_delivery(delivery);
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let copies: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = scheduler.clone();
                let schedule = schedule.clone();
                let ctx = ctx.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    scheduler.schedule("monitor", &ctx, &schedule)
                })
            })
            .collect();

        let mut limit_reached = 0;
        for copy in copies {
            match copy.await.unwrap() {
                ScheduleOutcome::LimitReached { attempts: 5 } => limit_reached += 1,
                ScheduleOutcome::AlreadyExhausted => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(limit_reached, 1);
        assert_eq!(
            recorder.count(|e| matches!(e, ObservedEvent::RedeliveryLimitReached { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expedite_fires_matching_pending_redeliveries() {
        let (scheduler, mut rx) = scheduler(Arc::new(NoopObserver));
        let ctx = check();
        let start = Instant::now();
        scheduler.schedule(
            "monitor",
            &ctx,
            &RedeliverySchedule::interval(5, Duration::from_secs(10)),
        );

        assert_eq!(scheduler.expedite_where("other-saga", |_| true), 0);
        assert_eq!(scheduler.expedite_where("monitor", |_| false), 0);
        assert_eq!(scheduler.expedite_where("monitor", |c| c.message_id() == ctx.message_id()), 1);

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.delivery.message_id, ctx.message_id());
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}

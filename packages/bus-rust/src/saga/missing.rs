//! What happens to an event whose correlation found no instance.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{ConsumeContext, Message, OutboundMessage};

use super::redelivery::{RedeliveryScheduler, RedeliverySchedule, ScheduleOutcome};
use crate::error::DispatchError;
use crate::observer::BusObserver;
use crate::pipeline::{ConsumeOutcome, ConsumeResponse};
use crate::transport::FaultSink;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Side-effecting handler run by [`MissingInstancePolicy::Execute`].
///
/// Returned messages go through the outbox like any other consumer output.
#[async_trait]
pub trait MissingInstanceHandler: Send + Sync {
    async fn handle(&self, ctx: &ConsumeContext) -> anyhow::Result<Vec<OutboundMessage>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MissingInstanceHandler for FnHandler<F>
where
    F: Fn(ConsumeContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<OutboundMessage>>> + Send,
{
    async fn handle(&self, ctx: &ConsumeContext) -> anyhow::Result<Vec<OutboundMessage>> {
        (self.0)(ctx.clone()).await
    }
}

/// Responds to the unmatched message `M` with the `R` built by `build`.
struct RespondWith<M, R, F> {
    build: F,
    _types: PhantomData<fn(M) -> R>,
}

#[async_trait]
impl<M, R, F> MissingInstanceHandler for RespondWith<M, R, F>
where
    M: Message,
    R: Message,
    F: Fn(&M) -> R + Send + Sync,
{
    async fn handle(&self, ctx: &ConsumeContext) -> anyhow::Result<Vec<OutboundMessage>> {
        let message = ctx.message::<M>()?;
        Ok(vec![ctx.respond(&(self.build)(&message))?])
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Terminal policy run once a redelivery schedule is used up.
#[derive(Clone)]
pub enum LimitReachedPolicy {
    Fault,
    Discard,
    Execute(Arc<dyn MissingInstanceHandler>),
}

impl LimitReachedPolicy {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fault => "fault",
            Self::Discard => "discard",
            Self::Execute(_) => "execute",
        }
    }
}

impl fmt::Debug for LimitReachedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Strategy for an event whose correlation found nothing. Exactly one variant
/// runs per unmatched message.
#[derive(Clone)]
pub enum MissingInstancePolicy {
    /// Send a fault notification; create nothing.
    Fault,
    /// Drop the message, telling observers.
    Discard,
    /// Run a handler against the original message.
    Execute(Arc<dyn MissingInstanceHandler>),
    /// Redeliver later; run `on_limit` once the schedule is used up.
    Redeliver {
        schedule: RedeliverySchedule,
        on_limit: LimitReachedPolicy,
    },
}

impl MissingInstancePolicy {
    /// Executes `handler` with a clone of the consume context.
    pub fn execute<F, Fut>(handler: F) -> Self
    where
        F: Fn(ConsumeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<OutboundMessage>>> + Send + 'static,
    {
        Self::Execute(Arc::new(FnHandler(handler)))
    }

    /// Responds to the unmatched `M` with the message `build` returns.
    pub fn respond_with<M, R, F>(build: F) -> Self
    where
        M: Message,
        R: Message,
        F: Fn(&M) -> R + Send + Sync + 'static,
    {
        Self::Execute(Arc::new(RespondWith {
            build,
            _types: PhantomData,
        }))
    }

    #[must_use]
    pub fn redeliver(schedule: RedeliverySchedule, on_limit: LimitReachedPolicy) -> Self {
        Self::Redeliver { schedule, on_limit }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fault => "fault",
            Self::Discard => "discard",
            Self::Execute(_) => "execute",
            Self::Redeliver { .. } => "redeliver",
        }
    }

    /// Runs the policy for `ctx`.
    pub(crate) async fn apply(
        &self,
        env: &MissingInstanceEnv<'_>,
        ctx: &ConsumeContext,
    ) -> Result<ConsumeResponse, DispatchError> {
        match self {
            Self::Fault => env.fault(ctx, &env.not_found_reason(ctx)).await,
            Self::Discard => Ok(env.discard(ctx, &env.not_found_reason(ctx))),
            Self::Execute(handler) => execute(handler.as_ref(), ctx).await,
            Self::Redeliver { schedule, on_limit } => {
                match env.scheduler.schedule(env.saga, ctx, schedule) {
                    ScheduleOutcome::Scheduled(attempt) => Ok(ConsumeResponse::new(
                        ConsumeOutcome::Redelivered {
                            attempt: attempt.attempt,
                        },
                    )),
                    ScheduleOutcome::LimitReached { attempts } => {
                        let reason = format!(
                            "no saga instance found for {} after {attempts} redeliveries",
                            ctx.message_type()
                        );
                        match on_limit {
                            LimitReachedPolicy::Fault => env.fault(ctx, &reason).await,
                            LimitReachedPolicy::Discard => Ok(env.discard(ctx, &reason)),
                            LimitReachedPolicy::Execute(handler) => {
                                execute(handler.as_ref(), ctx).await
                            }
                        }
                    }
                    ScheduleOutcome::AlreadyExhausted => {
                        Ok(env.discard(ctx, "redelivery limit already reached"))
                    }
                }
            }
        }
    }
}

impl fmt::Debug for MissingInstancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redeliver { schedule, on_limit } => f
                .debug_struct("Redeliver")
                .field("schedule", schedule)
                .field("on_limit", on_limit)
                .finish(),
            other => f.write_str(other.label()),
        }
    }
}

async fn execute(
    handler: &dyn MissingInstanceHandler,
    ctx: &ConsumeContext,
) -> Result<ConsumeResponse, DispatchError> {
    let outbox = handler.handle(ctx).await?;
    Ok(ConsumeResponse::with_outbox(ConsumeOutcome::Handled, outbox))
}

/// Collaborators a policy runs against.
pub(crate) struct MissingInstanceEnv<'a> {
    pub saga: &'a str,
    pub scheduler: &'a RedeliveryScheduler,
    pub fault_sink: &'a dyn FaultSink,
    pub observer: &'a dyn BusObserver,
}

impl MissingInstanceEnv<'_> {
    fn not_found_reason(&self, ctx: &ConsumeContext) -> String {
        format!("saga {}: no instance found for {}", self.saga, ctx.message_type())
    }

    /// Sends a fault and tells observers.
    pub(crate) async fn fault(
        &self,
        ctx: &ConsumeContext,
        reason: &str,
    ) -> Result<ConsumeResponse, DispatchError> {
        self.fault_sink.fault(ctx, reason).await?;
        self.observer.on_saga_faulted(self.saga, ctx, reason);
        Ok(ConsumeResponse::new(ConsumeOutcome::Faulted {
            reason: reason.to_string(),
        }))
    }

    fn discard(&self, ctx: &ConsumeContext, reason: &str) -> ConsumeResponse {
        self.observer.on_discarded(self.saga, ctx, reason);
        ConsumeResponse::new(ConsumeOutcome::Discarded {
            reason: reason.to_string(),
        })
    }
}

//! The saga consumer: correlation, missing-instance handling and persisted
//! state-machine transitions behind one chain consumer.

use std::sync::Arc;

use courier_core::{ConsumeContext, CorrelationId, EndpointAddress, OutboundMessage};
use tokio::sync::oneshot;
use tower::service_fn;
use tower::util::BoxCloneService;

use super::correlation::{Correlation, CorrelationResolver};
use super::instance::{SagaData, SagaInstance};
use super::missing::MissingInstanceEnv;
use super::redelivery::RedeliveryScheduler;
use super::repository::{ConcurrencyControlledRepository, ExecuteOutcome};
use super::state_machine::{Applied, StateMachine};
use super::store::VersionToken;
use crate::config::BusConfig;
use crate::error::{ChainBuildError, DispatchError};
use crate::observer::BusObserver;
use crate::pipeline::{ConsumeOutcome, ConsumeResponse, ConsumeService, Consumer};
use crate::probe::ProbeScope;
use crate::transport::{FaultSink, SendTransport, TransportFaultSink};

/// Shared collaborators of the saga consumers on one endpoint.
#[derive(Clone)]
pub struct SagaServices {
    /// Flushes the output of transitions whose dispatch was abandoned after
    /// they committed.
    pub transport: Arc<dyn SendTransport>,
    pub scheduler: Arc<RedeliveryScheduler>,
    pub fault_sink: Arc<dyn FaultSink>,
    pub observer: Arc<dyn BusObserver>,
    pub idempotency_window: usize,
}

impl SagaServices {
    /// Scheduler re-sending to the configured endpoint and a fault sink on
    /// the same transport.
    #[must_use]
    pub fn from_config(
        config: &BusConfig,
        transport: Arc<dyn SendTransport>,
        observer: Arc<dyn BusObserver>,
    ) -> Self {
        let scheduler = RedeliveryScheduler::new(
            transport.clone(),
            observer.clone(),
            EndpointAddress::new(&config.endpoint),
            config.exhausted_redelivery_capacity,
        );
        Self {
            scheduler: Arc::new(scheduler),
            fault_sink: Arc::new(TransportFaultSink::new(transport.clone())),
            transport,
            observer,
            idempotency_window: config.idempotency_window,
        }
    }
}

/// Consumer running every event of one state machine.
pub struct SagaConsumer<D> {
    inner: Arc<SagaInner<D>>,
}

struct SagaInner<D> {
    machine: StateMachine<D>,
    repository: Arc<dyn ConcurrencyControlledRepository<D>>,
    services: SagaServices,
}

impl<D: SagaData> SagaConsumer<D> {
    #[must_use]
    pub fn new(
        machine: StateMachine<D>,
        repository: Arc<dyn ConcurrencyControlledRepository<D>>,
        services: SagaServices,
    ) -> Self {
        Self {
            inner: Arc::new(SagaInner {
                machine,
                repository,
                services,
            }),
        }
    }

    #[must_use]
    pub fn machine(&self) -> &StateMachine<D> {
        &self.inner.machine
    }
}

impl<D: SagaData> Consumer for SagaConsumer<D> {
    fn name(&self) -> &str {
        self.inner.machine.name()
    }

    fn message_types(&self) -> Vec<String> {
        self.inner.machine.message_types()
    }

    fn service(&self, message_type: &str) -> Result<ConsumeService, ChainBuildError> {
        let Some(event) = self.inner.machine.event_for(message_type) else {
            return Err(ChainBuildError::NoConsumer {
                message_type: message_type.to_string(),
            });
        };
        let inner = self.inner.clone();
        Ok(BoxCloneService::new(service_fn(move |ctx: ConsumeContext| {
            let inner = inner.clone();
            async move { inner.consume_detached(event, ctx).await }
        })))
    }

    fn probe(&self, scope: &mut ProbeScope) {
        scope.add("kind", "saga");
        scope.add("discipline", self.inner.repository.discipline().as_str());
        self.inner.machine.probe(scope);
    }
}

impl<D: SagaData> SagaInner<D> {
    /// Runs [`consume`](Self::consume) on its own task.
    ///
    /// A store transaction that started always runs to completion. If the
    /// caller stops waiting (dispatch timeout or cancellation), the outbox of
    /// a committed transition is flushed by the task, or by [`Handoff`] when
    /// the response arrived but was never read.
    async fn consume_detached(
        self: Arc<Self>,
        event: usize,
        ctx: ConsumeContext,
    ) -> Result<ConsumeResponse, DispatchError> {
        let (tx, rx) = oneshot::channel();
        let transport = self.services.transport.clone();
        let message_id = ctx.message_id();
        let worker = self.clone();
        tokio::spawn(async move {
            let result = worker.consume(event, ctx).await;
            if let Err(Ok(abandoned)) = tx.send(result) {
                flush_abandoned(worker.services.transport.as_ref(), abandoned.outbox).await;
            }
        });

        let mut handoff = Handoff { rx, transport };
        match (&mut handoff.rx).await {
            Ok(result) => result,
            Err(_closed) => Err(DispatchError::Handler(anyhow::anyhow!(
                "saga {} stopped consuming {message_id} without a result",
                self.machine.name()
            ))),
        }
    }

    fn env(&self) -> MissingInstanceEnv<'_> {
        MissingInstanceEnv {
            saga: self.machine.name(),
            scheduler: &self.services.scheduler,
            fault_sink: self.services.fault_sink.as_ref(),
            observer: self.services.observer.as_ref(),
        }
    }

    async fn consume(&self, event: usize, ctx: ConsumeContext) -> Result<ConsumeResponse, DispatchError> {
        let Some(definition) = self.machine.event(event) else {
            return Err(ChainBuildError::NoConsumer {
                message_type: ctx.message_type().to_string(),
            }
            .into());
        };

        let correlation =
            CorrelationResolver::resolve(definition.correlation(), &ctx, self.repository.store())
                .await?;
        match correlation {
            Correlation::Found(loaded) => {
                self.update(event, loaded.instance.correlation_id(), loaded.version, &ctx)
                    .await
            }
            Correlation::NotFound { candidate_id } => {
                if self.machine.accepts_initial(event) {
                    // Without a selected key every copy gets a fresh id, so
                    // concurrent initial events can each create an instance.
                    let id = candidate_id.unwrap_or_default();
                    return self.create(event, id, &ctx).await;
                }
                if let Some(policy) = definition.missing_instance() {
                    return policy.apply(&self.env(), &ctx).await;
                }
                let err = DispatchError::NoInstanceFound {
                    saga: self.machine.name().to_string(),
                    message_type: ctx.message_type().to_string(),
                };
                self.env().fault(&ctx, &err.to_string()).await?;
                Err(err)
            }
            Correlation::Ambiguous { matches } => {
                let err = DispatchError::AmbiguousCorrelation {
                    saga: self.machine.name().to_string(),
                    message_type: ctx.message_type().to_string(),
                    matches,
                };
                self.env().fault(&ctx, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn update(
        &self,
        event: usize,
        correlation_id: CorrelationId,
        version: VersionToken,
        ctx: &ConsumeContext,
    ) -> Result<ConsumeResponse, DispatchError> {
        let window = self.services.idempotency_window;
        let mut outbox = Vec::new();
        let mut applied = None;
        let outcome = self
            .repository
            .execute(
                correlation_id,
                Box::new(|mut instance: SagaInstance<D>| -> Result<SagaInstance<D>, DispatchError> {
                    applied = Some(self.machine.apply(event, &mut instance, ctx, &mut outbox, window)?);
                    Ok(instance)
                }),
            )
            .await?;

        match outcome {
            ExecuteOutcome::Committed(loaded) => {
                self.committed(ctx, &loaded.instance, false);
                Ok(ConsumeResponse::with_outbox(
                    consumed(correlation_id, applied.as_ref()),
                    outbox,
                ))
            }
            ExecuteOutcome::Conflict {
                correlation_id,
                expected,
            } => Err(DispatchError::Conflict {
                correlation_id,
                expected,
            }),
            // Vanished between correlation and load; a retry re-correlates.
            ExecuteOutcome::NotFound => Err(DispatchError::Conflict {
                correlation_id,
                expected: version,
            }),
        }
    }

    async fn create(
        &self,
        event: usize,
        correlation_id: CorrelationId,
        ctx: &ConsumeContext,
    ) -> Result<ConsumeResponse, DispatchError> {
        let window = self.services.idempotency_window;
        let mut outbox = Vec::new();
        let mut applied = None;
        let outcome = self
            .repository
            .execute_new(
                SagaInstance::new(correlation_id),
                Box::new(|mut instance: SagaInstance<D>| -> Result<SagaInstance<D>, DispatchError> {
                    applied = Some(self.machine.apply(event, &mut instance, ctx, &mut outbox, window)?);
                    Ok(instance)
                }),
            )
            .await?;

        match outcome {
            ExecuteOutcome::Committed(loaded) => {
                self.committed(ctx, &loaded.instance, true);
                Ok(ConsumeResponse::with_outbox(
                    consumed(correlation_id, applied.as_ref()),
                    outbox,
                ))
            }
            ExecuteOutcome::Conflict { .. } | ExecuteOutcome::NotFound => {
                Err(DispatchError::Conflict {
                    correlation_id,
                    expected: VersionToken::ABSENT,
                })
            }
        }
    }

    /// Notifies observers and fires pending redeliveries that now correlate
    /// to `instance`, so they are answered without waiting out their delay.
    fn committed(&self, ctx: &ConsumeContext, instance: &SagaInstance<D>, created: bool) {
        let saga = self.machine.name();
        self.services
            .observer
            .on_saga_correlated(saga, ctx, instance.correlation_id(), created);

        let woken = self.services.scheduler.expedite_where(saga, |pending| {
            self.machine
                .event_for(pending.message_type())
                .and_then(|index| self.machine.event(index))
                .is_some_and(|event| event.correlation().matches(pending, instance))
        });
        if woken > 0 {
            tracing::debug!(
                saga,
                correlation_id = %instance.correlation_id(),
                woken,
                "expedited pending redeliveries"
            );
        }
    }
}

/// Receiving end of a detached consume. Dropped before the response was
/// read, it flushes the response's outbox in the background.
struct Handoff {
    rx: oneshot::Receiver<Result<ConsumeResponse, DispatchError>>,
    transport: Arc<dyn SendTransport>,
}

impl Drop for Handoff {
    fn drop(&mut self) {
        let Ok(Ok(abandoned)) = self.rx.try_recv() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                dropped = abandoned.outbox.len(),
                "no runtime to flush abandoned saga output"
            );
            return;
        };
        let transport = self.transport.clone();
        runtime.spawn(async move { flush_abandoned(transport.as_ref(), abandoned.outbox).await });
    }
}

async fn flush_abandoned(transport: &dyn SendTransport, outbox: Vec<OutboundMessage>) {
    if outbox.is_empty() {
        return;
    }
    tracing::debug!(messages = outbox.len(), "flushing output of an abandoned dispatch");
    for message in outbox {
        if let Err(err) = transport.dispatch_outbound(message).await {
            tracing::warn!(error = %err, "failed to flush saga output");
        }
    }
}

fn consumed(correlation_id: CorrelationId, applied: Option<&Applied>) -> ConsumeOutcome {
    ConsumeOutcome::Consumed {
        correlation_id,
        duplicate: matches!(applied, Some(Applied::Duplicate)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{DeliveryMetadata, Envelope, Fault, Message};
    use serde::{Deserialize, Serialize};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::observer::{ObservedEvent, RecordingObserver};
    use crate::saga::instance::State;
    use crate::saga::memory_store::InMemorySagaStore;
    use crate::saga::repository::OptimisticRepository;
    use crate::saga::state_machine::{Behavior, Event};
    use crate::saga::store::SagaStore;
    use crate::transport::{InMemoryTransport, InboundDelivery};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Monitor {
        service_name: String,
        checks: u32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Start {
        service_name: String,
    }

    impl Message for Start {
        const MESSAGE_TYPE: &'static str = "test.start";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct CheckStatus {
        service_name: String,
    }

    impl Message for CheckStatus {
        const MESSAGE_TYPE: &'static str = "test.check-status";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Status {
        service_name: String,
        checks: u32,
    }

    impl Message for Status {
        const MESSAGE_TYPE: &'static str = "test.status";
    }

    const RUNNING: State = State::new("Running");

    struct Harness {
        consumer: SagaConsumer<Monitor>,
        store: Arc<InMemorySagaStore<Monitor>>,
        recorder: Arc<RecordingObserver>,
        client: mpsc::Receiver<InboundDelivery>,
    }

    fn harness() -> Harness {
        harness_with(monitor_machine())
    }

    fn monitor_machine() -> StateMachine<Monitor> {
        StateMachine::builder("monitor")
            .state(RUNNING)
            .event(
                Event::<Monitor, Start>::new("Start")
                    .correlate_by(|i: &SagaInstance<Monitor>, m: &Start| {
                        i.data.service_name == m.service_name
                    }),
            )
            .event(
                Event::<Monitor, CheckStatus>::new("CheckStatus").correlate_by(
                    |i: &SagaInstance<Monitor>, m: &CheckStatus| {
                        i.data.service_name == m.service_name
                    },
                ),
            )
            .initially(
                "Start",
                Behavior::<Monitor>::new()
                    .then(|ctx| {
                        let start = ctx.message::<Start>()?;
                        ctx.data_mut().service_name = start.service_name;
                        Ok(())
                    })
                    .transition_to(RUNNING),
            )
            .during(
                RUNNING,
                "CheckStatus",
                Behavior::<Monitor>::new()
                    .then(|ctx| {
                        ctx.data_mut().checks += 1;
                        Ok(())
                    })
                    .respond(|ctx| {
                        Ok(Status {
                            service_name: ctx.data().service_name.clone(),
                            checks: ctx.data().checks,
                        })
                    }),
            )
            .build()
            .unwrap()
    }

    fn harness_with(machine: StateMachine<Monitor>) -> Harness {
        let transport = Arc::new(InMemoryTransport::new(16));
        let client = transport.bind(EndpointAddress::new("client"));
        let recorder = Arc::new(RecordingObserver::new());
        let store = Arc::new(InMemorySagaStore::new());
        let services = SagaServices::from_config(&BusConfig::default(), transport, recorder.clone());
        let repository = Arc::new(OptimisticRepository::new(
            store.clone() as Arc<dyn SagaStore<Monitor>>
        ));
        Harness {
            consumer: SagaConsumer::new(machine, repository, services),
            store,
            recorder,
            client,
        }
    }

    fn request<M: Message>(message: &M) -> ConsumeContext {
        ConsumeContext::new(
            Envelope::encode(message).unwrap(),
            DeliveryMetadata::new().as_request(EndpointAddress::new("client")),
            CancellationToken::new(),
        )
    }

    async fn dispatch(h: &Harness, ctx: ConsumeContext) -> Result<ConsumeResponse, DispatchError> {
        h.consumer
            .service(ctx.message_type())
            .unwrap()
            .oneshot(ctx)
            .await
    }

    fn start(name: &str) -> ConsumeContext {
        request(&Start {
            service_name: name.to_string(),
        })
    }

    fn check(name: &str) -> ConsumeContext {
        request(&CheckStatus {
            service_name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn initial_event_creates_instance() {
        let h = harness();
        let resp = dispatch(&h, start("A")).await.unwrap();
        assert!(matches!(
            resp.outcome,
            ConsumeOutcome::Consumed {
                duplicate: false,
                ..
            }
        ));

        let rows = h.store.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instance.current_state(), &RUNNING);
        assert_eq!(rows[0].instance.data.service_name, "A");
        assert_eq!(
            h.recorder.count(|e| matches!(e, ObservedEvent::SagaCorrelated { created: true, .. })),
            1
        );
    }

    #[tokio::test]
    async fn correlated_event_mutates_and_responds() {
        let h = harness();
        dispatch(&h, start("A")).await.unwrap();

        let resp = dispatch(&h, check("A")).await.unwrap();
        assert_eq!(resp.outbox.len(), 1);
        let status: Status = resp.outbox[0].envelope.decode().unwrap();
        assert_eq!(status.checks, 1);

        let rows = h.store.rows().unwrap();
        assert_eq!(rows[0].instance.data.checks, 1);
        assert_eq!(rows[0].version, VersionToken::from_value(2));
    }

    #[tokio::test]
    async fn replayed_message_is_a_duplicate_without_output() {
        let h = harness();
        dispatch(&h, start("A")).await.unwrap();
        let ctx = check("A");

        dispatch(&h, ctx.clone()).await.unwrap();
        let replay = dispatch(&h, ctx).await.unwrap();

        assert!(matches!(
            replay.outcome,
            ConsumeOutcome::Consumed {
                duplicate: true,
                ..
            }
        ));
        assert!(replay.outbox.is_empty());
        assert_eq!(h.store.rows().unwrap()[0].instance.data.checks, 1);
    }

    #[tokio::test]
    async fn missing_instance_without_policy_faults() {
        let mut h = harness();
        let err = dispatch(&h, check("A")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoInstanceFound { .. }));

        let fault: Fault = h.client.try_recv().unwrap().envelope.decode().unwrap();
        assert_eq!(fault.faulted_message_type, CheckStatus::MESSAGE_TYPE);
        assert!(h.client.try_recv().is_err());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn ambiguous_correlation_is_never_silently_resolved() {
        let mut h = harness();
        for _ in 0..2 {
            let mut instance = SagaInstance::<Monitor>::new(CorrelationId::new());
            instance.data.service_name = "A".to_string();
            h.store.insert(&instance).await.unwrap();
        }

        let err = dispatch(&h, check("A")).await.unwrap_err();
        assert!(matches!(err, DispatchError::AmbiguousCorrelation { matches: 2, .. }));
        assert!(h.client.try_recv().is_ok());
        assert_eq!(
            h.recorder.count(|e| matches!(e, ObservedEvent::SagaFaulted { .. })),
            1
        );
    }

    #[tokio::test]
    async fn unknown_message_type_has_no_service() {
        let h = harness();
        assert!(matches!(
            h.consumer.service(Status::MESSAGE_TYPE),
            Err(ChainBuildError::NoConsumer { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn commit_expedites_correlating_redeliveries() {
        let h = harness();
        let scheduler = h.consumer.inner.services.scheduler.clone();
        let pending = check("A");
        scheduler.schedule(
            "monitor",
            &pending,
            &crate::saga::redelivery::RedeliverySchedule::interval(5, Duration::from_secs(60)),
        );
        let unrelated = check("B");
        scheduler.schedule(
            "monitor",
            &unrelated,
            &crate::saga::redelivery::RedeliverySchedule::interval(5, Duration::from_secs(60)),
        );
        assert_eq!(scheduler.pending_count(), 2);

        dispatch(&h, start("A")).await.unwrap();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert!(!scheduler.is_pending(pending.message_id()));
        assert!(scheduler.is_pending(unrelated.message_id()));
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct KeyedStart {
        service_name: String,
        monitor_id: CorrelationId,
    }

    impl Message for KeyedStart {
        const MESSAGE_TYPE: &'static str = "test.keyed-start";
    }

    #[tokio::test]
    async fn selected_id_keys_instances_created_by_predicate_events() {
        let machine = StateMachine::builder("keyed")
            .state(RUNNING)
            .event(
                Event::<Monitor, KeyedStart>::new("Start")
                    .correlate_by(|i: &SagaInstance<Monitor>, m: &KeyedStart| {
                        i.data.service_name == m.service_name
                    })
                    .correlate_by_id(|m: &KeyedStart| m.monitor_id),
            )
            .initially(
                "Start",
                Behavior::<Monitor>::new()
                    .then(|ctx| {
                        let start = ctx.message::<KeyedStart>()?;
                        ctx.data_mut().service_name = start.service_name;
                        Ok(())
                    })
                    .transition_to(RUNNING),
            )
            .build()
            .unwrap();
        let h = harness_with(machine);
        let monitor_id = CorrelationId::new();
        let keyed = || {
            request(&KeyedStart {
                service_name: "A".to_string(),
                monitor_id,
            })
        };

        dispatch(&h, keyed()).await.unwrap();
        let rows = h.store.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instance.correlation_id(), monitor_id);

        // A racing copy that also saw no instance loses the insert.
        let event = h.consumer.machine().event_for(KeyedStart::MESSAGE_TYPE).unwrap();
        let err = h
            .consumer
            .inner
            .create(event, monitor_id, &keyed())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Conflict { .. }));
        assert_eq!(h.store.len(), 1);
    }

    #[test]
    fn probe_describes_machine_and_discipline() {
        let h = harness();
        let mut scope = ProbeScope::new("consumer");
        h.consumer.probe(&mut scope);
        assert_eq!(scope.entry("kind").unwrap(), "saga");
        assert_eq!(scope.entry("discipline").unwrap(), "optimistic");
        assert_eq!(scope.entry("saga").unwrap(), "monitor");
    }
}

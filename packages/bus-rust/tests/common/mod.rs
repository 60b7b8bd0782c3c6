//! Shared wiring for the end-to-end saga tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use courier_bus::observer::RecordingObserver;
use courier_bus::saga::{
    Behavior, ConcurrencyControlledRepository, Event, InMemorySagaStore, MissingInstancePolicy,
    OptimisticRepository, SagaConsumer, SagaInstance, SagaServices, SagaStore, State,
    StateMachine,
};
use courier_bus::transport::InboundDelivery;
use courier_bus::{
    BusConfig, EndpointSpecification, InMemoryTransport, ReceiveEndpoint, SendTransport,
    TypeIndexedDispatcher,
};
use courier_core::{DeliveryMetadata, EndpointAddress, Envelope, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub service_name: String,
    pub checks: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Start {
    pub service_name: String,
}

impl Message for Start {
    const MESSAGE_TYPE: &'static str = "monitor.start";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckStatus {
    pub service_name: String,
}

impl Message for CheckStatus {
    const MESSAGE_TYPE: &'static str = "monitor.check-status";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub service_name: String,
    pub checks: u32,
}

impl Message for Status {
    const MESSAGE_TYPE: &'static str = "monitor.status";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceNotFound {
    pub service_name: String,
}

impl Message for InstanceNotFound {
    const MESSAGE_TYPE: &'static str = "monitor.instance-not-found";
}

pub const RUNNING: State = State::new("Running");

/// `Start` creates a monitor; `CheckStatus` counts a check and responds
/// with a `Status`. Both correlate on the service name.
pub fn monitor_machine(on_missing: MissingInstancePolicy) -> StateMachine<Monitor> {
    StateMachine::builder("monitor")
        .state(RUNNING)
        .event(Event::<Monitor, Start>::new("Start").correlate_by(
            |i: &SagaInstance<Monitor>, m: &Start| i.data.service_name == m.service_name,
        ))
        .event(
            Event::<Monitor, CheckStatus>::new("CheckStatus")
                .correlate_by(|i: &SagaInstance<Monitor>, m: &CheckStatus| {
                    i.data.service_name == m.service_name
                })
                .on_missing_instance(on_missing),
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
        .expect("valid machine")
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// One running endpoint hosting the monitor saga, plus a client queue.
pub struct TestBus {
    pub transport: Arc<InMemoryTransport>,
    pub store: Arc<InMemorySagaStore<Monitor>>,
    pub recorder: Arc<RecordingObserver>,
    pub client: mpsc::Receiver<InboundDelivery>,
    pub errors: mpsc::Receiver<InboundDelivery>,
    endpoint: ReceiveEndpoint,
}

impl TestBus {
    pub fn start(config: BusConfig, on_missing: MissingInstancePolicy) -> Self {
        Self::start_with(config, on_missing, |store| {
            Arc::new(OptimisticRepository::new(store))
        })
    }

    pub fn start_with(
        config: BusConfig,
        on_missing: MissingInstancePolicy,
        repository: impl FnOnce(
            Arc<dyn SagaStore<Monitor>>,
        ) -> Arc<dyn ConcurrencyControlledRepository<Monitor>>,
    ) -> Self {
        init_tracing();
        let transport = Arc::new(InMemoryTransport::new(config.queue_capacity));
        let address = EndpointAddress::new(&config.endpoint);
        let input = transport.bind(address.clone());
        let client = transport.bind(EndpointAddress::new("client"));
        let errors = transport.bind(address.error_queue());

        let recorder = Arc::new(RecordingObserver::new());
        let store = Arc::new(InMemorySagaStore::new());
        let services = SagaServices::from_config(&config, transport.clone(), recorder.clone());
        let saga = SagaConsumer::new(
            monitor_machine(on_missing),
            repository(store.clone() as Arc<dyn SagaStore<Monitor>>),
            services,
        );

        let mut spec = EndpointSpecification::new(&config, transport.clone(), recorder.clone());
        spec.add_consumer(Arc::new(saga)).expect("single consumer");
        let dispatcher = Arc::new(TypeIndexedDispatcher::new(Arc::new(spec), recorder.clone()));
        let endpoint = ReceiveEndpoint::start(
            address,
            input,
            dispatcher,
            transport.clone(),
            config.max_concurrent_dispatches as usize,
        );

        Self {
            transport,
            store,
            recorder,
            client,
            errors,
            endpoint,
        }
    }

    /// Sends `message` to the endpoint as a request answered to `client`.
    pub async fn request<M: Message>(&self, message: &M) -> DeliveryMetadata {
        let delivery = DeliveryMetadata::new().as_request(EndpointAddress::new("client"));
        self.send_with(message, delivery.clone()).await;
        delivery
    }

    pub async fn send_with<M: Message>(&self, message: &M, delivery: DeliveryMetadata) {
        self.transport
            .send(
                self.endpoint.address(),
                Envelope::encode(message).expect("encodable"),
                delivery,
            )
            .await
            .expect("endpoint bound");
    }

    /// Next message on the client queue.
    pub async fn reply(&mut self) -> InboundDelivery {
        tokio::time::timeout(Duration::from_secs(60), self.client.recv())
            .await
            .expect("reply within a minute")
            .expect("client queue open")
    }

    pub async fn stop(mut self) {
        self.endpoint.stop().await;
    }
}

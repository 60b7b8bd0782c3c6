//! Courier bus: type-indexed dispatch through filter chains, saga correlation,
//! missing-instance policies, scheduled redelivery and concurrency-controlled
//! saga persistence.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod observer;
pub mod pipeline;
pub mod probe;
pub mod saga;
pub mod transport;

pub use config::{BusConfig, RetryConfig};
pub use dispatch::{MessageTypeId, MessageTypeRegistry, TypeIndexedDispatcher};
pub use error::{ChainBuildError, DispatchError};
pub use observer::{BusObserver, CompositeObserver, MetricsObserver, NoopObserver, TracingObserver};
pub use pipeline::{
    ConsumeOutcome, ConsumeResponse, Consumer, EndpointSpecification, FilterChain, HandlerConsumer,
    PipeSpecification, Stage,
};
pub use probe::ProbeScope;
pub use transport::{
    Disposition, FaultSink, InMemoryTransport, ReceiveEndpoint, SendTransport, TransportError,
    TransportFaultSink,
};

//! Sagas: long-lived, persisted state machines driven by messages.
//!
//! - [`instance`]: `SagaInstance`, `State` and the `SagaData` bound
//! - [`store`]: the `SagaStore` contract, version tokens and row layout
//! - [`memory_store`]: in-process `SagaStore` with per-row locks
//! - [`repository`]: optimistic and pessimistic load-mutate-save
//! - [`correlation`]: finding the instance a message belongs to
//! - [`missing`]: what to do when no instance matches
//! - [`redelivery`]: delayed re-sends of not-yet-correlatable messages
//! - [`state_machine`]: states, events and the transition table
//! - [`stage`]: the consumer tying all of the above into a filter chain

pub mod correlation;
pub mod instance;
pub mod memory_store;
pub mod missing;
pub mod redelivery;
pub mod repository;
pub mod stage;
pub mod state_machine;
pub mod store;

pub use correlation::{Correlation, CorrelationResolver, CorrelationStrategy};
pub use instance::{SagaData, SagaInstance, State};
pub use memory_store::InMemorySagaStore;
pub use missing::{LimitReachedPolicy, MissingInstanceHandler, MissingInstancePolicy};
pub use redelivery::{RedeliveryAttempt, RedeliverySchedule, RedeliveryScheduler, ScheduleOutcome};
pub use repository::{
    ConcurrencyControlledRepository, Discipline, ExecuteOutcome, OptimisticRepository,
    PessimisticRepository,
};
pub use stage::{SagaConsumer, SagaServices};
pub use state_machine::{
    Applied, Behavior, BehaviorContext, DefinitionError, Event, EventDefinition, StateMachine,
    StateMachineBuilder, UnhandledEventPolicy,
};
pub use store::{FindOne, Loaded, RowLock, SagaRow, SagaStore, SaveOutcome, StoreError, VersionToken};

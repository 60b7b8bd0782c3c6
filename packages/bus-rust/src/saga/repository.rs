//! Concurrency-controlled persistence of saga instance mutations.
//!
//! Two disciplines sit behind [`ConcurrencyControlledRepository`]:
//!
//! - [`OptimisticRepository`] loads an instance with its [`VersionToken`],
//!   applies the mutation and writes back conditionally. A lost race comes
//!   back as [`ExecuteOutcome::Conflict`]; retrying is the caller's decision.
//! - [`PessimisticRepository`] takes the row lock before loading and holds it
//!   until the write finished, serializing mutations of one instance.
//!
//! In both, a failing mutation writes nothing and releases whatever it held.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::CorrelationId;

use super::instance::{SagaData, SagaInstance};
use super::store::{Loaded, RowLock, SagaStore, SaveOutcome, StoreError, VersionToken};
use crate::error::DispatchError;

/// Mutation applied to a loaded (or freshly seeded) instance.
pub type Mutate<'m, D> =
    Box<dyn FnOnce(SagaInstance<D>) -> Result<SagaInstance<D>, DispatchError> + Send + 'm>;

/// Result of one load-mutate-persist cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome<D> {
    /// The mutation was persisted; carries the committed snapshot.
    Committed(Loaded<D>),
    /// The stored row changed since it was read (or, for a new instance,
    /// already exists). Nothing was written.
    Conflict {
        correlation_id: CorrelationId,
        expected: VersionToken,
    },
    NotFound,
}

/// Which concurrency discipline a repository implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Optimistic,
    Pessimistic,
}

impl Discipline {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Optimistic => "optimistic",
            Self::Pessimistic => "pessimistic",
        }
    }
}

/// The only path through which saga instances are mutated.
#[async_trait]
pub trait ConcurrencyControlledRepository<D: SagaData>: Send + Sync {
    fn discipline(&self) -> Discipline;

    /// Read access for correlation lookups.
    fn store(&self) -> &dyn SagaStore<D>;

    /// Loads `correlation_id`, applies `mutate` and persists the result.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `mutate`, [`DispatchError::LockUnavailable`]
    /// when a row lock could not be taken in time, or [`DispatchError::Store`]
    /// for backend failures.
    async fn execute<'m>(
        &self,
        correlation_id: CorrelationId,
        mutate: Mutate<'m, D>,
    ) -> Result<ExecuteOutcome<D>, DispatchError>;

    /// Applies `mutate` to `seed` and inserts it as a new instance. An instance
    /// with the same id that already exists is reported as a conflict.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    async fn execute_new<'m>(
        &self,
        seed: SagaInstance<D>,
        mutate: Mutate<'m, D>,
    ) -> Result<ExecuteOutcome<D>, DispatchError>;
}

fn conflict<D>(correlation_id: CorrelationId, expected: VersionToken) -> ExecuteOutcome<D> {
    ExecuteOutcome::Conflict {
        correlation_id,
        expected,
    }
}

async fn insert_new<D: SagaData>(
    store: &dyn SagaStore<D>,
    seed: SagaInstance<D>,
    mutate: Mutate<'_, D>,
) -> Result<ExecuteOutcome<D>, DispatchError> {
    let correlation_id = seed.correlation_id();
    let instance = mutate(seed)?;
    match store.insert(&instance).await {
        Ok(version) => Ok(ExecuteOutcome::Committed(Loaded { instance, version })),
        Err(StoreError::DuplicateKey { .. }) => Ok(conflict(correlation_id, VersionToken::ABSENT)),
        Err(err) => Err(err.into()),
    }
}

async fn save_loaded<D: SagaData>(
    store: &dyn SagaStore<D>,
    loaded: Loaded<D>,
    mutate: Mutate<'_, D>,
) -> Result<ExecuteOutcome<D>, DispatchError> {
    let correlation_id = loaded.instance.correlation_id();
    let expected = loaded.version;
    let instance = mutate(loaded.instance)?;
    match store.save(&instance, expected).await? {
        SaveOutcome::Committed(version) => Ok(ExecuteOutcome::Committed(Loaded { instance, version })),
        SaveOutcome::Conflict { actual, .. } => {
            tracing::debug!(
                %correlation_id,
                %expected,
                actual = ?actual,
                "saga save lost an optimistic race"
            );
            Ok(conflict(correlation_id, expected))
        }
    }
}

// ---------------------------------------------------------------------------
// OptimisticRepository
// ---------------------------------------------------------------------------

/// Compare-and-swap on the version token; no lock held between load and write.
pub struct OptimisticRepository<D> {
    store: Arc<dyn SagaStore<D>>,
}

impl<D: SagaData> OptimisticRepository<D> {
    #[must_use]
    pub fn new(store: Arc<dyn SagaStore<D>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<D: SagaData> ConcurrencyControlledRepository<D> for OptimisticRepository<D> {
    fn discipline(&self) -> Discipline {
        Discipline::Optimistic
    }

    fn store(&self) -> &dyn SagaStore<D> {
        self.store.as_ref()
    }

    async fn execute<'m>(
        &self,
        correlation_id: CorrelationId,
        mutate: Mutate<'m, D>,
    ) -> Result<ExecuteOutcome<D>, DispatchError> {
        let Some(loaded) = self.store.load(correlation_id).await? else {
            return Ok(ExecuteOutcome::NotFound);
        };
        save_loaded(self.store.as_ref(), loaded, mutate).await
    }

    async fn execute_new<'m>(
        &self,
        seed: SagaInstance<D>,
        mutate: Mutate<'m, D>,
    ) -> Result<ExecuteOutcome<D>, DispatchError> {
        insert_new(self.store.as_ref(), seed, mutate).await
    }
}

// ---------------------------------------------------------------------------
// PessimisticRepository
// ---------------------------------------------------------------------------

/// Exclusive row lock held for the whole load-mutate-write transaction.
pub struct PessimisticRepository<D> {
    store: Arc<dyn SagaStore<D>>,
    lock_timeout: Duration,
}

impl<D: SagaData> PessimisticRepository<D> {
    #[must_use]
    pub fn new(store: Arc<dyn SagaStore<D>>, lock_timeout: Duration) -> Self {
        Self {
            store,
            lock_timeout,
        }
    }

    async fn lock(&self, correlation_id: CorrelationId) -> Result<RowLock, DispatchError> {
        self.store
            .acquire_row_lock(correlation_id, self.lock_timeout)
            .await
            .map_err(|err| match err {
                StoreError::LockTimeout {
                    correlation_id,
                    timeout_ms,
                } => DispatchError::LockUnavailable {
                    correlation_id,
                    timeout_ms,
                },
                other => other.into(),
            })
    }
}

#[async_trait]
impl<D: SagaData> ConcurrencyControlledRepository<D> for PessimisticRepository<D> {
    fn discipline(&self) -> Discipline {
        Discipline::Pessimistic
    }

    fn store(&self) -> &dyn SagaStore<D> {
        self.store.as_ref()
    }

    async fn execute<'m>(
        &self,
        correlation_id: CorrelationId,
        mutate: Mutate<'m, D>,
    ) -> Result<ExecuteOutcome<D>, DispatchError> {
        let _lock = self.lock(correlation_id).await?;
        let Some(loaded) = self.store.load(correlation_id).await? else {
            return Ok(ExecuteOutcome::NotFound);
        };
        save_loaded(self.store.as_ref(), loaded, mutate).await
    }

    async fn execute_new<'m>(
        &self,
        seed: SagaInstance<D>,
        mutate: Mutate<'m, D>,
    ) -> Result<ExecuteOutcome<D>, DispatchError> {
        let _lock = self.lock(seed.correlation_id()).await?;
        insert_new(self.store.as_ref(), seed, mutate).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Saga store contract and the persisted row layout.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{CorrelationId, MessageId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::instance::{SagaData, SagaInstance, State};

// ---------------------------------------------------------------------------
// VersionToken
// ---------------------------------------------------------------------------

/// Opaque version of a stored instance, bumped by every committed save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(u64);

impl VersionToken {
    /// Expected version when inserting a row that must not exist yet.
    pub const ABSENT: Self = Self(0);
    /// Version of a freshly inserted row.
    pub const INITIAL: Self = Self(1);

    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Store results
// ---------------------------------------------------------------------------

/// An instance snapshot together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<D> {
    pub instance: SagaInstance<D>,
    pub version: VersionToken,
}

/// Result of a predicate lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum FindOne<D> {
    Found(Loaded<D>),
    NotFound,
    /// More than one instance satisfied the predicate.
    Ambiguous { matches: usize },
}

/// Result of a conditional save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Committed(VersionToken),
    /// The stored version differs from `expected`. `actual` is `None` when
    /// the row no longer exists.
    Conflict {
        expected: VersionToken,
        actual: Option<VersionToken>,
    },
}

/// Exclusive, scoped hold on the row backing one instance.
///
/// The lock is released when this value is dropped, whatever the outcome of
/// the transaction it guarded.
pub struct RowLock {
    correlation_id: CorrelationId,
    _guard: Box<dyn Any + Send + Sync>,
}

impl RowLock {
    #[must_use]
    pub fn new(correlation_id: CorrelationId, guard: impl Any + Send + Sync) -> Self {
        Self {
            correlation_id,
            _guard: Box::new(guard),
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

impl fmt::Debug for RowLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowLock")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("saga instance {correlation_id} already exists")]
    DuplicateKey { correlation_id: CorrelationId },
    #[error("row lock for {correlation_id} not acquired within {timeout_ms}ms")]
    LockTimeout {
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },
    #[error("failed to encode saga row: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode saga row: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("saga store backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// SagaStore trait
// ---------------------------------------------------------------------------

/// Predicate evaluated against stored instances.
pub type InstancePredicate<D> = dyn Fn(&SagaInstance<D>) -> bool + Send + Sync;

/// Storage collaborator for saga instances.
///
/// All mutation goes through [`ConcurrencyControlledRepository`](super::repository::ConcurrencyControlledRepository);
/// `insert` and `save` are its primitives, not an API for handlers.
#[async_trait]
pub trait SagaStore<D: SagaData>: Send + Sync {
    /// Loads the instance with `correlation_id`.
    async fn load(&self, correlation_id: CorrelationId) -> Result<Option<Loaded<D>>, StoreError>;

    /// Finds the single instance satisfying `predicate`.
    async fn try_find_one(&self, predicate: &InstancePredicate<D>) -> Result<FindOne<D>, StoreError>;

    /// Inserts a new row at [`VersionToken::INITIAL`].
    ///
    /// Fails with [`StoreError::DuplicateKey`] if the row already exists.
    async fn insert(&self, instance: &SagaInstance<D>) -> Result<VersionToken, StoreError>;

    /// Overwrites the row if its stored version still equals `expected`.
    async fn save(
        &self,
        instance: &SagaInstance<D>,
        expected: VersionToken,
    ) -> Result<SaveOutcome, StoreError>;

    /// Acquires the exclusive row lock for `correlation_id`, waiting at most
    /// `timeout`. The row does not need to exist.
    async fn acquire_row_lock(
        &self,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<RowLock, StoreError>;
}

// ---------------------------------------------------------------------------
// SagaRow
// ---------------------------------------------------------------------------

/// Durable representation of an instance for byte-oriented backends.
///
/// Encoded as named `MsgPack`; `correlation_id`, `current_state` and
/// `version` stay addressable by name for backends that index them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRow<D> {
    pub correlation_id: CorrelationId,
    pub current_state: State,
    pub version: VersionToken,
    pub data: D,
    pub applied: Vec<MessageId>,
}

impl<D: SagaData> SagaRow<D> {
    #[must_use]
    pub fn new(instance: &SagaInstance<D>, version: VersionToken) -> Self {
        Self {
            correlation_id: instance.correlation_id(),
            current_state: instance.current_state().clone(),
            version,
            data: instance.data.clone(),
            applied: instance.applied_message_ids().copied().collect(),
        }
    }

    #[must_use]
    pub fn into_loaded(self) -> Loaded<D> {
        let mut instance = SagaInstance::with_data(self.correlation_id, self.data);
        instance.set_current_state(self.current_state);
        for id in self.applied {
            instance.record_applied(id, usize::MAX);
        }
        Loaded {
            instance,
            version: self.version,
        }
    }
}

impl<D: SagaData + Serialize + DeserializeOwned> SagaRow<D> {
    /// # Errors
    ///
    /// Returns [`StoreError::Encode`] if the data cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Decode`] if `bytes` is not a valid row.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

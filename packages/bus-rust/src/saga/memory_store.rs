//! In-memory [`SagaStore`] implementation backed by [`DashMap`].
//!
//! Rows are kept as encoded [`SagaRow`] bytes so the store behaves like a
//! byte-oriented backend: every load hands out an independent snapshot.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::CorrelationId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::instance::{SagaData, SagaInstance};
use super::store::{
    FindOne, InstancePredicate, Loaded, RowLock, SagaRow, SagaStore, SaveOutcome, StoreError,
    VersionToken,
};

struct StoredRow {
    version: VersionToken,
    bytes: Vec<u8>,
}

type RowMutexes = DashMap<CorrelationId, Arc<tokio::sync::Mutex<()>>>;

/// Held row lock. Releases the mutex, then drops its map entry unless another
/// task is already waiting on it.
struct HeldRow {
    correlation_id: CorrelationId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    locks: Arc<RowMutexes>,
}

impl Drop for HeldRow {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_unused(&self.locks, self.correlation_id);
    }
}

fn release_unused(locks: &RowMutexes, correlation_id: CorrelationId) {
    locks.remove_if(&correlation_id, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// In-memory saga store.
///
/// Row locks are per-key `tokio::sync::Mutex`es, created on first use,
/// acquired with a timeout and forgotten once nobody holds or awaits them. Conditional saves compare versions under the
/// `DashMap` shard lock, so a save is atomic with respect to other saves.
pub struct InMemorySagaStore<D> {
    rows: DashMap<CorrelationId, StoredRow>,
    locks: Arc<RowMutexes>,
    _data: PhantomData<fn() -> D>,
}

impl<D> InMemorySagaStore<D> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            locks: Arc::new(DashMap::new()),
            _data: PhantomData,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.len()
    }
}

impl<D> Default for InMemorySagaStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: SagaData + Serialize + DeserializeOwned> InMemorySagaStore<D> {
    /// Decoded snapshot of every row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Decode`] if a stored row is corrupt.
    pub fn rows(&self) -> Result<Vec<Loaded<D>>, StoreError> {
        self.rows
            .iter()
            .map(|row| SagaRow::<D>::from_bytes(&row.bytes).map(SagaRow::into_loaded))
            .collect()
    }

    fn decode(row: &StoredRow) -> Result<Loaded<D>, StoreError> {
        let mut loaded = SagaRow::<D>::from_bytes(&row.bytes)?.into_loaded();
        loaded.version = row.version;
        Ok(loaded)
    }
}

#[async_trait]
impl<D: SagaData + Serialize + DeserializeOwned> SagaStore<D> for InMemorySagaStore<D> {
    async fn load(&self, correlation_id: CorrelationId) -> Result<Option<Loaded<D>>, StoreError> {
        self.rows
            .get(&correlation_id)
            .map(|row| Self::decode(&row))
            .transpose()
    }

    async fn try_find_one(&self, predicate: &InstancePredicate<D>) -> Result<FindOne<D>, StoreError> {
        let mut found = None;
        let mut matches = 0_usize;
        for row in &self.rows {
            let loaded = Self::decode(row.value())?;
            if predicate(&loaded.instance) {
                matches += 1;
                if found.is_none() {
                    found = Some(loaded);
                }
            }
        }
        Ok(match (matches, found) {
            (1, Some(loaded)) => FindOne::Found(loaded),
            (0, _) | (_, None) => FindOne::NotFound,
            (matches, Some(_)) => FindOne::Ambiguous { matches },
        })
    }

    async fn insert(&self, instance: &SagaInstance<D>) -> Result<VersionToken, StoreError> {
        let bytes = SagaRow::new(instance, VersionToken::INITIAL).to_bytes()?;
        match self.rows.entry(instance.correlation_id()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey {
                correlation_id: instance.correlation_id(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(StoredRow {
                    version: VersionToken::INITIAL,
                    bytes,
                });
                Ok(VersionToken::INITIAL)
            }
        }
    }

    async fn save(
        &self,
        instance: &SagaInstance<D>,
        expected: VersionToken,
    ) -> Result<SaveOutcome, StoreError> {
        let Some(mut row) = self.rows.get_mut(&instance.correlation_id()) else {
            return Ok(SaveOutcome::Conflict {
                expected,
                actual: None,
            });
        };
        if row.version != expected {
            return Ok(SaveOutcome::Conflict {
                expected,
                actual: Some(row.version),
            });
        }
        let version = expected.next();
        row.bytes = SagaRow::new(instance, version).to_bytes()?;
        row.version = version;
        Ok(SaveOutcome::Committed(version))
    }

    async fn acquire_row_lock(
        &self,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<RowLock, StoreError> {
        let mutex = self
            .locks
            .entry(correlation_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(RowLock::new(
                correlation_id,
                HeldRow {
                    correlation_id,
                    guard: Some(guard),
                    locks: self.locks.clone(),
                },
            )),
            Err(_elapsed) => {
                release_unused(&self.locks, correlation_id);
                Err(StoreError::LockTimeout {
                    correlation_id,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Order {
        customer: String,
        total: u32,
    }

    fn order(customer: &str) -> SagaInstance<Order> {
        SagaInstance::with_data(
            CorrelationId::new(),
            Order {
                customer: customer.to_string(),
                total: 0,
            },
        )
    }

    #[tokio::test]
    async fn insert_then_load() {
        let store = InMemorySagaStore::new();
        let instance = order("alice");
        assert_eq!(store.insert(&instance).await.unwrap(), VersionToken::INITIAL);

        let loaded = store.load(instance.correlation_id()).await.unwrap().unwrap();
        assert_eq!(loaded.instance, instance);
        assert_eq!(loaded.version, VersionToken::INITIAL);
        assert!(store.load(CorrelationId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemorySagaStore::new();
        let instance = order("alice");
        store.insert(&instance).await.unwrap();
        assert!(matches!(
            store.insert(&instance).await,
            Err(StoreError::DuplicateKey { .. })
        ));
    }

    #[tokio::test]
    async fn save_checks_expected_version() {
        let store = InMemorySagaStore::new();
        let mut instance = order("alice");
        store.insert(&instance).await.unwrap();

        instance.data.total = 10;
        let committed = store.save(&instance, VersionToken::INITIAL).await.unwrap();
        assert_eq!(committed, SaveOutcome::Committed(VersionToken::from_value(2)));

        instance.data.total = 20;
        let stale = store.save(&instance, VersionToken::INITIAL).await.unwrap();
        assert_eq!(
            stale,
            SaveOutcome::Conflict {
                expected: VersionToken::INITIAL,
                actual: Some(VersionToken::from_value(2)),
            }
        );

        let loaded = store.load(instance.correlation_id()).await.unwrap().unwrap();
        assert_eq!(loaded.instance.data.total, 10);
    }

    #[tokio::test]
    async fn save_of_missing_row_conflicts() {
        let store = InMemorySagaStore::<Order>::new();
        let outcome = store.save(&order("bob"), VersionToken::INITIAL).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Conflict { actual: None, .. }));
    }

    #[tokio::test]
    async fn try_find_one_distinguishes_zero_one_many() {
        let store = InMemorySagaStore::new();
        store.insert(&order("alice")).await.unwrap();
        store.insert(&order("bob")).await.unwrap();
        store.insert(&order("bob")).await.unwrap();

        let by_customer = |name: &'static str| move |i: &SagaInstance<Order>| i.data.customer == name;

        assert!(matches!(
            store.try_find_one(&by_customer("carol")).await.unwrap(),
            FindOne::NotFound
        ));
        match store.try_find_one(&by_customer("alice")).await.unwrap() {
            FindOne::Found(loaded) => assert_eq!(loaded.instance.data.customer, "alice"),
            other => panic!("expected a single match, got {other:?}"),
        }
        assert!(matches!(
            store.try_find_one(&by_customer("bob")).await.unwrap(),
            FindOne::Ambiguous { matches: 2 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn row_lock_times_out_while_held() {
        let store = InMemorySagaStore::<Order>::new();
        let id = CorrelationId::new();
        let held = store
            .acquire_row_lock(id, Duration::from_millis(10))
            .await
            .unwrap();

        let err = store
            .acquire_row_lock(id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { timeout_ms: 50, .. }));

        drop(held);
        store
            .acquire_row_lock(id, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn released_row_locks_are_forgotten() {
        let store = InMemorySagaStore::<Order>::new();
        for _ in 0..32 {
            let lock = store
                .acquire_row_lock(CorrelationId::new(), Duration::from_millis(10))
                .await
                .unwrap();
            assert_eq!(store.lock_entries(), 1);
            drop(lock);
        }
        assert_eq!(store.lock_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_row_lock_survives_release() {
        let store = Arc::new(InMemorySagaStore::<Order>::new());
        let id = CorrelationId::new();
        let held = store
            .acquire_row_lock(id, Duration::from_millis(10))
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let store = store.clone();
            async move { store.acquire_row_lock(id, Duration::from_secs(5)).await }
        });
        tokio::task::yield_now().await;
        drop(held);

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(store.lock_entries(), 1);
        drop(second);
        assert_eq!(store.lock_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_leaves_no_entry_behind() {
        let store = InMemorySagaStore::<Order>::new();
        let id = CorrelationId::new();
        let held = store
            .acquire_row_lock(id, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(store
            .acquire_row_lock(id, Duration::from_millis(10))
            .await
            .is_err());
        assert_eq!(store.lock_entries(), 1);

        drop(held);
        assert_eq!(store.lock_entries(), 0);
    }

    #[tokio::test]
    async fn rows_snapshot_decodes_everything() {
        let store = InMemorySagaStore::new();
        store.insert(&order("alice")).await.unwrap();
        store.insert(&order("bob")).await.unwrap();
        assert_eq!(store.rows().unwrap().len(), 2);
        assert_eq!(store.len(), 2);
    }
}

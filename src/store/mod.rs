//! Transactional document store adapter.
//!
//! Wraps the document database behind a narrow interface: versioned snapshot
//! reads, a conditional commit with first-committer-wins conflict detection,
//! and unconditional batches for sequences that are intentionally non-atomic
//! (hydration, absorb) and safely repeatable instead.
//!
//! Transaction bodies receive a read-only [`Snapshot`] and a separate
//! [`WriteBatch`] accumulator, so a write can never be observed by a later
//! read in the same attempt. Bodies return [`Txn`]: business outcomes are
//! values, never errors thrown through the commit machinery.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::RetryConfig;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Document version. `0` means the document does not exist; every committed
/// write bumps it. Commit-time validation compares read versions against
/// current ones.
pub type Version = u64;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("write conflict on {collection}/{id}")]
    Conflict { collection: &'static str, id: String },

    #[error("transaction {op} exhausted after {attempts} attempts")]
    RetriesExhausted { op: &'static str, attempts: usize },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Conflicts are resolved by retrying the transaction, never by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Named entity collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Accounts,
    AccountLinks,
    PhoneIndex,
    AppAccountTokens,
    Entitlements,
    MergeJobs,
    MonthlyUsage,
    Users,
    Records,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Accounts => "accounts",
            Collection::AccountLinks => "account_links",
            Collection::PhoneIndex => "phone_index",
            Collection::AppAccountTokens => "app_account_tokens",
            Collection::Entitlements => "entitlements",
            Collection::MergeJobs => "merge_jobs",
            Collection::MonthlyUsage => "monthly_usage",
            Collection::Users => "users",
            Collection::Records => "records",
        }
    }
}

/// Fully-qualified document key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub collection: Collection,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }
}

/// A staged write.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Replace the document.
    Put { key: DocKey, value: Value },
    /// Merge top-level fields into the document, creating it if absent.
    Merge { key: DocKey, fields: Value },
    /// Remove the document.
    Delete { key: DocKey },
}

/// Interface for document persistence.
///
/// Implementations provide snapshot-consistent versioned reads and a
/// first-committer-wins conditional commit; contention is resolved by the
/// [`Transactor`]'s retry loop, not by locking.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one document with its version. Absent documents are `(0, None)`.
    async fn get_raw(&self, key: &DocKey) -> Result<(Version, Option<Value>)>;

    /// Atomically apply `writes` iff every document in `reads` still has the
    /// recorded version. Fails with [`StoreError::Conflict`] otherwise.
    async fn commit(&self, reads: &[(DocKey, Version)], writes: &[WriteOp]) -> Result<()>;

    /// Apply writes unconditionally, as one batch. Used only for sequences
    /// that are designed to be idempotent rather than atomic.
    async fn apply(&self, writes: &[WriteOp]) -> Result<()>;

    /// Ids of records owned by `owner_uid` that have no account reference,
    /// bounded by `limit`. Feeds the absorb path.
    async fn list_unlinked_records(&self, owner_uid: &str, limit: usize) -> Result<Vec<String>>;

    /// All entitlement documents owned by `owner_uid`.
    async fn list_entitlements_by_owner(&self, owner_uid: &str) -> Result<Vec<Value>>;

    /// Allocate a store-generated random document id.
    fn allocate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// One-off typed read outside a transaction.
pub async fn fetch<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: Collection,
    id: &str,
) -> Result<Option<T>> {
    let (_, value) = store.get_raw(&DocKey::new(collection, id)).await?;
    match value {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Read-only snapshot handle for one transaction attempt.
///
/// Every read is recorded as `(key, version)`; the commit validates the whole
/// read set, so any document this attempt observed is protected against
/// concurrent modification.
pub struct Snapshot {
    store: Arc<dyn DocumentStore>,
    reads: Mutex<Vec<(DocKey, Version)>>,
}

impl Snapshot {
    fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            reads: Mutex::new(Vec::new()),
        }
    }

    /// Read and deserialize one document, recording it in the read set.
    pub async fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<T>> {
        let key = DocKey::new(collection, id);
        let (version, value) = self.store.get_raw(&key).await?;
        self.reads.lock().await.push((key, version));
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn into_reads(self) -> Vec<(DocKey, Version)> {
        self.reads.into_inner()
    }
}

/// Write accumulator for one transaction attempt. Staged writes are applied
/// only if the attempt commits.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Stage a full-document write.
    pub fn put<T: Serialize>(&mut self, collection: Collection, id: &str, doc: &T) -> Result<()> {
        self.ops.push(WriteOp::Put {
            key: DocKey::new(collection, id),
            value: serde_json::to_value(doc)?,
        });
        Ok(())
    }

    /// Stage a top-level field merge.
    pub fn merge(&mut self, collection: Collection, id: &str, fields: Value) {
        self.ops.push(WriteOp::Merge {
            key: DocKey::new(collection, id),
            fields,
        });
    }

    /// Stage a delete.
    pub fn delete(&mut self, collection: Collection, id: &str) {
        self.ops.push(WriteOp::Delete {
            key: DocKey::new(collection, id),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

/// Verdict of a transaction body.
pub enum Txn<T> {
    /// Apply the staged writes and return the value.
    Commit(T),
    /// Discard the staged writes and return the value. Business rejections
    /// (seat taken, job expired) travel this way; they are outcomes, not
    /// storage failures, and must not burn retry attempts.
    Abort(T),
}

/// Runs transaction bodies with bounded retry on write conflict.
///
/// Each attempt gets a fresh [`Snapshot`] and [`WriteBatch`]; a conflicting
/// commit backs off (exponential, jittered) and re-runs the body against the
/// new state of the world. Only non-retryable errors surface to callers.
#[derive(Clone)]
pub struct Transactor {
    store: Arc<dyn DocumentStore>,
    retry: RetryConfig,
}

impl Transactor {
    pub fn new(store: Arc<dyn DocumentStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn backoff(&self) -> impl Iterator<Item = std::time::Duration> {
        ExponentialBuilder::default()
            .with_min_delay(std::time::Duration::from_millis(self.retry.min_delay_ms))
            .with_max_delay(std::time::Duration::from_millis(self.retry.max_delay_ms))
            .with_max_times(self.retry.max_attempts)
            .with_jitter()
            .build()
    }

    /// Run `body` until it commits, aborts, or retries are exhausted.
    pub async fn run<T, F>(&self, op: &'static str, body: F) -> Result<T>
    where
        T: Send,
        F: for<'a> Fn(&'a Snapshot, &'a mut WriteBatch) -> BoxFuture<'a, Result<Txn<T>>>,
    {
        let mut backoff = self.backoff();
        let attempts = self.retry.max_attempts;

        for attempt in 1..=attempts {
            let snapshot = Snapshot::new(Arc::clone(&self.store));
            let mut batch = WriteBatch::default();

            match body(&snapshot, &mut batch).await? {
                Txn::Abort(value) => return Ok(value),
                Txn::Commit(value) => {
                    let reads = snapshot.into_reads();
                    match self.store.commit(&reads, batch.ops()).await {
                        Ok(()) => return Ok(value),
                        Err(err) if err.is_retryable() => {
                            debug!(op, attempt, %err, "transaction conflict, retrying");
                            if let Some(delay) = backoff.next() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        error!(op, attempts, "transaction retries exhausted");
        Err(StoreError::RetriesExhausted { op, attempts })
    }
}

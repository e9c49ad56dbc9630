//! In-memory document store.
//!
//! Backs tests and standalone embedding. Provides the same consistency
//! contract the production adapters must honor: per-document versions,
//! snapshot reads, and first-committer-wins conditional commits.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

use super::{Collection, DocKey, DocumentStore, Result, StoreError, Version, WriteOp};

type Key = (&'static str, String);

#[derive(Default)]
struct Inner {
    /// Version and current value per key. Deleted documents keep their entry
    /// (value `None`) so their version history survives for conflict checks.
    docs: HashMap<Key, (Version, Option<Value>)>,
    /// Total write operations applied, across commits and batches.
    write_ops: u64,
}

/// In-memory implementation of [`DocumentStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(key: &DocKey) -> Key {
        (key.collection.name(), key.id.clone())
    }

    fn apply_ops(inner: &mut Inner, writes: &[WriteOp]) {
        for op in writes {
            match op {
                WriteOp::Put { key, value } => {
                    let entry = inner.docs.entry(Self::key(key)).or_insert((0, None));
                    entry.0 += 1;
                    entry.1 = Some(value.clone());
                }
                WriteOp::Merge { key, fields } => {
                    let entry = inner.docs.entry(Self::key(key)).or_insert((0, None));
                    entry.0 += 1;
                    let merged = match (entry.1.take(), fields) {
                        (Some(Value::Object(mut existing)), Value::Object(fields)) => {
                            for (k, v) in fields {
                                existing.insert(k.clone(), v.clone());
                            }
                            Value::Object(existing)
                        }
                        (_, fields) => fields.clone(),
                    };
                    entry.1 = Some(merged);
                }
                WriteOp::Delete { key } => {
                    let entry = inner.docs.entry(Self::key(key)).or_insert((0, None));
                    entry.0 += 1;
                    entry.1 = None;
                }
            }
            inner.write_ops += 1;
        }
    }

    /// Number of live documents in a collection.
    pub async fn count(&self, collection: Collection) -> usize {
        let inner = self.inner.read().await;
        inner
            .docs
            .iter()
            .filter(|((name, _), (_, value))| *name == collection.name() && value.is_some())
            .count()
    }

    /// Total write operations applied so far. Tests use this to assert that
    /// repeated resolutions converge to a no-op.
    pub async fn write_op_count(&self) -> u64 {
        self.inner.read().await.write_ops
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn get_raw(&self, key: &DocKey) -> Result<(Version, Option<Value>)> {
        let inner = self.inner.read().await;
        Ok(inner
            .docs
            .get(&Self::key(key))
            .map(|(version, value)| (*version, value.clone()))
            .unwrap_or((0, None)))
    }

    async fn commit(&self, reads: &[(DocKey, Version)], writes: &[WriteOp]) -> Result<()> {
        let mut inner = self.inner.write().await;

        for (key, read_version) in reads {
            let current = inner
                .docs
                .get(&Self::key(key))
                .map(|(version, _)| *version)
                .unwrap_or(0);
            if current != *read_version {
                return Err(StoreError::Conflict {
                    collection: key.collection.name(),
                    id: key.id.clone(),
                });
            }
        }

        Self::apply_ops(&mut inner, writes);
        Ok(())
    }

    async fn apply(&self, writes: &[WriteOp]) -> Result<()> {
        let mut inner = self.inner.write().await;
        Self::apply_ops(&mut inner, writes);
        Ok(())
    }

    async fn list_unlinked_records(&self, owner_uid: &str, limit: usize) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .docs
            .iter()
            .filter_map(|((name, id), (_, value))| {
                if *name != Collection::Records.name() {
                    return None;
                }
                let value = value.as_ref()?;
                if value.get("ownerUid").and_then(Value::as_str) != Some(owner_uid) {
                    return None;
                }
                match value.get("ownerAccountId") {
                    None | Some(Value::Null) => Some(id.clone()),
                    Some(_) => None,
                }
            })
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn list_entitlements_by_owner(&self, owner_uid: &str) -> Result<Vec<Value>> {
        let inner = self.inner.read().await;
        Ok(inner
            .docs
            .iter()
            .filter_map(|((name, _), (_, value))| {
                if *name != Collection::Entitlements.name() {
                    return None;
                }
                let value = value.as_ref()?;
                if value.get("ownerUserId").and_then(Value::as_str) == Some(owner_uid) {
                    Some(value.clone())
                } else {
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(collection: Collection, id: &str) -> DocKey {
        DocKey::new(collection, id)
    }

    #[tokio::test]
    async fn test_absent_document_reads_version_zero() {
        let store = MemoryStore::new();
        let (version, value) = store.get_raw(&key(Collection::Accounts, "a1")).await.unwrap();
        assert_eq!(version, 0);
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_commit_bumps_version() {
        let store = MemoryStore::new();
        let k = key(Collection::Accounts, "a1");
        store
            .commit(
                &[(k.clone(), 0)],
                &[WriteOp::Put {
                    key: k.clone(),
                    value: json!({"plan": "free"}),
                }],
            )
            .await
            .unwrap();

        let (version, value) = store.get_raw(&k).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(value.unwrap()["plan"], "free");
    }

    #[tokio::test]
    async fn test_first_committer_wins() {
        let store = MemoryStore::new();
        let k = key(Collection::Accounts, "a1");

        // Both "transactions" read version 0; only the first commit lands.
        store
            .commit(
                &[(k.clone(), 0)],
                &[WriteOp::Put {
                    key: k.clone(),
                    value: json!({"winner": 1}),
                }],
            )
            .await
            .unwrap();

        let err = store
            .commit(
                &[(k.clone(), 0)],
                &[WriteOp::Put {
                    key: k.clone(),
                    value: json!({"winner": 2}),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let (_, value) = store.get_raw(&k).await.unwrap();
        assert_eq!(value.unwrap()["winner"], 1);
    }

    #[tokio::test]
    async fn test_merge_creates_and_overlays() {
        let store = MemoryStore::new();
        let k = key(Collection::Users, "u1");

        store
            .apply(&[WriteOp::Merge {
                key: k.clone(),
                fields: json!({"accountId": "a1"}),
            }])
            .await
            .unwrap();
        store
            .apply(&[WriteOp::Merge {
                key: k.clone(),
                fields: json!({"phoneE164": "+8190"}),
            }])
            .await
            .unwrap();

        let (_, value) = store.get_raw(&k).await.unwrap();
        let value = value.unwrap();
        assert_eq!(value["accountId"], "a1");
        assert_eq!(value["phoneE164"], "+8190");
    }

    #[tokio::test]
    async fn test_delete_keeps_version_history() {
        let store = MemoryStore::new();
        let k = key(Collection::MergeJobs, "m1");

        store
            .apply(&[WriteOp::Put {
                key: k.clone(),
                value: json!({"status": "pending"}),
            }])
            .await
            .unwrap();
        store.apply(&[WriteOp::Delete { key: k.clone() }]).await.unwrap();

        let (version, value) = store.get_raw(&k).await.unwrap();
        assert_eq!(version, 2);
        assert!(value.is_none());

        // A transaction that read the document before deletion must conflict.
        let err = store.commit(&[(k.clone(), 1)], &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_list_unlinked_records_filters_and_bounds() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let owner = if i < 3 { "u1" } else { "u2" };
            let mut doc = json!({"ownerUid": owner});
            if i == 2 {
                doc["ownerAccountId"] = json!("a1");
            }
            store
                .apply(&[WriteOp::Put {
                    key: key(Collection::Records, &format!("r{i}")),
                    value: doc,
                }])
                .await
                .unwrap();
        }

        let ids = store.list_unlinked_records("u1", 10).await.unwrap();
        assert_eq!(ids, vec!["r0".to_string(), "r1".to_string()]);

        let ids = store.list_unlinked_records("u1", 1).await.unwrap();
        assert_eq!(ids.len(), 1);
    }
}

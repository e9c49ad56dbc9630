//! Merge Coordinator.
//!
//! Explicit account merges run as a two-phase saga: `merge_start` records a
//! short-lived pending job for client confirmation, `merge_commit` repoints
//! the source link in one transaction and enqueues the bulk record migration
//! fire-and-forget. The link pointer is authoritative immediately; physical
//! record migration may lag and is safely re-runnable.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::BusinessConfig;
use crate::error::CoreError;
use crate::model::{
    Account, AccountLink, LinkReason, MergeJob, MergeJobStatus, MergeStrategy, UserProfile,
};
use crate::store::{fetch, Collection, DocKey, Transactor, Txn, WriteOp};
use crate::tasks::{MigrationTask, TaskQueue};

use futures::future::FutureExt;

/// Plan description returned by [`MergeCoordinator::merge_start`] for client
/// confirmation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePlan {
    pub merge_job_id: String,
    pub source_uid: String,
    pub target_uid: String,
    pub source_account_id: String,
    pub target_account_id: String,
    pub strategy: MergeStrategy,
    pub expires_at: chrono::DateTime<Utc>,
}

pub struct MergeCoordinator {
    txn: Transactor,
    tasks: Arc<dyn TaskQueue>,
    business: BusinessConfig,
}

impl MergeCoordinator {
    pub fn new(txn: Transactor, tasks: Arc<dyn TaskQueue>, business: BusinessConfig) -> Self {
        Self {
            txn,
            tasks,
            business,
        }
    }

    /// Back-fill `owner_account_id` on records owned by `uid` that lack an
    /// account reference. Best-effort and bounded; returns how many records
    /// were absorbed. Chunked unconditional batches keep each write under the
    /// store's batch size limit, and a partial pass is simply resumed by the
    /// next call.
    pub async fn absorb_orphans(&self, uid: &str, account_id: &str) -> usize {
        let store = self.txn.store();
        let ids = match store
            .list_unlinked_records(uid, self.business.absorb_limit)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                warn!(uid = %uid, error = %err, "absorb query failed");
                return 0;
            }
        };
        if ids.is_empty() {
            return 0;
        }

        let now = Utc::now();
        let mut absorbed = 0;
        for chunk in ids.chunks(self.business.absorb_chunk.max(1)) {
            let ops: Vec<WriteOp> = chunk
                .iter()
                .map(|id| WriteOp::Merge {
                    key: DocKey::new(Collection::Records, id),
                    fields: json!({ "ownerAccountId": account_id, "updatedAt": now }),
                })
                .collect();
            match store.apply(&ops).await {
                Ok(()) => absorbed += chunk.len(),
                Err(err) => {
                    warn!(uid = %uid, absorbed, error = %err, "absorb batch failed, stopping pass");
                    break;
                }
            }
        }
        if absorbed > 0 {
            info!(uid = %uid, account_id = %account_id, absorbed, "absorbed orphaned records");
        }
        absorbed
    }

    /// Validate a merge request and record a pending job for confirmation.
    pub async fn merge_start(
        &self,
        source_uid: &str,
        target_uid: &str,
        strategy: &str,
    ) -> Result<MergePlan, CoreError> {
        // Only merging *into* the target is accepted; absorbing the target's
        // account would let a caller take over an account it has not proven
        // ownership of.
        if strategy != "keep_target" {
            return Err(CoreError::Validation(format!(
                "unsupported merge strategy: {strategy}"
            )));
        }
        if source_uid == target_uid {
            return Err(CoreError::Validation("cannot merge a user into itself".into()));
        }

        let store = self.txn.store();
        let target_profile: Option<UserProfile> =
            fetch(store.as_ref(), Collection::Users, target_uid).await?;
        if target_profile.is_none() {
            return Err(CoreError::NotFound {
                what: "user",
                id: target_uid.to_string(),
            });
        }

        let source_account_id = self.canonical_account_id(source_uid).await?.ok_or_else(|| {
            CoreError::Validation("source user has no account to merge".into())
        })?;
        let target_account_id = self.canonical_account_id(target_uid).await?.ok_or_else(|| {
            CoreError::NotFound {
                what: "account",
                id: target_uid.to_string(),
            }
        })?;
        if source_account_id == target_account_id {
            return Err(CoreError::Validation(
                "users already share the same account".into(),
            ));
        }

        let now = Utc::now();
        let job = MergeJob {
            source_uid: source_uid.to_string(),
            target_uid: target_uid.to_string(),
            strategy: MergeStrategy::KeepTarget,
            status: MergeJobStatus::Pending,
            created_at: now,
            expires_at: now + Duration::minutes(self.business.merge_job_ttl_minutes),
            committed_at: None,
        };
        let merge_job_id = store.allocate_id();
        store
            .apply(&[WriteOp::Put {
                key: DocKey::new(Collection::MergeJobs, &merge_job_id),
                value: serde_json::to_value(&job).map_err(crate::store::StoreError::from)?,
            }])
            .await?;

        info!(
            merge_job_id = %merge_job_id,
            source_uid = %source_uid,
            target_uid = %target_uid,
            "merge job created"
        );
        Ok(MergePlan {
            merge_job_id,
            source_uid: job.source_uid,
            target_uid: job.target_uid,
            source_account_id,
            target_account_id,
            strategy: job.strategy,
            expires_at: job.expires_at,
        })
    }

    /// Commit a pending merge job: repoint the source link to the target's
    /// canonical account and tombstone the losing account, atomically. The
    /// bulk record migration is enqueued afterwards, fire-and-forget.
    pub async fn merge_commit(
        &self,
        merge_job_id: &str,
        caller_uid: &str,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let merge_job_id = merge_job_id.to_string();
        let caller_uid = caller_uid.to_string();
        let outcome: Result<MigrationTask, CoreError> = self
            .txn
            .run("merge_commit", |snap, batch| {
                let merge_job_id = merge_job_id.clone();
                let caller_uid = caller_uid.clone();
                async move {
                    let job: Option<MergeJob> =
                        snap.get(Collection::MergeJobs, &merge_job_id).await?;
                    let Some(job) = job else {
                        return Ok(Txn::Abort(Err(CoreError::NotFound {
                            what: "merge job",
                            id: merge_job_id.to_string(),
                        })));
                    };
                    if job.status != MergeJobStatus::Pending {
                        return Ok(Txn::Abort(Err(CoreError::Validation(
                            "merge job is not pending".into(),
                        ))));
                    }
                    if now >= job.expires_at {
                        return Ok(Txn::Abort(Err(CoreError::Validation(
                            "merge job has expired".into(),
                        ))));
                    }
                    if job.source_uid != caller_uid {
                        return Ok(Txn::Abort(Err(CoreError::OwnershipConflict(
                            "merge job belongs to another user".into(),
                        ))));
                    }

                    // The target's link is canonical; the profile accountId is
                    // the legacy fallback.
                    let target_link: Option<AccountLink> =
                        snap.get(Collection::AccountLinks, &job.target_uid).await?;
                    let target_account_id = match target_link {
                        Some(link) => link.account_id,
                        None => {
                            let profile: Option<UserProfile> =
                                snap.get(Collection::Users, &job.target_uid).await?;
                            match profile.and_then(|p| p.account_id) {
                                Some(id) => id,
                                None => {
                                    return Ok(Txn::Abort(Err(CoreError::NotFound {
                                        what: "account",
                                        id: job.target_uid.clone(),
                                    })));
                                }
                            }
                        }
                    };

                    let source_link: Option<AccountLink> =
                        snap.get(Collection::AccountLinks, &job.source_uid).await?;
                    let losing_account_id = source_link
                        .as_ref()
                        .map(|l| l.account_id.clone())
                        .filter(|id| *id != target_account_id);

                    let target_account: Option<Account> =
                        snap.get(Collection::Accounts, &target_account_id).await?;

                    batch.put(
                        Collection::AccountLinks,
                        &job.source_uid,
                        &AccountLink {
                            uid: job.source_uid.clone(),
                            account_id: target_account_id.clone(),
                            linked_at: now,
                            reason: LinkReason::Merge,
                            previous_account_id: losing_account_id.clone(),
                            merge_job_id: Some(merge_job_id.to_string()),
                        },
                    )?;
                    batch.merge(
                        Collection::Users,
                        &job.source_uid,
                        json!({ "accountId": target_account_id, "updatedAt": now }),
                    );
                    if let Some(mut account) = target_account {
                        if !account.member_uids.iter().any(|m| *m == job.source_uid) {
                            account.member_uids.push(job.source_uid.clone());
                        }
                        account.updated_at = now;
                        batch.put(Collection::Accounts, &target_account_id, &account)?;
                    }
                    if let Some(losing) = &losing_account_id {
                        batch.merge(
                            Collection::Accounts,
                            losing,
                            json!({ "mergedInto": target_account_id, "mergedAt": now }),
                        );
                    }
                    batch.merge(
                        Collection::MergeJobs,
                        &merge_job_id,
                        json!({ "status": "committed", "committedAt": now }),
                    );

                    Ok(Txn::Commit(Ok(MigrationTask {
                        merge_job_id: merge_job_id.to_string(),
                        source_uid: job.source_uid,
                        target_uid: job.target_uid,
                        target_account_id,
                    })))
                }
                .boxed()
            })
            .await?;
        let task = outcome?;

        info!(
            merge_job_id = %merge_job_id,
            source_uid = %task.source_uid,
            target_account_id = %task.target_account_id,
            "merge committed"
        );
        // The link pointer is already authoritative; a lost enqueue only
        // delays physical migration, so it is logged and never rolled back.
        if let Err(err) = self.tasks.enqueue_merge_migration(task).await {
            error!(merge_job_id = %merge_job_id, error = %err, "migration enqueue failed");
        }
        Ok(())
    }

    /// Canonical account for a uid: the link when present, otherwise the
    /// legacy profile accountId.
    async fn canonical_account_id(&self, uid: &str) -> Result<Option<String>, CoreError> {
        let store = self.txn.store();
        let link: Option<AccountLink> =
            fetch(store.as_ref(), Collection::AccountLinks, uid).await?;
        if let Some(link) = link {
            return Ok(Some(link.account_id));
        }
        let profile: Option<UserProfile> = fetch(store.as_ref(), Collection::Users, uid).await?;
        Ok(profile.and_then(|p| p.account_id))
    }
}

//! Cost Guard.
//!
//! Quota enforcement over monthly usage counters. The triple lock runs in one
//! transaction: resolve the plan limit, read current usage, and reserve the
//! amount atomically with the check, so two concurrent requests can never
//! both pass on the same remaining budget.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use futures::future::FutureExt;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::config::BusinessConfig;
use crate::error::CoreError;
use crate::model::{Account, MonthlyUsage, UserProfile};
use crate::plans::{limit_rule, Feature, LimitRule, Plan};
use crate::store::{Collection, Snapshot, StoreError, Transactor, Txn};

/// Whether quota is tracked per billing account or per user identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaMode {
    Account,
    User,
}

impl QuotaMode {
    fn collection(&self) -> Collection {
        match self {
            QuotaMode::Account => Collection::Accounts,
            QuotaMode::User => Collection::Users,
        }
    }
}

/// Metadata returned with a blocked reservation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDenial {
    pub entity_id: String,
    pub plan: Plan,
    pub rule: String,
    pub limit: f64,
    pub used: f64,
    pub month_key: String,
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Allowed,
    Blocked(QuotaDenial),
}

impl ReserveOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ReserveOutcome::Allowed)
    }
}

/// Read-only usage projection for client display. Shares the exact plan and
/// limit resolution with [`CostGuard::reserve`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub plan: Plan,
    pub month_key: String,
    pub limit_seconds: f64,
    pub used_seconds: f64,
    pub remaining_seconds: f64,
    pub session_limit: f64,
    pub sessions_started: f64,
    pub can_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_if_blocked: Option<String>,
}

pub struct CostGuard {
    txn: Transactor,
    business: BusinessConfig,
}

impl CostGuard {
    pub fn new(txn: Transactor, business: BusinessConfig) -> Self {
        Self { txn, business }
    }

    fn business_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.business.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    /// Calendar month key in the business timezone, e.g. `2026-08`.
    pub fn month_key(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&self.business_offset())
            .format("%Y-%m")
            .to_string()
    }

    /// Check the plan limit and reserve `amount` atomically.
    ///
    /// Missing entity documents resolve to the free plan rather than failing
    /// closed; a feature with no rule for the plan is blocked with rule
    /// `feature_not_supported`. The boundary is inclusive: consumption landing
    /// exactly on the limit is allowed, only exceeding it is blocked.
    pub async fn reserve(
        &self,
        entity_id: &str,
        feature: Feature,
        amount: f64,
        mode: QuotaMode,
    ) -> Result<ReserveOutcome, CoreError> {
        if !(amount > 0.0) {
            return Err(CoreError::Validation(
                "reservation amount must be positive".into(),
            ));
        }
        let now = Utc::now();
        let month_key = self.month_key(now);
        let entity_id = entity_id.to_string();

        let outcome = self
            .txn
            .run("cost_guard_reserve", |snap, batch| {
                let month_key = month_key.clone();
                let entity_id = entity_id.clone();
                async move {
                    let plan = resolve_plan(snap, &entity_id, mode, now).await?;

                    if feature == Feature::ServerSession {
                        // Concurrent sessions live on the entity document
                        // itself, not in a monthly window.
                        let doc: Option<serde_json::Value> =
                            snap.get(mode.collection(), &entity_id).await?;
                        let count = doc
                            .as_ref()
                            .and_then(|d| d.get("serverSessionCount"))
                            .and_then(serde_json::Value::as_f64)
                            .unwrap_or(0.0);
                        let rule = match limit_rule(plan, feature) {
                            Some(rule) => rule,
                            None => {
                                return Ok(Txn::Abort(ReserveOutcome::Blocked(QuotaDenial {
                                    entity_id: entity_id.to_string(),
                                    plan,
                                    rule: "feature_not_supported".to_string(),
                                    limit: 0.0,
                                    used: count,
                                    month_key,
                                })));
                            }
                        };
                        if count + amount > rule.limit && !rule.soft {
                            return Ok(Txn::Abort(ReserveOutcome::Blocked(denial(
                                &entity_id, plan, &rule, count, month_key,
                            ))));
                        }
                        batch.merge(
                            mode.collection(),
                            &entity_id,
                            json!({ "serverSessionCount": count + amount, "updatedAt": now }),
                        );
                        return Ok(Txn::Commit(ReserveOutcome::Allowed));
                    }

                    let rule = match limit_rule(plan, feature) {
                        Some(rule) => rule,
                        None => {
                            return Ok(Txn::Abort(ReserveOutcome::Blocked(QuotaDenial {
                                entity_id: entity_id.to_string(),
                                plan,
                                rule: "feature_not_supported".to_string(),
                                limit: 0.0,
                                used: 0.0,
                                month_key,
                            })));
                        }
                    };

                    let doc_id = format!("{entity_id}:{month_key}");
                    let mut usage: MonthlyUsage = snap
                        .get(Collection::MonthlyUsage, &doc_id)
                        .await?
                        .unwrap_or_default();
                    let used = usage.get(rule.counter);
                    if used + amount > rule.limit && !rule.soft {
                        return Ok(Txn::Abort(ReserveOutcome::Blocked(denial(
                            &entity_id, plan, &rule, used, month_key,
                        ))));
                    }
                    usage.set(rule.counter, used + amount);
                    usage.updated_at = Some(now);
                    batch.put(Collection::MonthlyUsage, &doc_id, &usage)?;
                    Ok(Txn::Commit(ReserveOutcome::Allowed))
                }
                .boxed()
            })
            .await?;
        Ok(outcome)
    }

    /// Best-effort decrement to compensate aborted downstream work. Counters
    /// are clamped at zero; failures are logged and never block the caller.
    pub async fn refund(&self, entity_id: &str, feature: Feature, amount: f64, mode: QuotaMode) {
        if !(amount > 0.0) {
            return;
        }
        let now = Utc::now();
        let month_key = self.month_key(now);
        let entity_id = entity_id.to_string();

        let result = self
            .txn
            .run("cost_guard_refund", |snap, batch| {
                let month_key = month_key.clone();
                let entity_id = entity_id.clone();
                async move {
                    let plan = resolve_plan(snap, &entity_id, mode, now).await?;
                    let counter = limit_rule(plan, feature)
                        .map(|rule| rule.counter)
                        .unwrap_or(feature);

                    if counter == Feature::ServerSession {
                        let doc: Option<serde_json::Value> =
                            snap.get(mode.collection(), &entity_id).await?;
                        let count = doc
                            .as_ref()
                            .and_then(|d| d.get("serverSessionCount"))
                            .and_then(serde_json::Value::as_f64)
                            .unwrap_or(0.0);
                        batch.merge(
                            mode.collection(),
                            &entity_id,
                            json!({
                                "serverSessionCount": (count - amount).max(0.0),
                                "updatedAt": now,
                            }),
                        );
                        return Ok(Txn::Commit(()));
                    }

                    let doc_id = format!("{entity_id}:{month_key}");
                    let mut usage: MonthlyUsage = snap
                        .get(Collection::MonthlyUsage, &doc_id)
                        .await?
                        .unwrap_or_default();
                    let used = usage.get(counter);
                    usage.set(counter, (used - amount).max(0.0));
                    usage.updated_at = Some(now);
                    batch.put(Collection::MonthlyUsage, &doc_id, &usage)?;
                    Ok(Txn::Commit(()))
                }
                .boxed()
            })
            .await;
        if let Err(err) = result {
            warn!(entity_id = %entity_id, feature = %feature, error = %err, "refund failed");
        }
    }

    /// Read-only projection of the limits `reserve` would enforce.
    pub async fn usage_report(
        &self,
        entity_id: &str,
        mode: QuotaMode,
    ) -> Result<UsageReport, CoreError> {
        let now = Utc::now();
        let month_key = self.month_key(now);
        let entity_id = entity_id.to_string();

        // Read-only transaction: reuses the snapshot-based plan resolution
        // and always aborts.
        let report = self
            .txn
            .run("cost_guard_report", |snap, _batch| {
                let month_key = month_key.clone();
                let entity_id = entity_id.clone();
                async move {
                    let plan = resolve_plan(snap, &entity_id, mode, now).await?;
                    let doc_id = format!("{entity_id}:{month_key}");
                    let usage: MonthlyUsage = snap
                        .get(Collection::MonthlyUsage, &doc_id)
                        .await?
                        .unwrap_or_default();

                    let stt = limit_rule(plan, Feature::CloudSttSec);
                    let sessions = limit_rule(plan, Feature::CloudSessionsStarted);
                    let limit_seconds = stt.map(|r| r.limit).unwrap_or(0.0);
                    let session_limit = sessions.map(|r| r.limit).unwrap_or(0.0);
                    let used_seconds =
                        stt.map(|r| usage.get(r.counter)).unwrap_or(0.0);
                    let sessions_started =
                        sessions.map(|r| usage.get(r.counter)).unwrap_or(0.0);

                    let reason_if_blocked = if plan == Plan::Premium {
                        None
                    } else if used_seconds >= limit_seconds {
                        Some("cloud_minutes_limit".to_string())
                    } else if sessions_started >= session_limit {
                        Some("cloud_session_limit".to_string())
                    } else {
                        None
                    };

                    Ok(Txn::Abort(UsageReport {
                        plan,
                        month_key,
                        limit_seconds,
                        used_seconds,
                        remaining_seconds: (limit_seconds - used_seconds).max(0.0),
                        session_limit,
                        sessions_started,
                        can_start: reason_if_blocked.is_none(),
                        reason_if_blocked,
                    }))
                }
                .boxed()
            })
            .await?;
        Ok(report)
    }
}

fn denial(
    entity_id: &str,
    plan: Plan,
    rule: &LimitRule,
    used: f64,
    month_key: String,
) -> QuotaDenial {
    QuotaDenial {
        entity_id: entity_id.to_string(),
        plan,
        rule: format!("{}_limit", rule.counter.key()),
        limit: rule.limit,
        used,
        month_key,
    }
}

/// Plan for a quota entity. User mode falls back to the linked account's plan
/// when the profile carries none; missing documents default to free so quota
/// checks never fail closed on an absent entity.
async fn resolve_plan(
    snap: &Snapshot,
    entity_id: &str,
    mode: QuotaMode,
    now: DateTime<Utc>,
) -> Result<Plan, StoreError> {
    match mode {
        QuotaMode::Account => {
            let account: Option<Account> = snap.get(Collection::Accounts, entity_id).await?;
            Ok(account.map(|a| a.effective_plan(now)).unwrap_or_default())
        }
        QuotaMode::User => {
            let profile: Option<UserProfile> = snap.get(Collection::Users, entity_id).await?;
            let Some(profile) = profile else {
                return Ok(Plan::Free);
            };
            if let Some(plan) = profile.plan {
                return Ok(plan);
            }
            match profile.account_id {
                Some(account_id) => {
                    let account: Option<Account> =
                        snap.get(Collection::Accounts, &account_id).await?;
                    Ok(account.map(|a| a.effective_plan(now)).unwrap_or_default())
                }
                None => Ok(Plan::Free),
            }
        }
    }
}

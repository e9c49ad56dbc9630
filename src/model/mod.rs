//! Entity records persisted in the document store.
//!
//! Documents are stored as camelCase JSON; every entity is an explicit record
//! type validated at the store boundary, with optional fields as `Option`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plans::Plan;

/// Provider name carried by phone-auth identities.
pub const PROVIDER_PHONE: &str = "phone";

/// Why an [`AccountLink`] points where it points. Audit metadata only; the
/// pointer itself is authoritative regardless of reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkReason {
    PhoneLink,
    Repair,
    JitCreate,
    AutoAttach,
    Merge,
}

/// The only source of truth for "which account is this login".
/// At most one per user identity, keyed by uid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLink {
    pub uid: String,
    pub account_id: String,
    pub linked_at: DateTime<Utc>,
    pub reason: LinkReason,
    /// Previous canonical account, recorded on auto-attach and merge for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_job_id: Option<String>,
}

/// Legacy display credits on the account document. Authoritative usage lives
/// in [`MonthlyUsage`]; these exist only so old clients render something.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credits {
    pub cloud_seconds_remaining: f64,
    pub summary_remaining: f64,
    pub quiz_remaining: f64,
}

impl Default for Credits {
    fn default() -> Self {
        Self {
            cloud_seconds_remaining: 1800.0,
            summary_remaining: 3.0,
            quiz_remaining: 3.0,
        }
    }
}

/// Canonical billing account. Never hard-deleted; a losing account in a merge
/// is tombstoned via `merged_into`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(default)]
    pub plan: Plan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_e164: Option<String>,
    #[serde(default)]
    pub phone_verified: bool,
    #[serde(default)]
    pub member_uids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_uid: Option<String>,
    #[serde(default)]
    pub credits: Credits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub server_session_count: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh free-tier account created on first resolution.
    pub fn new_free(phone_e164: Option<&str>, primary_uid: &str, now: DateTime<Utc>) -> Self {
        Self {
            plan: Plan::Free,
            phone_e164: phone_e164.map(str::to_string),
            phone_verified: phone_e164.is_some(),
            member_uids: vec![primary_uid.to_string()],
            primary_uid: Some(primary_uid.to_string()),
            credits: Credits::default(),
            plan_expires_at: None,
            merged_into: None,
            merged_at: None,
            server_session_count: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Plan after expiry degradation: a paid plan whose period end has passed
    /// counts as free until the next renewal lands.
    pub fn effective_plan(&self, now: DateTime<Utc>) -> Plan {
        match self.plan_expires_at {
            Some(expires) if self.plan != Plan::Free && expires <= now => Plan::Free,
            _ => self.plan,
        }
    }
}

/// Phone index row, keyed by E.164 phone number. Maps a verified phone to its
/// canonical account and the single "standard owner" uid whose purchases count
/// toward that phone's subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneIndex {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_owner_uid: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid_last_seen: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Binding of a client-generated purchase token to a user, keyed by token.
/// Defends against replaying another device's receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAccountToken {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Subscription lifecycle state derived from the verified receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    Active,
    Expired,
    Revoked,
}

/// Durable ledger entry binding one purchase to exactly one owning user,
/// keyed by `provider:originalTransactionId`. First claim wins; the owner
/// never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub provider: String,
    pub provider_entitlement_id: String,
    pub owner_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub plan: Plan,
    pub status: EntitlementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_account_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    /// Ledger document id for a purchase.
    pub fn ledger_id(provider: &str, original_transaction_id: &str) -> String {
        format!("{provider}:{original_transaction_id}")
    }

    /// Active means status is active and the period has not ended. A missing
    /// period end implies a perpetual entitlement.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == EntitlementStatus::Active
            && self.current_period_end.map_or(true, |end| now < end)
    }
}

/// Merge strategy. Only `keep_target` is accepted: merging the caller's
/// account *into* the target is safe, while `keep_current` would let a caller
/// absorb a phone account it has not proven ownership of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    KeepTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeJobStatus {
    Pending,
    Committed,
}

/// Short-lived saga record for an explicit account merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeJob {
    pub source_uid: String,
    pub target_uid: String,
    pub strategy: MergeStrategy,
    pub status: MergeJobStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

/// Monthly consumption counters for one entity, keyed `entityId:monthKey`.
/// Append-only except for explicit refunds; a closed month is never mutated
/// by new consumption (a new month key document is created instead).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyUsage {
    #[serde(default)]
    pub cloud_stt_sec: f64,
    #[serde(default)]
    pub cloud_sessions_started: f64,
    #[serde(default)]
    pub summary_generated: f64,
    #[serde(default)]
    pub quiz_generated: f64,
    #[serde(default)]
    pub llm_calls: f64,
    #[serde(default)]
    pub sessions_created: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MonthlyUsage {
    pub fn get(&self, feature: crate::plans::Feature) -> f64 {
        use crate::plans::Feature::*;
        match feature {
            CloudSttSec => self.cloud_stt_sec,
            CloudSessionsStarted => self.cloud_sessions_started,
            SummaryGenerated => self.summary_generated,
            QuizGenerated => self.quiz_generated,
            LlmCalls => self.llm_calls,
            SessionsCreated => self.sessions_created,
            // Concurrent sessions live on the entity document, not here.
            ServerSession => 0.0,
        }
    }

    pub fn set(&mut self, feature: crate::plans::Feature, value: f64) {
        use crate::plans::Feature::*;
        match feature {
            CloudSttSec => self.cloud_stt_sec = value,
            CloudSessionsStarted => self.cloud_sessions_started = value,
            SummaryGenerated => self.summary_generated = value,
            QuizGenerated => self.quiz_generated = value,
            LlmCalls => self.llm_calls = value,
            SessionsCreated => self.sessions_created = value,
            ServerSession => {}
        }
    }
}

/// Legacy denormalized user profile (the `users` collection). Written by the
/// upstream auth layer; this core reads it for self-repair and hydrates it
/// for consistency, never treating it as the link source of truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_e164: Option<String>,
    #[serde(default)]
    pub phone_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub server_session_count: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_account_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A user-owned historical record (the `records` collection). The absorb and
/// merge-migration paths re-point `owner_account_id`; everything else on the
/// document belongs to the feature pipelines and is out of scope here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedRecord {
    pub owner_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_from_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

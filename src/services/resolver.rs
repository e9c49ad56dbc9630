//! Account Link Resolver.
//!
//! Resolves an externally-verified identity to its canonical billing account.
//! Resolution is reject-less: every path converges to some valid account, and
//! failures on the repair, auto-attach and hydration steps are logged and
//! recovered locally so a user is never blocked from logging in.

use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::account_key::account_id_from_phone;
use crate::config::TrustConfig;
use crate::error::CoreError;
use crate::model::{Account, AccountLink, LinkReason, PhoneIndex, UserProfile, PROVIDER_PHONE};
use crate::plans::Plan;
use crate::store::{fetch, Collection, Transactor, Txn, WriteOp};

/// Externally-verified claim set for one request. The upstream identity
/// provider has already checked the bearer credential; these fields are
/// trusted as-is.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub uid: String,
    pub provider: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// How the canonical account was found on this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Existing link adopted as-is.
    Linked,
    /// Link recreated from the legacy profile record.
    Repaired,
    /// Link rewritten to the phone's canonical account.
    Attached,
    /// Account and link created just-in-time.
    Created,
}

/// Actions the client must gate behind phone verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PhoneGatedAction {
    SubscriptionRestore,
    AccountMerge,
}

/// Outcome of [`AccountResolver::resolve`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAccount {
    pub uid: String,
    pub account_id: String,
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_e164: Option<String>,
    pub providers: Vec<String>,
    pub needs_phone_verification: bool,
    pub needs_sns_login: bool,
    pub phone_required_for: Vec<PhoneGatedAction>,
    pub resolution: Resolution,
}

/// Resolves identities to canonical accounts.
pub struct AccountResolver {
    txn: Transactor,
    trust: TrustConfig,
}

impl AccountResolver {
    pub fn new(txn: Transactor, trust: TrustConfig) -> Self {
        Self { txn, trust }
    }

    /// Resolve `identity` to its canonical account, creating or repairing
    /// state as needed.
    pub async fn resolve(&self, identity: &Identity) -> Result<ResolvedAccount, CoreError> {
        if identity.uid.trim().is_empty() {
            return Err(CoreError::AuthenticationRequired);
        }
        let uid = identity.uid.as_str();
        let now = Utc::now();
        let store = self.txn.store();
        let phone = identity
            .phone_number
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());

        // Step 1: the link is the source of truth when present.
        let link: Option<AccountLink> =
            fetch(store.as_ref(), Collection::AccountLinks, uid).await?;
        let mut account_id = link.as_ref().map(|l| l.account_id.clone());
        let mut resolution = Resolution::Linked;

        // The legacy profile feeds self-repair and hydration; a failed read
        // just disables both for this call.
        let profile: Option<UserProfile> = match fetch(store.as_ref(), Collection::Users, uid).await
        {
            Ok(profile) => profile,
            Err(err) => {
                warn!(uid = %uid, error = %err, "profile read failed, skipping self-repair");
                None
            }
        };

        // Step 2: self-repair from the profile's denormalized accountId.
        if account_id.is_none() {
            if let Some(profile_account) = profile.as_ref().and_then(|p| p.account_id.clone()) {
                let repaired = AccountLink {
                    uid: uid.to_string(),
                    account_id: profile_account.clone(),
                    linked_at: now,
                    reason: LinkReason::Repair,
                    previous_account_id: None,
                    merge_job_id: None,
                };
                match serde_json::to_value(&repaired) {
                    Ok(value) => {
                        let op = WriteOp::Put {
                            key: crate::store::DocKey::new(Collection::AccountLinks, uid),
                            value,
                        };
                        if let Err(err) = store.apply(&[op]).await {
                            warn!(uid = %uid, error = %err, "self-repair link write failed");
                        }
                    }
                    Err(err) => {
                        warn!(uid = %uid, error = %err, "self-repair link encode failed");
                    }
                }
                // Adopt the repaired account even if the write did not land.
                account_id = Some(profile_account);
                resolution = Resolution::Repaired;
            }
        }

        // Step 3: the phone index is canonical and overrides the tentative
        // account. Reject-less: a failed attach falls back to the
        // pre-override account for this call only.
        if let Some(phone) = phone {
            match fetch::<PhoneIndex>(store.as_ref(), Collection::PhoneIndex, phone).await {
                Ok(Some(index)) if account_id.as_deref() != Some(index.account_id.as_str()) => {
                    let previous = account_id.clone();
                    match self
                        .auto_attach(uid, phone, &index.account_id, previous.as_deref(), now)
                        .await
                    {
                        Ok(()) => {
                            info!(
                                uid = %uid,
                                account_id = %index.account_id,
                                previous = ?previous,
                                "auto-attached to canonical phone account"
                            );
                            account_id = Some(index.account_id);
                            resolution = Resolution::Attached;
                        }
                        Err(err) => {
                            warn!(uid = %uid, error = %err, "auto-attach failed, using fallback account");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(uid = %uid, error = %err, "phone index read failed");
                }
            }
        }

        // Step 4: JIT creation.
        let account_id = match account_id {
            Some(id) => id,
            None => {
                resolution = Resolution::Created;
                let id = match phone {
                    Some(phone) => self.jit_create_with_phone(uid, phone, now).await?,
                    None => self.jit_create_phoneless(uid, now).await?,
                };
                info!(uid = %uid, account_id = %id, "account created just-in-time");
                id
            }
        };

        let account: Option<Account> =
            match fetch(store.as_ref(), Collection::Accounts, &account_id).await {
                Ok(account) => account,
                Err(err) => {
                    warn!(uid = %uid, account_id = %account_id, error = %err, "account read failed");
                    None
                }
            };

        // Step 5: hydration. Copies populated denormalized fields into empty
        // ones; never overwrites a non-empty field with an empty one.
        let resolved_phone = phone
            .map(str::to_string)
            .or_else(|| profile.as_ref().and_then(|p| p.phone_e164.clone()))
            .or_else(|| account.as_ref().and_then(|a| a.phone_e164.clone()));
        let providers = union_providers(profile.as_ref(), identity.provider.as_deref());
        self.hydrate(
            identity,
            &account_id,
            profile.as_ref(),
            account.as_ref(),
            resolved_phone.as_deref(),
            &providers,
            now,
        )
        .await;

        // Step 6: derived flags.
        let has_phone = resolved_phone.is_some();
        let has_device_token = profile
            .as_ref()
            .and_then(|p| p.app_account_token.as_ref())
            .is_some();
        let trusted_sns = providers
            .iter()
            .any(|p| self.trust.sns_providers.iter().any(|t| t == p));
        let has_sns_provider = providers.iter().any(|p| p != PROVIDER_PHONE);

        Ok(ResolvedAccount {
            uid: uid.to_string(),
            account_id,
            plan: account
                .as_ref()
                .map(|a| a.effective_plan(now))
                .unwrap_or_default(),
            phone_e164: resolved_phone,
            needs_phone_verification: !(has_phone || has_device_token || trusted_sns),
            needs_sns_login: identity.provider.as_deref() == Some(PROVIDER_PHONE)
                && !has_sns_provider,
            phone_required_for: if has_phone {
                Vec::new()
            } else {
                vec![
                    PhoneGatedAction::SubscriptionRestore,
                    PhoneGatedAction::AccountMerge,
                ]
            },
            providers,
            resolution,
        })
    }

    /// Atomically rewrite the link to the phone's canonical account, recording
    /// the previous account for audit.
    async fn auto_attach(
        &self,
        uid: &str,
        phone: &str,
        canonical_account_id: &str,
        previous_account_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let uid = uid.to_string();
        let phone = phone.to_string();
        let canonical_account_id = canonical_account_id.to_string();
        let previous_account_id = previous_account_id.map(str::to_string);
        self.txn
            .run("resolver_auto_attach", |snap, batch| {
                let uid = uid.clone();
                let phone = phone.clone();
                let canonical_account_id = canonical_account_id.clone();
                let previous_account_id = previous_account_id.clone();
                async move {
                    let account: Option<Account> =
                        snap.get(Collection::Accounts, &canonical_account_id).await?;
                    let index: Option<PhoneIndex> =
                        snap.get(Collection::PhoneIndex, &phone).await?;

                    let account = match account {
                        Some(mut account) => {
                            if !account.member_uids.iter().any(|m| m == &uid) {
                                account.member_uids.push(uid.to_string());
                            }
                            account.updated_at = now;
                            account
                        }
                        // Dangling index row; recreate the account rather than
                        // bounce the login.
                        None => Account::new_free(Some(&phone), &uid, now),
                    };
                    batch.put(Collection::Accounts, &canonical_account_id, &account)?;

                    batch.put(
                        Collection::AccountLinks,
                        &uid,
                        &AccountLink {
                            uid: uid.to_string(),
                            account_id: canonical_account_id.to_string(),
                            linked_at: now,
                            reason: LinkReason::AutoAttach,
                            previous_account_id,
                            merge_job_id: None,
                        },
                    )?;
                    batch.merge(
                        Collection::Users,
                        &uid,
                        json!({
                            "accountId": canonical_account_id,
                            "phoneE164": phone,
                            "updatedAt": now,
                        }),
                    );
                    if index.is_some() {
                        batch.merge(
                            Collection::PhoneIndex,
                            &phone,
                            json!({ "uidLastSeen": uid, "updatedAt": now }),
                        );
                    }
                    Ok(Txn::Commit(()))
                }
                .boxed()
            })
            .await?;
        Ok(())
    }

    /// Create the account under the deterministic phone-derived id. A racing
    /// second device computes the same id, so the transaction degenerates to
    /// an idempotent merge instead of a duplicate create.
    async fn jit_create_with_phone(
        &self,
        uid: &str,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<String, CoreError> {
        let account_id = account_id_from_phone(phone)?;
        let uid = uid.to_string();
        let phone = phone.to_string();
        let id = self
            .txn
            .run("resolver_jit_phone", |snap, batch| {
                let account_id = account_id.clone();
                let uid = uid.clone();
                let phone = phone.clone();
                async move {
                    // A racing resolve may have linked this uid already.
                    if let Some(link) = snap
                        .get::<AccountLink>(Collection::AccountLinks, &uid)
                        .await?
                    {
                        return Ok(Txn::Abort(link.account_id));
                    }

                    let account: Option<Account> =
                        snap.get(Collection::Accounts, &account_id).await?;
                    let index: Option<PhoneIndex> =
                        snap.get(Collection::PhoneIndex, &phone).await?;

                    let account = match account {
                        Some(mut existing) => {
                            if !existing.member_uids.iter().any(|m| m == &uid) {
                                existing.member_uids.push(uid.to_string());
                            }
                            existing.updated_at = now;
                            existing
                        }
                        None => Account::new_free(Some(&phone), &uid, now),
                    };
                    batch.put(Collection::Accounts, &account_id, &account)?;

                    if index.is_none() {
                        // The paid seat stays unclaimed until a purchase.
                        batch.put(
                            Collection::PhoneIndex,
                            &phone,
                            &PhoneIndex {
                                account_id: account_id.clone(),
                                standard_owner_uid: None,
                                is_verified: true,
                                uid_last_seen: Some(uid.to_string()),
                                created_at: now,
                                updated_at: now,
                            },
                        )?;
                    }
                    batch.put(
                        Collection::AccountLinks,
                        &uid,
                        &AccountLink {
                            uid: uid.to_string(),
                            account_id: account_id.clone(),
                            linked_at: now,
                            reason: LinkReason::JitCreate,
                            previous_account_id: None,
                            merge_job_id: None,
                        },
                    )?;
                    batch.merge(
                        Collection::Users,
                        &uid,
                        json!({ "accountId": account_id, "phoneE164": phone, "updatedAt": now }),
                    );
                    Ok(Txn::Commit(account_id))
                }
                .boxed()
            })
            .await?;
        Ok(id)
    }

    /// Create a phoneless account under a random id. The account and the link
    /// are written in one transaction with the link's absence in the read set,
    /// so a racing duplicate conflicts and converges on retry.
    async fn jit_create_phoneless(&self, uid: &str, now: DateTime<Utc>) -> Result<String, CoreError> {
        let store = self.txn.store().clone();
        let uid = uid.to_string();
        let id = self
            .txn
            .run("resolver_jit_phoneless", |snap, batch| {
                let store = store.clone();
                let uid = uid.clone();
                async move {
                    if let Some(link) = snap
                        .get::<AccountLink>(Collection::AccountLinks, &uid)
                        .await?
                    {
                        return Ok(Txn::Abort(link.account_id));
                    }

                    let account_id = store.allocate_id();
                    batch.put(
                        Collection::Accounts,
                        &account_id,
                        &Account::new_free(None, &uid, now),
                    )?;
                    batch.put(
                        Collection::AccountLinks,
                        &uid,
                        &AccountLink {
                            uid: uid.to_string(),
                            account_id: account_id.clone(),
                            linked_at: now,
                            reason: LinkReason::JitCreate,
                            previous_account_id: None,
                            merge_job_id: None,
                        },
                    )?;
                    batch.merge(
                        Collection::Users,
                        &uid,
                        json!({ "accountId": account_id, "updatedAt": now }),
                    );
                    Ok(Txn::Commit(account_id))
                }
                .boxed()
            })
            .await?;
        Ok(id)
    }

    /// Best-effort backfill of denormalized fields. Skipped entirely when
    /// nothing would change, so repeated resolutions are write-free.
    #[allow(clippy::too_many_arguments)]
    async fn hydrate(
        &self,
        identity: &Identity,
        account_id: &str,
        profile: Option<&UserProfile>,
        account: Option<&Account>,
        resolved_phone: Option<&str>,
        providers: &[String],
        now: DateTime<Utc>,
    ) {
        let mut profile_fields = serde_json::Map::new();

        if profile.and_then(|p| p.account_id.as_deref()) != Some(account_id) {
            profile_fields.insert("accountId".to_string(), json!(account_id));
        }
        if let Some(phone) = resolved_phone {
            if profile.and_then(|p| p.phone_e164.as_deref()).is_none() {
                profile_fields.insert("phoneE164".to_string(), json!(phone));
            }
        }
        if let Some(email) = identity.email.as_deref() {
            if profile.and_then(|p| p.email.as_deref()).is_none() {
                profile_fields.insert("email".to_string(), json!(email));
            }
        }
        if let Some(name) = identity.display_name.as_deref() {
            if profile.and_then(|p| p.display_name.as_deref()).is_none() {
                profile_fields.insert("displayName".to_string(), json!(name));
            }
        }
        if profile.map(|p| p.providers.as_slice()) != Some(providers) {
            profile_fields.insert("providers".to_string(), json!(providers));
        }

        let mut ops = Vec::new();
        if !profile_fields.is_empty() {
            profile_fields.insert("updatedAt".to_string(), json!(now));
            ops.push(WriteOp::Merge {
                key: crate::store::DocKey::new(Collection::Users, &identity.uid),
                fields: serde_json::Value::Object(profile_fields),
            });
        }
        if let (Some(account), Some(phone)) = (account, resolved_phone) {
            if account.phone_e164.is_none() {
                ops.push(WriteOp::Merge {
                    key: crate::store::DocKey::new(Collection::Accounts, account_id),
                    fields: json!({ "phoneE164": phone, "updatedAt": now }),
                });
            }
        }

        if ops.is_empty() {
            return;
        }
        if let Err(err) = self.txn.store().apply(&ops).await {
            warn!(uid = %identity.uid, error = %err, "hydration write failed");
        }
    }
}

/// Profile providers plus the provider on the current claims, deduplicated,
/// original order preserved.
fn union_providers(profile: Option<&UserProfile>, provider: Option<&str>) -> Vec<String> {
    let mut providers: Vec<String> = profile.map(|p| p.providers.clone()).unwrap_or_default();
    if let Some(provider) = provider {
        if !providers.iter().any(|p| p == provider) {
            providers.push(provider.to_string());
        }
    }
    providers
}

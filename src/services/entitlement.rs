//! Entitlement Ledger.
//!
//! Binds verified purchase receipts to exactly one owning user. The ledger
//! entry is keyed by `provider:originalTransactionId` and first claim wins;
//! renewals update status and period but never the owner. Paid plans are
//! additionally gated by the phone seat lock: a phone number backs at most
//! one paying user at a time.

use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use serde_json::json;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::model::{
    Account, AccountLink, AppAccountToken, Entitlement, EntitlementStatus, PhoneIndex, UserProfile,
};
use crate::plans::{max_plan, plan_from_product_id, Plan};
use crate::store::{Collection, Transactor, Txn};

/// A purchase receipt after upstream signature verification. This core trusts
/// these fields completely.
#[derive(Debug, Clone)]
pub struct VerifiedReceipt {
    pub provider: String,
    pub original_transaction_id: String,
    pub product_id: Option<String>,
    pub app_account_token: Option<String>,
    pub environment: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl VerifiedReceipt {
    /// Subscription status implied by the receipt at `now`.
    fn status(&self, now: DateTime<Utc>) -> EntitlementStatus {
        if self.revoked_at.is_some() {
            EntitlementStatus::Revoked
        } else if self.expires_at.map_or(false, |end| end <= now) {
            EntitlementStatus::Expired
        } else {
            EntitlementStatus::Active
        }
    }
}

pub struct EntitlementLedger {
    txn: Transactor,
}

impl EntitlementLedger {
    pub fn new(txn: Transactor) -> Self {
        Self { txn }
    }

    /// Claim or refresh a receipt for `uid`.
    ///
    /// One transaction checks the link precondition, the app-account-token
    /// binding, the phone seat lock and the ledger owner, then writes the
    /// entitlement and syncs the derived plan onto the account and profile.
    pub async fn claim(
        &self,
        uid: &str,
        receipt: &VerifiedReceipt,
    ) -> Result<Entitlement, CoreError> {
        if receipt.provider.trim().is_empty() || receipt.original_transaction_id.trim().is_empty() {
            return Err(CoreError::Validation(
                "receipt is missing provider or transaction id".into(),
            ));
        }
        let now = Utc::now();
        let ledger_id =
            Entitlement::ledger_id(&receipt.provider, &receipt.original_transaction_id);
        let uid = uid.to_string();
        let receipt = receipt.clone();

        let outcome: Result<Entitlement, CoreError> = self
            .txn
            .run("entitlement_claim", |snap, batch| {
                let ledger_id = ledger_id.clone();
                let uid = uid.clone();
                let receipt = receipt.clone();
                async move {
                    // Subscriptions cannot attach to an unlinked identity.
                    let link: Option<AccountLink> =
                        snap.get(Collection::AccountLinks, &uid).await?;
                    let Some(link) = link else {
                        return Ok(Txn::Abort(Err(CoreError::PhoneLinkRequired)));
                    };

                    let profile: Option<UserProfile> = snap.get(Collection::Users, &uid).await?;

                    // Token binding check. A receipt carrying another device's
                    // app-account-token is a replay.
                    let mut token_binding: Option<(String, Option<AppAccountToken>)> = None;
                    if let Some(token) = receipt.app_account_token.as_deref() {
                        let existing: Option<AppAccountToken> =
                            snap.get(Collection::AppAccountTokens, token).await?;
                        if let Some(existing) = &existing {
                            if existing.uid != uid {
                                return Ok(Txn::Abort(Err(CoreError::TokenMismatch)));
                            }
                        }
                        if let Some(registered) =
                            profile.as_ref().and_then(|p| p.app_account_token.as_deref())
                        {
                            if registered != token {
                                return Ok(Txn::Abort(Err(CoreError::TokenMismatch)));
                            }
                        }
                        token_binding = Some((token.to_string(), existing));
                    }

                    // Phone seat lock: the standard owner is the only uid whose
                    // purchases count toward this phone's subscription.
                    let account: Option<Account> =
                        snap.get(Collection::Accounts, &link.account_id).await?;
                    let phone = account.as_ref().and_then(|a| a.phone_e164.clone());
                    let mut seat_claim: Option<(String, Option<PhoneIndex>)> = None;
                    if let Some(phone) = phone {
                        let index: Option<PhoneIndex> =
                            snap.get(Collection::PhoneIndex, &phone).await?;
                        match index.as_ref().and_then(|i| i.standard_owner_uid.as_deref()) {
                            Some(owner) if owner != uid => {
                                return Ok(Txn::Abort(Err(CoreError::EntitlementConflict)));
                            }
                            Some(_) => {}
                            None => seat_claim = Some((phone, index)),
                        }
                    }

                    // Ledger owner check: first claim wins, owner is immutable.
                    let existing: Option<Entitlement> =
                        snap.get(Collection::Entitlements, &ledger_id).await?;
                    if let Some(existing) = &existing {
                        if existing.owner_user_id != uid {
                            return Ok(Txn::Abort(Err(CoreError::EntitlementOwnedByAnother {
                                entitlement_id: ledger_id.clone(),
                            })));
                        }
                    }

                    let status = receipt.status(now);
                    let plan = plan_from_product_id(receipt.product_id.as_deref());
                    let entitlement = match existing {
                        Some(mut renewal) => {
                            renewal.status = status;
                            renewal.plan = plan;
                            renewal.product_id = receipt.product_id.clone();
                            renewal.current_period_end = receipt.expires_at;
                            renewal.app_account_token = receipt.app_account_token.clone();
                            renewal.environment = receipt.environment.clone();
                            renewal.owner_account_id = Some(link.account_id.clone());
                            renewal.updated_at = now;
                            renewal
                        }
                        None => Entitlement {
                            provider: receipt.provider.clone(),
                            provider_entitlement_id: receipt.original_transaction_id.clone(),
                            owner_user_id: uid.to_string(),
                            owner_account_id: Some(link.account_id.clone()),
                            product_id: receipt.product_id.clone(),
                            plan,
                            status,
                            current_period_end: receipt.expires_at,
                            app_account_token: receipt.app_account_token.clone(),
                            environment: receipt.environment.clone(),
                            created_at: now,
                            updated_at: now,
                        },
                    };

                    if let Some((token, existing_binding)) = token_binding {
                        batch.put(
                            Collection::AppAccountTokens,
                            &token,
                            &AppAccountToken {
                                uid: uid.to_string(),
                                account_id: Some(link.account_id.clone()),
                                original_transaction_id: Some(
                                    receipt.original_transaction_id.clone(),
                                ),
                                created_at: existing_binding
                                    .map(|b| b.created_at)
                                    .unwrap_or(now),
                                updated_at: now,
                            },
                        )?;
                        batch.merge(
                            Collection::Users,
                            &uid,
                            json!({ "appAccountToken": token, "updatedAt": now }),
                        );
                    }
                    if let Some((phone, index)) = seat_claim {
                        match index {
                            Some(_) => batch.merge(
                                Collection::PhoneIndex,
                                &phone,
                                json!({ "standardOwnerUid": uid, "updatedAt": now }),
                            ),
                            None => batch.put(
                                Collection::PhoneIndex,
                                &phone,
                                &PhoneIndex {
                                    account_id: link.account_id.clone(),
                                    standard_owner_uid: Some(uid.to_string()),
                                    is_verified: true,
                                    uid_last_seen: Some(uid.to_string()),
                                    created_at: now,
                                    updated_at: now,
                                },
                            )?,
                        }
                    }
                    batch.put(Collection::Entitlements, &ledger_id, &entitlement)?;

                    // Denormalized plan consumed by the Cost Guard fallback.
                    let effective = if entitlement.is_active(now) {
                        plan
                    } else {
                        Plan::Free
                    };
                    batch.merge(
                        Collection::Accounts,
                        &link.account_id,
                        json!({
                            "plan": effective,
                            "planExpiresAt": receipt.expires_at,
                            "updatedAt": now,
                        }),
                    );
                    batch.merge(
                        Collection::Users,
                        &uid,
                        json!({
                            "plan": effective,
                            "planExpiresAt": receipt.expires_at,
                            "updatedAt": now,
                        }),
                    );

                    Ok(Txn::Commit(Ok(entitlement)))
                }
                .boxed()
            })
            .await?;

        let entitlement = outcome?;
        info!(
            uid = %uid,
            entitlement_id = %ledger_id,
            plan = %entitlement.plan,
            status = ?entitlement.status,
            "entitlement claimed"
        );
        Ok(entitlement)
    }

    /// Highest-rank plan across the user's active entitlements. Display and
    /// reconciliation only; enforcement reads the denormalized plan.
    pub async fn effective_plan_for_user(&self, uid: &str) -> Result<Plan, CoreError> {
        let now = Utc::now();
        let docs = self
            .txn
            .store()
            .list_entitlements_by_owner(uid)
            .await
            .map_err(CoreError::from)?;
        let plans = docs.into_iter().filter_map(|doc| {
            match serde_json::from_value::<Entitlement>(doc) {
                Ok(entitlement) if entitlement.is_active(now) => Some(entitlement.plan),
                Ok(_) => None,
                Err(err) => {
                    warn!(uid = %uid, error = %err, "skipping malformed entitlement document");
                    None
                }
            }
        });
        Ok(max_plan(plans))
    }
}

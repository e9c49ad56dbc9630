//! Entitlement claiming, seat lock and ownership scenarios.

mod common;

use accord::error::CoreError;
use accord::model::{EntitlementStatus, PhoneIndex};
use accord::plans::Plan;
use accord::store::{fetch, Collection};
use chrono::{Duration, Utc};
use serde_json::json;

use common::{get, phone_identity, receipt, test_core, TestCore};

const PHONE_A: &str = "+819000000001";
const PHONE_B: &str = "+819000000002";

async fn linked_user(core: &TestCore, uid: &str, phone: &str) -> String {
    core.services
        .resolver
        .resolve(&phone_identity(uid, phone))
        .await
        .unwrap()
        .account_id
}

#[tokio::test]
async fn test_claim_requires_link() {
    let core = test_core();
    let err = core
        .services
        .entitlements
        .claim("nobody", &receipt("1000", "cnx.premium.monthly"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PhoneLinkRequired));
}

#[tokio::test]
async fn test_first_claim_wins() {
    let core = test_core();
    linked_user(&core, "u1", PHONE_A).await;
    linked_user(&core, "u2", PHONE_B).await;

    let entitlement = core
        .services
        .entitlements
        .claim("u1", &receipt("1000", "cnx.premium.monthly"))
        .await
        .unwrap();
    assert_eq!(entitlement.owner_user_id, "u1");
    assert_eq!(entitlement.plan, Plan::Premium);
    assert_eq!(entitlement.status, EntitlementStatus::Active);

    // u2's phone seat is free, but the purchase already belongs to u1.
    let err = core
        .services
        .entitlements
        .claim("u2", &receipt("1000", "cnx.premium.monthly"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, CoreError::EntitlementOwnedByAnother { ref entitlement_id } if entitlement_id == "apple:1000")
    );
}

#[tokio::test]
async fn test_phone_seat_lock() {
    let core = test_core();
    linked_user(&core, "u1", PHONE_A).await;
    // Second device on the same phone, same account.
    linked_user(&core, "u2", PHONE_A).await;

    core.services
        .entitlements
        .claim("u1", &receipt("1000", "cnx.premium.monthly"))
        .await
        .unwrap();

    let index: PhoneIndex = fetch(core.store.as_ref(), Collection::PhoneIndex, PHONE_A)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(index.standard_owner_uid.as_deref(), Some("u1"));

    // A different purchase by a co-resident uid still hits the seat lock.
    let err = core
        .services
        .entitlements
        .claim("u2", &receipt("2000", "cnx.premium.monthly"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::EntitlementConflict));

    // The seat holder renews freely; owner and creation time are unchanged.
    let first = core
        .services
        .entitlements
        .claim("u1", &receipt("1000", "cnx.premium.monthly"))
        .await
        .unwrap();
    let mut renewal_receipt = receipt("1000", "cnx.premium.monthly");
    renewal_receipt.expires_at = Some(Utc::now() + Duration::days(60));
    let renewed = core
        .services
        .entitlements
        .claim("u1", &renewal_receipt)
        .await
        .unwrap();
    assert_eq!(renewed.owner_user_id, "u1");
    assert_eq!(renewed.created_at, first.created_at);
    assert!(renewed.current_period_end.unwrap() > first.current_period_end.unwrap());
}

#[tokio::test]
async fn test_token_replay_rejected() {
    let core = test_core();
    linked_user(&core, "u1", PHONE_A).await;
    linked_user(&core, "u2", PHONE_B).await;

    let mut first = receipt("1000", "cnx.premium.monthly");
    first.app_account_token = Some("tok-1".to_string());
    core.services.entitlements.claim("u1", &first).await.unwrap();

    // u2 replays u1's device token on its own receipt.
    let mut replay = receipt("2000", "cnx.premium.monthly");
    replay.app_account_token = Some("tok-1".to_string());
    let err = core
        .services
        .entitlements
        .claim("u2", &replay)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TokenMismatch));

    // u1 presenting a different token than the one registered is also a
    // mismatch.
    let mut second_token = receipt("1000", "cnx.premium.monthly");
    second_token.app_account_token = Some("tok-2".to_string());
    let err = core
        .services
        .entitlements
        .claim("u1", &second_token)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TokenMismatch));
}

#[tokio::test]
async fn test_claim_syncs_plan_to_account_and_profile() {
    let core = test_core();
    let account_id = linked_user(&core, "u1", PHONE_A).await;

    core.services
        .entitlements
        .claim("u1", &receipt("1000", "cnx.premium.monthly"))
        .await
        .unwrap();

    let account = get(&core, Collection::Accounts, &account_id).await.unwrap();
    assert_eq!(account["plan"], json!("premium"));
    assert!(account.get("planExpiresAt").is_some());

    let profile = get(&core, Collection::Users, "u1").await.unwrap();
    assert_eq!(profile["plan"], json!("premium"));

    assert_eq!(
        core.services
            .entitlements
            .effective_plan_for_user("u1")
            .await
            .unwrap(),
        Plan::Premium
    );
}

#[tokio::test]
async fn test_expired_receipt_grants_no_plan() {
    let core = test_core();
    let account_id = linked_user(&core, "u1", PHONE_A).await;

    let mut expired = receipt("1000", "cnx.premium.monthly");
    expired.expires_at = Some(Utc::now() - Duration::days(1));
    let entitlement = core
        .services
        .entitlements
        .claim("u1", &expired)
        .await
        .unwrap();
    assert_eq!(entitlement.status, EntitlementStatus::Expired);

    let account = get(&core, Collection::Accounts, &account_id).await.unwrap();
    assert_eq!(account["plan"], json!("free"));
    assert_eq!(
        core.services
            .entitlements
            .effective_plan_for_user("u1")
            .await
            .unwrap(),
        Plan::Free
    );
}

#[tokio::test]
async fn test_revoked_receipt() {
    let core = test_core();
    linked_user(&core, "u1", PHONE_A).await;

    let mut revoked = receipt("1000", "cnx.premium.monthly");
    revoked.revoked_at = Some(Utc::now());
    let entitlement = core
        .services
        .entitlements
        .claim("u1", &revoked)
        .await
        .unwrap();
    assert_eq!(entitlement.status, EntitlementStatus::Revoked);
}

#[tokio::test]
async fn test_blank_receipt_rejected() {
    let core = test_core();
    linked_user(&core, "u1", PHONE_A).await;
    let mut blank = receipt("", "cnx.premium.monthly");
    blank.original_transaction_id = String::new();
    let err = core
        .services
        .entitlements
        .claim("u1", &blank)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

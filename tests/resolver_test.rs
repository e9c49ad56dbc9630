//! End-to-end account resolution scenarios.

mod common;

use accord::account_key::account_id_from_phone;
use accord::error::CoreError;
use accord::model::{AccountLink, LinkReason, PhoneIndex};
use accord::plans::Plan;
use accord::services::{PhoneGatedAction, Resolution};
use accord::store::{fetch, Collection};
use serde_json::json;
use tokio::sync::Barrier;

use common::{get, phone_identity, put, sns_identity, test_core};

const PHONE: &str = "+819000000001";

#[tokio::test]
async fn test_new_phone_user_creates_deterministic_account() {
    let core = test_core();
    let resolved = core
        .services
        .resolver
        .resolve(&phone_identity("u1", PHONE))
        .await
        .unwrap();

    assert_eq!(resolved.account_id, account_id_from_phone(PHONE).unwrap());
    assert_eq!(resolved.plan, Plan::Free);
    assert_eq!(resolved.resolution, Resolution::Created);

    let index: PhoneIndex = fetch(core.store.as_ref(), Collection::PhoneIndex, PHONE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(index.account_id, resolved.account_id);
    // The paid seat stays unclaimed until a purchase.
    assert!(index.standard_owner_uid.is_none());

    let link: AccountLink = fetch(core.store.as_ref(), Collection::AccountLinks, "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.account_id, resolved.account_id);
    assert_eq!(link.reason, LinkReason::JitCreate);
}

#[tokio::test]
async fn test_second_device_same_phone_converges() {
    let core = test_core();
    let first = core
        .services
        .resolver
        .resolve(&phone_identity("u1", PHONE))
        .await
        .unwrap();
    let second = core
        .services
        .resolver
        .resolve(&phone_identity("u2", PHONE))
        .await
        .unwrap();

    assert_eq!(first.account_id, second.account_id);
    assert_eq!(second.resolution, Resolution::Attached);
    assert_eq!(core.store.count(Collection::Accounts).await, 1);

    let account = get(&core, Collection::Accounts, &first.account_id)
        .await
        .unwrap();
    let members: Vec<&str> = account["memberUids"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(members.contains(&"u1"));
    assert!(members.contains(&"u2"));
}

#[tokio::test]
async fn test_repeated_resolve_is_write_free() {
    let core = test_core();
    let identity = phone_identity("u1", PHONE);
    let first = core.services.resolver.resolve(&identity).await.unwrap();

    let writes_after_first = core.store.write_op_count().await;
    let second = core.services.resolver.resolve(&identity).await.unwrap();

    assert_eq!(first.account_id, second.account_id);
    assert_eq!(second.resolution, Resolution::Linked);
    assert_eq!(core.store.write_op_count().await, writes_after_first);
}

#[tokio::test]
async fn test_phoneless_concurrent_first_logins_converge() {
    let core = test_core();
    let barrier = std::sync::Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let services = core.services.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            services
                .resolver
                .resolve(&sns_identity("u1", "google.com"))
                .await
                .unwrap()
        }));
    }
    let first = handles.remove(0).await.unwrap();
    let second = handles.remove(0).await.unwrap();

    assert_eq!(first.account_id, second.account_id);
    assert_eq!(core.store.count(Collection::Accounts).await, 1);
}

#[tokio::test]
async fn test_self_repair_recreates_link_from_profile() {
    let core = test_core();
    put(
        &core,
        Collection::Users,
        "u5",
        json!({ "uid": "u5", "accountId": "legacy-acc", "providers": ["google.com"] }),
    )
    .await;
    put(
        &core,
        Collection::Accounts,
        "legacy-acc",
        json!({ "plan": "free", "memberUids": ["u5"], "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z" }),
    )
    .await;

    let resolved = core
        .services
        .resolver
        .resolve(&sns_identity("u5", "google.com"))
        .await
        .unwrap();

    assert_eq!(resolved.account_id, "legacy-acc");
    assert_eq!(resolved.resolution, Resolution::Repaired);
    let link: AccountLink = fetch(core.store.as_ref(), Collection::AccountLinks, "u5")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.reason, LinkReason::Repair);
}

#[tokio::test]
async fn test_auto_attach_overrides_tentative_account() {
    let core = test_core();
    // u6 is linked to account A, but the phone index says the phone's
    // canonical account is B.
    let a = core
        .services
        .resolver
        .resolve(&sns_identity("u6", "google.com"))
        .await
        .unwrap();
    let b = core
        .services
        .resolver
        .resolve(&phone_identity("other", PHONE))
        .await
        .unwrap();
    assert_ne!(a.account_id, b.account_id);

    let resolved = core
        .services
        .resolver
        .resolve(&phone_identity("u6", PHONE))
        .await
        .unwrap();

    assert_eq!(resolved.account_id, b.account_id);
    assert_eq!(resolved.resolution, Resolution::Attached);
    let link: AccountLink = fetch(core.store.as_ref(), Collection::AccountLinks, "u6")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.reason, LinkReason::AutoAttach);
    assert_eq!(link.previous_account_id.as_deref(), Some(a.account_id.as_str()));
}

#[tokio::test]
async fn test_derived_flags() {
    let core = test_core();

    // Phone-auth user with no SNS provider linked.
    let phone_user = core
        .services
        .resolver
        .resolve(&phone_identity("u1", PHONE))
        .await
        .unwrap();
    assert!(!phone_user.needs_phone_verification);
    assert!(phone_user.needs_sns_login);
    assert!(phone_user.phone_required_for.is_empty());

    // Trusted SNS user without a phone.
    let sns_user = core
        .services
        .resolver
        .resolve(&sns_identity("u2", "google.com"))
        .await
        .unwrap();
    assert!(!sns_user.needs_phone_verification);
    assert!(!sns_user.needs_sns_login);
    assert_eq!(
        sns_user.phone_required_for,
        vec![
            PhoneGatedAction::SubscriptionRestore,
            PhoneGatedAction::AccountMerge
        ]
    );

    // Untrusted provider, no phone, no device token.
    let untrusted = core
        .services
        .resolver
        .resolve(&sns_identity("u3", "password"))
        .await
        .unwrap();
    assert!(untrusted.needs_phone_verification);
}

#[tokio::test]
async fn test_empty_uid_requires_authentication() {
    let core = test_core();
    let err = core
        .services
        .resolver
        .resolve(&phone_identity("  ", PHONE))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AuthenticationRequired));
}

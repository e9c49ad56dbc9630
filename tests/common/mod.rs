//! Shared helpers for the integration suites.
//!
//! Builds the full service stack over the in-memory store so every suite
//! exercises the same wiring an embedding host would construct at startup.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;

use accord::config::CoreConfig;
use accord::model::Account;
use accord::plans::Plan;
use accord::services::{CoreServices, Identity, VerifiedReceipt};
use accord::store::{Collection, DocKey, DocumentStore, MemoryStore, WriteOp};
use accord::tasks::InProcessTaskQueue;

pub struct TestCore {
    pub store: Arc<MemoryStore>,
    pub tasks: Arc<InProcessTaskQueue>,
    pub services: Arc<CoreServices>,
}

pub fn test_core() -> TestCore {
    let store = Arc::new(MemoryStore::new());
    let tasks = Arc::new(InProcessTaskQueue::new());
    let services = Arc::new(CoreServices::new(
        store.clone(),
        tasks.clone(),
        CoreConfig::for_test(),
    ));
    TestCore {
        store,
        tasks,
        services,
    }
}

pub fn phone_identity(uid: &str, phone: &str) -> Identity {
    Identity {
        uid: uid.to_string(),
        provider: Some("phone".to_string()),
        phone_number: Some(phone.to_string()),
        email: None,
        display_name: None,
    }
}

pub fn sns_identity(uid: &str, provider: &str) -> Identity {
    Identity {
        uid: uid.to_string(),
        provider: Some(provider.to_string()),
        phone_number: None,
        email: Some(format!("{uid}@example.com")),
        display_name: None,
    }
}

/// A verified premium receipt expiring a month out.
pub fn receipt(original_transaction_id: &str, product_id: &str) -> VerifiedReceipt {
    VerifiedReceipt {
        provider: "apple".to_string(),
        original_transaction_id: original_transaction_id.to_string(),
        product_id: Some(product_id.to_string()),
        app_account_token: None,
        environment: Some("production".to_string()),
        expires_at: Some(Utc::now() + Duration::days(30)),
        revoked_at: None,
    }
}

pub fn premium_account(primary_uid: &str) -> Account {
    let mut account = Account::new_free(None, primary_uid, Utc::now());
    account.plan = Plan::Premium;
    account
}

pub async fn put(core: &TestCore, collection: Collection, id: &str, value: Value) {
    core.store
        .apply(&[WriteOp::Put {
            key: DocKey::new(collection, id),
            value,
        }])
        .await
        .unwrap();
}

pub async fn get(core: &TestCore, collection: Collection, id: &str) -> Option<Value> {
    let (_, value) = core
        .store
        .get_raw(&DocKey::new(collection, id))
        .await
        .unwrap();
    value
}

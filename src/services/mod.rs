//! Service layer.
//!
//! Explicitly constructed, dependency-injected services with a process-wide
//! lifecycle: built once at startup from a store, a task queue and the loaded
//! configuration, then passed by reference to route handlers. No global
//! mutable state.

pub mod cost_guard;
pub mod entitlement;
pub mod merge;
pub mod resolver;

pub use cost_guard::{CostGuard, QuotaDenial, QuotaMode, ReserveOutcome, UsageReport};
pub use entitlement::{EntitlementLedger, VerifiedReceipt};
pub use merge::{MergeCoordinator, MergePlan};
pub use resolver::{AccountResolver, Identity, PhoneGatedAction, ResolvedAccount, Resolution};

use std::sync::Arc;

use crate::config::CoreConfig;
use crate::store::{DocumentStore, Transactor};
use crate::tasks::TaskQueue;

/// All core services, constructed once at startup.
pub struct CoreServices {
    pub resolver: AccountResolver,
    pub merge: MergeCoordinator,
    pub entitlements: EntitlementLedger,
    pub cost_guard: CostGuard,
}

impl CoreServices {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        tasks: Arc<dyn TaskQueue>,
        config: CoreConfig,
    ) -> Self {
        let txn = Transactor::new(store, config.retry.clone());
        Self {
            resolver: AccountResolver::new(txn.clone(), config.trust.clone()),
            merge: MergeCoordinator::new(txn.clone(), tasks, config.business.clone()),
            entitlements: EntitlementLedger::new(txn.clone()),
            cost_guard: CostGuard::new(txn, config.business),
        }
    }
}

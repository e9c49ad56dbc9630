//! Accord - account unification and entitlement core
//!
//! The identity, account-unification and entitlement-gating core of a
//! multi-tenant SaaS backend. Resolves every authenticated identity to its
//! canonical billing account, collapses logins that belong together (shared
//! phone number, device purchase token, explicit merge), and enforces
//! per-account monthly consumption quotas before billable features run.
//!
//! Transport, token verification and feature handlers live upstream; they
//! consume the services in [`services`] and hand us already-verified claims.

pub mod account_key;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod model;
pub mod plans;
pub mod services;
pub mod store;
pub mod tasks;

pub use config::CoreConfig;
pub use error::CoreError;
pub use services::CoreServices;

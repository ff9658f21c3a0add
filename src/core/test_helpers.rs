//! Shared test utilities for core module tests
//!
//! Only compiled in test mode.

use std::sync::Arc;
use std::sync::Mutex;

use crate::core::policy::{PolicySnapshot, PolicyStore};

/// Mutex for tests that mutate process environment variables.
///
/// Hold the guard for the whole test and restore the variables before
/// releasing it, otherwise parallel tests observe each other's state.
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// A store pre-populated with one user, one resource, and one allow rule:
/// alice (10.0.0.5) may reach db (10.0.0.9).
pub fn sample_store() -> Arc<PolicyStore> {
    let store = PolicyStore::new();
    store.add_user("alice", "10.0.0.5").unwrap();
    store.add_resource("db", "10.0.0.9").unwrap();
    store.add_allow_rule("alice", "db").unwrap();
    Arc::new(store)
}

/// Snapshot form of [`sample_store`]
#[allow(dead_code)]
pub fn sample_snapshot() -> PolicySnapshot {
    sample_store().snapshot()
}

//! The reconciliation cycle: read, diff, apply
//!
//! [`Reconciler`] drives the `IDLE → READING → DIFFING → APPLYING →
//! {CONVERGED, FAILED}` cycle that converges the kernel's enforced rules to
//! whatever the policy store currently declares. Cycles are serialized by
//! an internal tokio mutex: a caller arriving mid-cycle waits, then
//! reconciles against the *latest* policy snapshot, so a burst of edits
//! collapses into one cycle over the final state instead of replaying
//! stale intermediate states.
//!
//! Failures never leave hidden state: `Unavailable` aborts before any
//! mutation, and `PartialApply` reports the exact applied/failed split —
//! re-triggering is always safe because the next cycle diffs against a
//! fresh kernel listing.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::core::compile::{self, EnforcedRule};
use crate::core::enforcer::Enforcer;
use crate::core::error::EnforceError;
use crate::core::policy::PolicyStore;

/// Phases of one reconciliation cycle, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ReconcilePhase {
    #[strum(serialize = "idle")]
    Idle,
    #[strum(serialize = "reading")]
    Reading,
    #[strum(serialize = "diffing")]
    Diffing,
    #[strum(serialize = "applying")]
    Applying,
    #[strum(serialize = "converged")]
    Converged,
    #[strum(serialize = "failed")]
    Failed,
}

/// The minimal mutation batch that converges current onto target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    pub to_add: Vec<EnforcedRule>,
    pub to_remove: Vec<EnforcedRule>,
}

impl RuleDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Computes `target − current` and `current − target`, keyed by the full
/// rule tuple. A changed address shows up as one remove plus one add.
///
/// Both vectors come out in canonical (set) order, which puts every ALLOW
/// before the BASE_DENY — exactly the order the enforcer wants to insert
/// them in.
pub fn diff(current: &BTreeSet<EnforcedRule>, target: &BTreeSet<EnforcedRule>) -> RuleDiff {
    RuleDiff {
        to_add: target.difference(current).cloned().collect(),
        to_remove: current.difference(target).cloned().collect(),
    }
}

/// Outcome of one successful cycle
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    /// Correlates log lines and audit events of one cycle
    pub cycle_id: Uuid,
    /// Rules inserted this cycle (empty for a no-op cycle)
    pub added: Vec<EnforcedRule>,
    /// Rules removed this cycle
    pub removed: Vec<EnforcedRule>,
}

impl ReconcileReport {
    /// True when the kernel already matched the policy and nothing was done
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Orchestrates reconciliation cycles over a shared policy store and an
/// enforcer backend.
pub struct Reconciler<E: Enforcer> {
    store: Arc<PolicyStore>,
    enforcer: E,
    gate: tokio::sync::Mutex<()>,
}

impl<E: Enforcer> Reconciler<E> {
    pub fn new(store: Arc<PolicyStore>, enforcer: E) -> Self {
        Self {
            store,
            enforcer,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn enforcer(&self) -> &E {
        &self.enforcer
    }

    /// Runs one reconciliation cycle.
    ///
    /// At most one cycle runs at a time; queued callers re-read the policy
    /// at their turn. The engine never retries on its own — the caller
    /// decides whether a failed cycle is worth re-triggering.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the kernel state cannot be read or prepared (no
    /// mutation was attempted); `PartialApply` if some mutations landed and
    /// some did not, with the exact split.
    pub async fn reconcile(&self) -> Result<ReconcileReport, EnforceError> {
        let _serialized = self.gate.lock().await;

        let cycle_id = Uuid::new_v4();
        info!(%cycle_id, phase = %ReconcilePhase::Reading, "reconcile cycle start");
        let current = self.enforcer.list_enforced().await?;

        // Snapshot is taken after the gate is held: a caller that queued
        // behind a running cycle sees every edit made in the meantime.
        let snapshot = self.store.snapshot();
        let target = compile::compile(&snapshot);
        let delta = diff(&current, &target);
        info!(
            %cycle_id,
            phase = %ReconcilePhase::Diffing,
            current = current.len(),
            target = target.len(),
            to_add = delta.to_add.len(),
            to_remove = delta.to_remove.len(),
            "computed rule diff"
        );

        if delta.is_empty() {
            info!(%cycle_id, phase = %ReconcilePhase::Converged, "already converged, no-op");
            return Ok(ReconcileReport {
                cycle_id,
                added: Vec::new(),
                removed: Vec::new(),
            });
        }

        info!(%cycle_id, phase = %ReconcilePhase::Applying, "applying rule batch");
        self.enforcer
            .apply(&delta.to_add, &delta.to_remove)
            .await?;

        info!(%cycle_id, phase = %ReconcilePhase::Converged, "reconcile cycle complete");
        Ok(ReconcileReport {
            cycle_id,
            added: delta.to_add,
            removed: delta.to_remove,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enforcer::MemoryEnforcer;

    fn allow(src: &str, dst: &str) -> EnforcedRule {
        EnforcedRule::allow(src.parse().unwrap(), dst.parse().unwrap())
    }

    fn reconciler_with(store: PolicyStore) -> Reconciler<MemoryEnforcer> {
        Reconciler::new(Arc::new(store), MemoryEnforcer::new())
    }

    #[test]
    fn test_diff_correctness() {
        let a = allow("10.0.0.1/32", "10.0.0.9/32");
        let b = allow("10.0.0.2/32", "10.0.0.9/32");
        let c = allow("10.0.0.3/32", "10.0.0.9/32");

        let current = BTreeSet::from([a.clone(), b.clone()]);
        let target = BTreeSet::from([b, c.clone()]);

        let delta = diff(&current, &target);
        assert_eq!(delta.to_add, vec![c]);
        assert_eq!(delta.to_remove, vec![a]);
    }

    #[test]
    fn test_diff_orders_base_deny_last_in_adds() {
        let current = BTreeSet::new();
        let target = BTreeSet::from([
            EnforcedRule::base_deny(),
            allow("10.0.0.5/32", "10.0.0.9/32"),
        ]);

        let delta = diff(&current, &target);
        assert_eq!(delta.to_add.len(), 2);
        assert_eq!(
            delta.to_add.last().unwrap(),
            &EnforcedRule::base_deny(),
            "base deny must be inserted last"
        );
    }

    #[tokio::test]
    async fn test_reconcile_converges_and_second_run_is_noop() {
        let store = PolicyStore::new();
        store.add_user("alice", "10.0.0.5").unwrap();
        store.add_resource("db", "10.0.0.9").unwrap();
        store.add_allow_rule("alice", "db").unwrap();
        let reconciler = reconciler_with(store);

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.added.len(), 2); // allow + base deny
        assert!(report.removed.is_empty());

        // Unchanged policy: second cycle is a strict no-op
        let report = reconciler.reconcile().await.unwrap();
        assert!(report.is_noop());
    }

    #[tokio::test]
    async fn test_reconcile_unavailable_before_mutation() {
        let store = PolicyStore::new();
        store.add_user("alice", "10.0.0.5").unwrap();
        let reconciler = reconciler_with(store);
        reconciler.enforcer().set_unavailable(true);

        let err = reconciler.reconcile().await.unwrap_err();
        assert!(matches!(err, EnforceError::Unavailable(_)));

        reconciler.enforcer().set_unavailable(false);
        assert!(reconciler.enforcer().rules().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_removes_stale_rules() {
        let store = PolicyStore::new();
        store.add_user("alice", "10.0.0.5").unwrap();
        let reconciler = reconciler_with(store);

        // Leftovers from an older, wider policy
        let stale = allow("10.0.0.99/32", "10.0.0.9/32");
        reconciler.enforcer().seed([stale.clone(), EnforcedRule::base_deny()]);

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.removed, vec![stale]);
        assert_eq!(
            reconciler.enforcer().rules(),
            BTreeSet::from([EnforcedRule::base_deny()])
        );
    }

    #[tokio::test]
    async fn test_partial_apply_then_retry_computes_remaining_delta() {
        let store = PolicyStore::new();
        store.add_user("a", "10.0.0.1").unwrap();
        store.add_user("b", "10.0.0.2").unwrap();
        store.add_user("c", "10.0.0.3").unwrap();
        store.add_resource("db", "10.0.0.9").unwrap();
        store.add_allow_rule("a", "db").unwrap();
        store.add_allow_rule("b", "db").unwrap();
        store.add_allow_rule("c", "db").unwrap();
        let reconciler = reconciler_with(store);

        let doomed = allow("10.0.0.2/32", "10.0.0.9/32");
        reconciler.enforcer().fail_add_of(doomed.clone());

        let err = reconciler.reconcile().await.unwrap_err();
        let EnforceError::PartialApply { applied, failed } = err else {
            panic!("expected partial apply");
        };
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].rule, doomed);
        assert_eq!(applied.len(), 3); // two allows + base deny landed

        // Retry: the diff contains only the one missing rule
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.added, vec![doomed]);
        assert!(report.removed.is_empty());

        // And now we are converged
        assert!(reconciler.reconcile().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_concurrent_reconciles_serialize() {
        let store = PolicyStore::new();
        store.add_user("alice", "10.0.0.5").unwrap();
        store.add_resource("db", "10.0.0.9").unwrap();
        store.add_allow_rule("alice", "db").unwrap();
        let reconciler = Arc::new(reconciler_with(store));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let reconciler = Arc::clone(&reconciler);
            tasks.push(tokio::spawn(async move { reconciler.reconcile().await }));
        }

        let mut converged_with_changes = 0;
        for task in tasks {
            let report = task.await.unwrap().unwrap();
            if !report.is_noop() {
                converged_with_changes += 1;
            }
        }

        // Exactly one cycle did the work; the queued ones saw a converged
        // kernel and no-opped.
        assert_eq!(converged_with_changes, 1);
        assert_eq!(reconciler.enforcer().rules().len(), 2);
    }
}

//! Enforcer adapter contract and the in-memory backend
//!
//! The [`Enforcer`] trait is the seam between the reconciliation engine and
//! the host's packet filter. The production implementation is
//! [`crate::core::nft::NftEnforcer`]; [`MemoryEnforcer`] stands in for the
//! kernel in tests and dry runs.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::compile::EnforcedRule;
use crate::core::error::{AppliedOp, EnforceError, FailedOp, OpKind};

/// Report of a fully successful apply batch
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: Vec<AppliedOp>,
}

/// Adapter to the packet-filter subsystem.
///
/// Contract:
/// - `list_enforced` returns only rules carrying the rampart tag; rules the
///   host acquired some other way are invisible and untouchable.
/// - `apply` performs removals before insertions, best-effort per
///   operation. If any individual operation fails, the result is
///   [`EnforceError::PartialApply`] with the exact applied/failed split so
///   the caller can recompute the remaining delta instead of guessing.
#[allow(async_fn_in_trait)]
pub trait Enforcer: Send + Sync {
    /// Lists the rules currently enforced in the kernel that belong to
    /// this system.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the underlying tool cannot be queried.
    async fn list_enforced(&self) -> Result<BTreeSet<EnforcedRule>, EnforceError>;

    /// Applies a batch of mutations: `remove` first, then `add`.
    ///
    /// # Errors
    ///
    /// `Unavailable` if no mutation could be attempted at all;
    /// `PartialApply` if some operations took effect and some did not.
    async fn apply(
        &self,
        add: &[EnforcedRule],
        remove: &[EnforcedRule],
    ) -> Result<ApplyReport, EnforceError>;
}

/// In-memory enforcer for tests and `--dry-run` style usage.
///
/// Holds the "kernel" rule set in a mutex and supports injecting failures:
/// mark a rule with [`MemoryEnforcer::fail_add_of`] and the next attempt to
/// insert it fails once, producing a genuine partial apply.
#[derive(Debug, Default)]
pub struct MemoryEnforcer {
    rules: Mutex<BTreeSet<EnforcedRule>>,
    fail_adds: Mutex<BTreeSet<EnforcedRule>>,
    unavailable: AtomicBool,
}

impl MemoryEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates the enforced set, as if a previous run left rules behind
    pub fn seed(&self, rules: impl IntoIterator<Item = EnforcedRule>) {
        self.rules.lock().unwrap_or_else(std::sync::PoisonError::into_inner).extend(rules);
    }

    /// The next insertion of exactly this rule fails (one-shot)
    pub fn fail_add_of(&self, rule: EnforcedRule) {
        self.fail_adds.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(rule);
    }

    /// Makes `list_enforced` and `apply` report `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current enforced set, for assertions
    pub fn rules(&self) -> BTreeSet<EnforcedRule> {
        self.rules.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl Enforcer for MemoryEnforcer {
    async fn list_enforced(&self) -> Result<BTreeSet<EnforcedRule>, EnforceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EnforceError::Unavailable(
                "memory enforcer marked unavailable".into(),
            ));
        }
        Ok(self.rules())
    }

    async fn apply(
        &self,
        add: &[EnforcedRule],
        remove: &[EnforcedRule],
    ) -> Result<ApplyReport, EnforceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EnforceError::Unavailable(
                "memory enforcer marked unavailable".into(),
            ));
        }

        let mut applied = Vec::new();
        let mut failed = Vec::new();

        // Removals first, mirroring the kernel backend
        for rule in remove {
            if self.rules.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(rule) {
                applied.push(AppliedOp {
                    op: OpKind::Remove,
                    rule: rule.clone(),
                });
            } else {
                failed.push(FailedOp {
                    op: OpKind::Remove,
                    rule: rule.clone(),
                    reason: "rule not present".into(),
                });
            }
        }

        for rule in add {
            if self.fail_adds.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(rule) {
                failed.push(FailedOp {
                    op: OpKind::Add,
                    rule: rule.clone(),
                    reason: "injected failure".into(),
                });
                continue;
            }

            self.rules.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(rule.clone());
            applied.push(AppliedOp {
                op: OpKind::Add,
                rule: rule.clone(),
            });
        }

        if failed.is_empty() {
            Ok(ApplyReport { applied })
        } else {
            Err(EnforceError::PartialApply { applied, failed })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(src: &str, dst: &str) -> EnforcedRule {
        EnforcedRule::allow(src.parse().unwrap(), dst.parse().unwrap())
    }

    #[tokio::test]
    async fn test_apply_and_list() {
        let enforcer = MemoryEnforcer::new();
        let rule = allow("10.0.0.5/32", "10.0.0.9/32");

        let report = enforcer.apply(&[rule.clone()], &[]).await.unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(
            enforcer.list_enforced().await.unwrap(),
            BTreeSet::from([rule])
        );
    }

    #[tokio::test]
    async fn test_remove_before_insert() {
        let enforcer = MemoryEnforcer::new();
        let old = allow("10.0.0.5/32", "10.0.0.9/32");
        let new = allow("10.0.0.5/32", "10.0.0.10/32");
        enforcer.seed([old.clone()]);

        enforcer.apply(&[new.clone()], &[old]).await.unwrap();
        assert_eq!(enforcer.rules(), BTreeSet::from([new]));
    }

    #[tokio::test]
    async fn test_partial_apply_reports_exact_split() {
        let enforcer = MemoryEnforcer::new();
        let a = allow("10.0.0.1/32", "10.0.0.9/32");
        let b = allow("10.0.0.2/32", "10.0.0.9/32");
        let c = allow("10.0.0.3/32", "10.0.0.9/32");
        enforcer.fail_add_of(b.clone());

        let err = enforcer
            .apply(&[a.clone(), b.clone(), c.clone()], &[])
            .await
            .unwrap_err();

        let EnforceError::PartialApply { applied, failed } = err else {
            panic!("expected partial apply");
        };
        assert_eq!(applied.len(), 2);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].rule, b);
        // The failure did not abort the rest of the batch
        assert!(enforcer.rules().contains(&a));
        assert!(enforcer.rules().contains(&c));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let enforcer = MemoryEnforcer::new();
        enforcer.set_unavailable(true);

        assert!(matches!(
            enforcer.list_enforced().await,
            Err(EnforceError::Unavailable(_))
        ));
        assert!(matches!(
            enforcer.apply(&[], &[]).await,
            Err(EnforceError::Unavailable(_))
        ));
    }
}

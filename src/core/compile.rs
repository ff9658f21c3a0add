//! Compilation of a policy snapshot into the target enforced rule set
//!
//! [`compile`] is a pure function: identical snapshots always produce the
//! same rule set, which keeps the reconciler's diff stable and makes
//! repeated application idempotent. One ALLOW rule is emitted per allow
//! rule in the snapshot, resolved to an IP pair through the snapshot's own
//! user/resource collections, plus a single BASE_DENY whenever there is
//! anything to protect.

use std::collections::BTreeSet;
use std::fmt;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::policy::PolicySnapshot;

/// Marker prefix carried in the nftables comment of every rule rampart
/// owns. Rules without this prefix are never listed and never touched.
pub const TAG_PREFIX: &str = "rampart:";

/// Precedence of ALLOW rules. Lower values are evaluated first.
pub const ALLOW_PRECEDENCE: u16 = 10;

/// Precedence of the BASE_DENY rule. Must stay above every ALLOW rule so
/// that listed pairs are matched before the default deny.
pub const BASE_DENY_PRECEDENCE: u16 = 100;

/// The kind of a compiled, tool-level rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::AsRefStr,
)]
pub enum RuleKind {
    /// Permit traffic from one source to one destination
    #[strum(serialize = "allow")]
    Allow,
    /// Drop everything else traversing the managed chain
    #[strum(serialize = "base-deny")]
    BaseDeny,
}

/// A compiled rule as it exists (or should exist) in the kernel.
///
/// Identity is the full tuple `(precedence, kind, source, dest)`: a changed
/// address therefore diffs as one remove plus one add, never an in-place
/// edit, because the underlying tool has no update primitive. Precedence is
/// derived from the kind in the constructors, so rules read back from the
/// kernel compare equal to freshly compiled ones.
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct EnforcedRule {
    pub precedence: u16,
    pub kind: RuleKind,
    pub source: Option<IpNetwork>,
    pub dest: Option<IpNetwork>,
}

impl EnforcedRule {
    pub fn allow(source: IpNetwork, dest: IpNetwork) -> Self {
        Self {
            precedence: ALLOW_PRECEDENCE,
            kind: RuleKind::Allow,
            source: Some(source),
            dest: Some(dest),
        }
    }

    pub fn base_deny() -> Self {
        Self {
            precedence: BASE_DENY_PRECEDENCE,
            kind: RuleKind::BaseDeny,
            source: None,
            dest: None,
        }
    }

    /// The owning tag carried in the rule's nftables comment.
    ///
    /// The tag is the rule's identity on the wire: listing parses it back
    /// with [`EnforcedRule::from_tag`], so format and parser must stay in
    /// lockstep.
    pub fn tag(&self) -> String {
        match self.kind {
            RuleKind::Allow => {
                let src = self.source.map_or_else(String::new, |s| s.to_string());
                let dst = self.dest.map_or_else(String::new, |d| d.to_string());
                format!("{TAG_PREFIX}allow {src}->{dst}")
            }
            RuleKind::BaseDeny => format!("{TAG_PREFIX}base-deny"),
        }
    }

    /// Reconstructs a rule from an owning tag. Returns `None` for comments
    /// that do not carry the rampart prefix or do not parse, which callers
    /// treat as "not ours, leave alone".
    pub fn from_tag(comment: &str) -> Option<Self> {
        let rest = comment.strip_prefix(TAG_PREFIX)?;

        if rest == "base-deny" {
            return Some(Self::base_deny());
        }

        let pair = rest.strip_prefix("allow ")?;
        let (src, dst) = pair.split_once("->")?;
        let source: IpNetwork = src.parse().ok()?;
        let dest: IpNetwork = dst.parse().ok()?;
        Some(Self::allow(source, dest))
    }
}

impl fmt::Display for EnforcedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RuleKind::Allow => write!(
                f,
                "allow {} -> {}",
                self.source.map_or_else(|| "?".to_string(), |s| s.to_string()),
                self.dest.map_or_else(|| "?".to_string(), |d| d.to_string()),
            ),
            RuleKind::BaseDeny => write!(f, "base-deny"),
        }
    }
}

/// Compiles a policy snapshot into the target enforced rule set.
///
/// For every allow rule `(u, r)` the user's source address and the
/// resource's address are resolved through the snapshot itself; the store
/// guarantees both keys exist, so resolution cannot fail for a snapshot it
/// produced. A BASE_DENY is emitted whenever at least one user or resource
/// exists; an entirely empty snapshot compiles to an empty set (nothing to
/// protect, nothing to deny).
pub fn compile(snapshot: &PolicySnapshot) -> BTreeSet<EnforcedRule> {
    let mut target = BTreeSet::new();

    for rule in &snapshot.allow_rules {
        let (Some(user), Some(resource)) = (
            snapshot.users.get(&rule.username),
            snapshot.resources.get(&rule.resource_name),
        ) else {
            // Unreachable for store-produced snapshots; a hand-built
            // snapshot with a dangling key loses that rule loudly.
            warn!(
                username = %rule.username,
                resource = %rule.resource_name,
                "allow rule references missing entity, skipping"
            );
            continue;
        };

        target.insert(EnforcedRule::allow(user.source_ip, resource.resource_ip));
    }

    if !snapshot.users.is_empty() || !snapshot.resources.is_empty() {
        target.insert(EnforcedRule::base_deny());
    }

    debug_assert!(
        target
            .iter()
            .filter(|r| r.kind == RuleKind::Allow)
            .all(|r| r.precedence < BASE_DENY_PRECEDENCE),
        "allow rules must sort before the base deny"
    );

    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::PolicyStore;

    fn snapshot_with(pairs: &[(&str, &str)]) -> PolicySnapshot {
        let store = PolicyStore::new();
        store.add_user("alice", "10.0.0.5").unwrap();
        store.add_user("bob", "10.0.0.6").unwrap();
        store.add_resource("db", "10.0.0.9").unwrap();
        store.add_resource("web", "10.0.0.10").unwrap();
        for (u, r) in pairs {
            store.add_allow_rule(u, r).unwrap();
        }
        store.snapshot()
    }

    #[test]
    fn test_empty_snapshot_compiles_to_nothing() {
        let target = compile(&PolicySnapshot::default());
        assert!(target.is_empty());
    }

    #[test]
    fn test_base_deny_present_with_any_entity() {
        let store = PolicyStore::new();
        store.add_user("alice", "10.0.0.5").unwrap();

        let target = compile(&store.snapshot());
        assert_eq!(target.len(), 1);
        assert_eq!(target.iter().next().unwrap().kind, RuleKind::BaseDeny);
    }

    #[test]
    fn test_allow_rules_resolve_to_ip_pairs() {
        let target = compile(&snapshot_with(&[("alice", "db"), ("bob", "web")]));

        let allows: Vec<_> = target
            .iter()
            .filter(|r| r.kind == RuleKind::Allow)
            .collect();
        assert_eq!(allows.len(), 2);
        assert!(target.contains(&EnforcedRule::allow(
            "10.0.0.5/32".parse().unwrap(),
            "10.0.0.9/32".parse().unwrap()
        )));
        assert!(target.contains(&EnforcedRule::allow(
            "10.0.0.6/32".parse().unwrap(),
            "10.0.0.10/32".parse().unwrap()
        )));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let snapshot = snapshot_with(&[("alice", "db"), ("bob", "db"), ("alice", "web")]);
        assert_eq!(compile(&snapshot), compile(&snapshot));
    }

    #[test]
    fn test_allow_rules_order_before_base_deny() {
        let target = compile(&snapshot_with(&[("alice", "db")]));
        let rules: Vec<_> = target.into_iter().collect();

        assert_eq!(rules.first().unwrap().kind, RuleKind::Allow);
        assert_eq!(rules.last().unwrap().kind, RuleKind::BaseDeny);
        assert!(rules.first().unwrap().precedence < rules.last().unwrap().precedence);
    }

    #[test]
    fn test_tag_round_trip() {
        let allow = EnforcedRule::allow(
            "10.0.0.5/32".parse().unwrap(),
            "10.0.0.9/32".parse().unwrap(),
        );
        assert_eq!(EnforcedRule::from_tag(&allow.tag()), Some(allow.clone()));
        assert_eq!(allow.tag(), "rampart:allow 10.0.0.5/32->10.0.0.9/32");

        let deny = EnforcedRule::base_deny();
        assert_eq!(EnforcedRule::from_tag(&deny.tag()), Some(deny));
    }

    #[test]
    fn test_foreign_comments_are_not_ours() {
        assert_eq!(EnforcedRule::from_tag("allow ssh"), None);
        assert_eq!(EnforcedRule::from_tag("rampart:allow garbage"), None);
        assert_eq!(EnforcedRule::from_tag(""), None);
    }

    #[test]
    fn test_ipv6_tag_round_trip() {
        let allow = EnforcedRule::allow(
            "2001:db8::1/128".parse().unwrap(),
            "2001:db8::2/128".parse().unwrap(),
        );
        assert_eq!(EnforcedRule::from_tag(&allow.tag()), Some(allow));
    }
}

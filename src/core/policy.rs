//! Declared policy state: users, resources, and allow rules
//!
//! [`PolicyStore`] owns the relational policy document in memory and is the
//! only place it can be mutated. Every mutation validates key uniqueness and
//! referential integrity inside one critical section, so interleaved editors
//! can never produce a dangling allow rule. Reads go through [`PolicyStore::snapshot`],
//! which hands out an immutable point-in-time copy.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Mutex;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::core::error::{EntityKind, PolicyError};

/// Maximum length of a username or resource name.
///
/// Keeps entries on one line of the policy document and within reasonable
/// display widths.
pub const MAX_NAME_LEN: usize = 64;

/// An identity bound to a source address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct User {
    pub username: String,
    pub source_ip: IpNetwork,
}

/// A named network endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Resource {
    pub resource_name: String,
    pub resource_ip: IpNetwork,
}

/// A pairwise permission: the named user may reach the named resource.
///
/// Both fields are foreign keys into the user and resource collections.
/// The pair is unique within a policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct AllowRule {
    pub username: String,
    pub resource_name: String,
}

impl AllowRule {
    pub fn new(username: impl Into<String>, resource_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            resource_name: resource_name.into(),
        }
    }
}

/// Immutable point-in-time view of the declared policy.
///
/// A fresh snapshot is built for every reconciliation cycle, giving the
/// reconciler a stable view even while editors keep mutating the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub users: BTreeMap<String, User>,
    pub resources: BTreeMap<String, Resource>,
    pub allow_rules: BTreeSet<AllowRule>,
}

impl PolicySnapshot {
    /// True when the policy declares nothing at all
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.resources.is_empty() && self.allow_rules.is_empty()
    }
}

/// Validates a username or resource name for document-format safety.
///
/// Constraints mirror the persisted format: one entry per line, fields
/// separated by commas, section headers in brackets. Rejecting commas,
/// brackets, and control characters here means serialization can never
/// produce an ambiguous document.
pub fn validate_name(kind: EntityKind, name: &str) -> Result<(), PolicyError> {
    if name.is_empty() {
        return Err(PolicyError::InvalidName {
            kind,
            key: name.to_string(),
            reason: "name cannot be empty".into(),
        });
    }

    if name.len() > MAX_NAME_LEN {
        return Err(PolicyError::InvalidName {
            kind,
            key: name.to_string(),
            reason: format!("name too long (max {MAX_NAME_LEN} chars)"),
        });
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
    {
        return Err(PolicyError::InvalidName {
            kind,
            key: name.to_string(),
            reason: "name contains invalid characters (use a-z, 0-9, _, -, ., @)".into(),
        });
    }

    Ok(())
}

fn parse_address(input: &str) -> Result<IpNetwork, PolicyError> {
    IpNetwork::from_str(input.trim()).map_err(|e| PolicyError::InvalidAddress {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// The single owned instance of the declared policy.
///
/// All mutation methods take `&self` and serialize internally, so the store
/// can be shared (`Arc<PolicyStore>`) between edit intake and the
/// reconciler without editors ever blocking on a running reconciliation.
#[derive(Debug, Default)]
pub struct PolicyStore {
    inner: Mutex<PolicySnapshot>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a store from a previously persisted snapshot.
    ///
    /// The snapshot is trusted to be internally consistent; the document
    /// loader validates referential integrity before handing one over.
    pub fn from_snapshot(snapshot: PolicySnapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }

    /// Returns an immutable point-in-time copy of the policy. Never fails.
    pub fn snapshot(&self) -> PolicySnapshot {
        self.lock().clone()
    }

    /// Adds a user with the given source address.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if the username is taken, `InvalidAddress` if
    /// `source_ip` does not parse as an IP address or CIDR.
    pub fn add_user(&self, username: &str, source_ip: &str) -> Result<User, PolicyError> {
        validate_name(EntityKind::User, username)?;
        let source_ip = parse_address(source_ip)?;

        let mut doc = self.lock();
        if doc.users.contains_key(username) {
            return Err(PolicyError::DuplicateKey {
                kind: EntityKind::User,
                key: username.to_string(),
            });
        }

        let user = User {
            username: username.to_string(),
            source_ip,
        };
        doc.users.insert(username.to_string(), user.clone());
        Ok(user)
    }

    /// Deletes a user.
    ///
    /// The referential check runs inside the same critical section as the
    /// removal: a concurrent `add_allow_rule` can never slip between the
    /// check and the delete.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `ReferentialConflict` while any allow rule
    /// still references the username.
    pub fn delete_user(&self, username: &str) -> Result<User, PolicyError> {
        let mut doc = self.lock();
        if !doc.users.contains_key(username) {
            return Err(PolicyError::NotFound {
                kind: EntityKind::User,
                key: username.to_string(),
            });
        }

        let references = doc
            .allow_rules
            .iter()
            .filter(|r| r.username == username)
            .count();
        if references > 0 {
            return Err(PolicyError::ReferentialConflict {
                kind: EntityKind::User,
                key: username.to_string(),
                count: references,
            });
        }

        doc.users
            .remove(username)
            .ok_or_else(|| PolicyError::NotFound {
                kind: EntityKind::User,
                key: username.to_string(),
            })
    }

    /// Adds a resource with the given destination address.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if the name is taken, `InvalidAddress` if
    /// `resource_ip` does not parse.
    pub fn add_resource(
        &self,
        resource_name: &str,
        resource_ip: &str,
    ) -> Result<Resource, PolicyError> {
        validate_name(EntityKind::Resource, resource_name)?;
        let resource_ip = parse_address(resource_ip)?;

        let mut doc = self.lock();
        if doc.resources.contains_key(resource_name) {
            return Err(PolicyError::DuplicateKey {
                kind: EntityKind::Resource,
                key: resource_name.to_string(),
            });
        }

        let resource = Resource {
            resource_name: resource_name.to_string(),
            resource_ip,
        };
        doc.resources
            .insert(resource_name.to_string(), resource.clone());
        Ok(resource)
    }

    /// Deletes a resource. Same guards as [`PolicyStore::delete_user`].
    pub fn delete_resource(&self, resource_name: &str) -> Result<Resource, PolicyError> {
        let mut doc = self.lock();
        if !doc.resources.contains_key(resource_name) {
            return Err(PolicyError::NotFound {
                kind: EntityKind::Resource,
                key: resource_name.to_string(),
            });
        }

        let references = doc
            .allow_rules
            .iter()
            .filter(|r| r.resource_name == resource_name)
            .count();
        if references > 0 {
            return Err(PolicyError::ReferentialConflict {
                kind: EntityKind::Resource,
                key: resource_name.to_string(),
                count: references,
            });
        }

        doc.resources
            .remove(resource_name)
            .ok_or_else(|| PolicyError::NotFound {
                kind: EntityKind::Resource,
                key: resource_name.to_string(),
            })
    }

    /// Adds an allow rule for an existing user/resource pair.
    ///
    /// # Errors
    ///
    /// `NotFound` if either key is absent, `DuplicateKey` if the exact
    /// pair already exists.
    pub fn add_allow_rule(
        &self,
        username: &str,
        resource_name: &str,
    ) -> Result<AllowRule, PolicyError> {
        let mut doc = self.lock();
        if !doc.users.contains_key(username) {
            return Err(PolicyError::NotFound {
                kind: EntityKind::User,
                key: username.to_string(),
            });
        }
        if !doc.resources.contains_key(resource_name) {
            return Err(PolicyError::NotFound {
                kind: EntityKind::Resource,
                key: resource_name.to_string(),
            });
        }

        let rule = AllowRule::new(username, resource_name);
        if !doc.allow_rules.insert(rule.clone()) {
            return Err(PolicyError::DuplicateKey {
                kind: EntityKind::AllowRule,
                key: format!("{username},{resource_name}"),
            });
        }
        Ok(rule)
    }

    /// Removes an allow rule.
    ///
    /// # Errors
    ///
    /// `NotFound` if the pair is absent.
    pub fn delete_allow_rule(
        &self,
        username: &str,
        resource_name: &str,
    ) -> Result<AllowRule, PolicyError> {
        let mut doc = self.lock();
        let rule = AllowRule::new(username, resource_name);
        if !doc.allow_rules.remove(&rule) {
            return Err(PolicyError::NotFound {
                kind: EntityKind::AllowRule,
                key: format!("{username},{resource_name}"),
            });
        }
        Ok(rule)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PolicySnapshot> {
        // A poisoned mutex means a panic mid-mutation; the document is a
        // plain data structure, so the last consistent state is still usable.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

//! Core policy reconciliation functionality
//!
//! This module contains the types and logic that converge the kernel's
//! packet-filter rules onto the declared access policy:
//!
//! - [`policy`]: The relational policy model (users, resources, allow rules)
//! - [`document`]: The persisted on-disk policy document
//! - [`compile`]: Pure compilation of a policy snapshot into target rules
//! - [`enforcer`]: The packet-filter adapter contract and in-memory backend
//! - [`nft`]: The nftables backend
//! - [`reconcile`]: The read → diff → apply cycle
//! - [`error`]: Error types for policy and enforcement operations

pub mod compile;
pub mod document;
pub mod enforcer;
pub mod error;
pub mod nft;
pub mod policy;
pub mod reconcile;

#[cfg(test)]
pub mod test_helpers;

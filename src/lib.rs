//! Rampart - declarative user→resource firewall policy
//!
//! Rampart keeps the kernel's packet filter converged onto a small
//! relational access policy: users (VPN clients), resources (protected
//! hosts), and allow rules pairing them. Everything not explicitly allowed
//! is denied.
//!
//! # Architecture
//!
//! - [`core`] - Policy model, rule compilation, nftables interaction, and
//!   the reconciliation cycle
//! - [`identity`] - VPN lease file parsing for user candidates
//! - [`audit`] - Audit logging of edits and reconcile cycles
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Controlled privilege escalation for nft
//! - [`utils`] - XDG directory helpers
//!
//! # Safety Features
//!
//! - Only rampart-tagged rules are ever listed or mutated
//! - Removals are applied before insertions
//! - Partial failures report the exact applied/failed split
//! - Atomic document writes with SHA-256 sidecar checksums

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod identity;
pub mod utils;

// Re-export commonly used types
pub use core::error::{EnforceError, Error, PolicyError, Result};
pub use core::policy::{AllowRule, PolicySnapshot, PolicyStore, Resource, User};
pub use core::reconcile::{ReconcileReport, Reconciler};

use thiserror::Error;

use crate::core::compile::EnforcedRule;

/// Entity kinds referenced by policy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum EntityKind {
    #[strum(serialize = "user")]
    User,
    #[strum(serialize = "resource")]
    Resource,
    #[strum(serialize = "allow rule")]
    AllowRule,
}

/// Validation errors local to the policy store.
///
/// All variants are recoverable: the store is left unchanged and the error
/// is reported to the editor verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// An entity with this key already exists
    #[error("{kind} '{key}' already exists")]
    DuplicateKey { kind: EntityKind, key: String },

    /// No entity with this key exists
    #[error("{kind} '{key}' not found")]
    NotFound { kind: EntityKind, key: String },

    /// The supplied address does not parse as an IP address or CIDR
    #[error("invalid address '{input}': {reason}")]
    InvalidAddress { input: String, reason: String },

    /// The entity is still referenced by one or more allow rules
    #[error("{kind} '{key}' is referenced by {count} allow rule(s); delete those first")]
    ReferentialConflict {
        kind: EntityKind,
        key: String,
        count: usize,
    },

    /// A key is empty or contains characters unsafe for the document format
    #[error("invalid {kind} name '{key}': {reason}")]
    InvalidName {
        kind: EntityKind,
        key: String,
        reason: String,
    },
}

/// The kind of mutation the enforcer performs against the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum OpKind {
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "remove")]
    Remove,
}

/// A single enforcement operation that did take effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOp {
    pub op: OpKind,
    pub rule: EnforcedRule,
}

/// A single enforcement operation that did not take effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOp {
    pub op: OpKind,
    pub rule: EnforcedRule,
    pub reason: String,
}

/// Errors from the enforcement layer
#[derive(Debug, Error)]
pub enum EnforceError {
    /// The packet filter cannot be queried or invoked at all.
    /// No kernel mutation was attempted; safe to retry.
    #[error("enforcement unavailable: {0}")]
    Unavailable(String),

    /// Some operations took effect before a failure. The applied/failed
    /// split is exact so a retry can compute the remaining delta instead of
    /// re-applying succeeded rules.
    #[error("partial apply: {} applied, {} failed", applied.len(), failed.len())]
    PartialApply {
        applied: Vec<AppliedOp>,
        failed: Vec<FailedOp>,
    },

    /// nft invocation failed outright
    #[error("nftables error: {message}")]
    Nft {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// I/O while talking to the nft process
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON from nft
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level error for rampart operations
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Enforce(#[from] EnforceError),

    #[error(transparent)]
    Document(#[from] crate::core::document::DocumentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Represents a translated enforcement error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of nftables error patterns and their translations
pub struct NftErrorPattern;

impl NftErrorPattern {
    /// Matches an nft error message against known patterns and returns a
    /// user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root, or ensure sudo/run0/pkexec is configured")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Missing nftables
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install nftables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S nftables  (Arch)");
        }

        // Syntax errors
        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("Invalid firewall rule syntax")
                .with_suggestion("Check user and resource addresses for typos")
                .with_suggestion("Ensure IP addresses and network masks are valid");
        }

        // Table doesn't exist
        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Firewall table does not exist")
                .with_suggestion("The 'rampart' table may not have been created yet")
                .with_suggestion("Run 'rampart reconcile' to create it");
        }

        // Resource busy
        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion("Wait a moment and try again");
        }

        // Netlink errors
        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Verify nftables is working: sudo nft list ruleset")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_nft_translation() {
        let translation = NftErrorPattern::match_error("command not found: nft");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3); // Multiple distro options
    }

    #[test]
    fn test_permission_translation() {
        let translation = NftErrorPattern::match_error("Operation not permitted");
        assert!(translation.user_message.contains("permissions"));
    }

    #[test]
    fn test_missing_table_translation() {
        let translation = NftErrorPattern::match_error("Error: table 'rampart' does not exist");
        assert!(translation.user_message.contains("table"));
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("reconcile"))
        );
    }

    #[test]
    fn test_policy_error_display() {
        let err = PolicyError::ReferentialConflict {
            kind: EntityKind::User,
            key: "alice".into(),
            count: 2,
        };
        assert_eq!(
            err.to_string(),
            "user 'alice' is referenced by 2 allow rule(s); delete those first"
        );
    }
}

//! The persisted policy document
//!
//! The on-disk format is the original three-section layout, kept for
//! compatibility with existing documents: bracketed section headers
//! `[users]`, `[resources]`, `[allow_rules]`, one comma-separated tuple per
//! line, blank line between sections.
//!
//! Unlike the unchecked original, loading validates everything the store
//! would: duplicate keys, unparseable addresses, and allow rules whose
//! keys don't resolve are reported as errors with a line number instead of
//! being carried silently into enforcement.

use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::{info, warn};

use crate::core::policy::{AllowRule, PolicySnapshot, Resource, User};
use crate::utils::get_data_dir;

/// Default filename of the policy document inside the data dir
pub const DOCUMENT_FILENAME: &str = "policy.txt";

/// Error type for document operations
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("allow rule '{username},{resource_name}' references a missing {missing}")]
    DanglingReference {
        username: String,
        resource_name: String,
        missing: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data directory not available")]
    DataDirUnavailable,
}

/// Returns the default document path inside the XDG data dir
pub fn default_path() -> Result<PathBuf, DocumentError> {
    let mut path = get_data_dir().ok_or(DocumentError::DataDirUnavailable)?;
    path.push(DOCUMENT_FILENAME);
    Ok(path)
}

/// Appends a suffix to the file name, keeping whatever extension the
/// configured path has (or none): `policy.txt` + `.tmp` = `policy.txt.tmp`,
/// `policy` + `.sha256` = `policy.sha256`.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(std::ffi::OsString::new, std::borrow::ToOwned::to_owned);
    name.push(suffix);
    path.with_file_name(name)
}

fn open_lock_file(path: &Path) -> Result<File, DocumentError> {
    let lock_path = with_suffix(path, ".lock");

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        Ok(std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(lock_path)?)
    }

    #[cfg(not(unix))]
    {
        Ok(std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }
}

/// Takes the exclusive editor lock for a policy document, blocking until
/// the current holder releases.
///
/// The lock is an advisory flock on a sidecar file next to the document
/// and must be held across the whole load → edit → save → enforce span.
/// It is what serializes concurrent invocations against the same
/// document: without it a second editor would load the pre-edit state and
/// its save would silently overwrite the first editor's accepted edit.
/// The lock is released when the returned guard drops (or the process
/// exits).
pub fn lock_exclusive(path: &Path) -> Result<Flock<File>, DocumentError> {
    Flock::lock(open_lock_file(path)?, FlockArg::LockExclusive)
        .map_err(|(_, errno)| DocumentError::Io(std::io::Error::from_raw_os_error(errno as i32)))
}

/// Nonblocking variant of [`lock_exclusive`]: `None` when another
/// invocation currently holds the lock.
pub fn try_lock_exclusive(path: &Path) -> Result<Option<Flock<File>>, DocumentError> {
    match Flock::lock(open_lock_file(path)?, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(Some(lock)),
        Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
        Err((_, errno)) => Err(DocumentError::Io(std::io::Error::from_raw_os_error(
            errno as i32,
        ))),
    }
}

/// Serializes a snapshot into the sectioned text format.
///
/// Deterministic: entries come out in key order, so saving an unchanged
/// policy produces a byte-identical document.
pub fn serialize(snapshot: &PolicySnapshot) -> String {
    use std::fmt::Write;

    let mut out = String::new();

    let _ = writeln!(out, "[users]");
    for user in snapshot.users.values() {
        let _ = writeln!(out, "{},{}", user.username, user.source_ip);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "[resources]");
    for resource in snapshot.resources.values() {
        let _ = writeln!(out, "{},{}", resource.resource_name, resource.resource_ip);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "[allow_rules]");
    for rule in &snapshot.allow_rules {
        let _ = writeln!(out, "{},{}", rule.username, rule.resource_name);
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Users,
    Resources,
    AllowRules,
}

/// Parses the sectioned text format into a validated snapshot.
///
/// # Errors
///
/// `Parse` for malformed lines, duplicate keys, or bad addresses;
/// `DanglingReference` when an allow rule names a user or resource the
/// document does not declare.
pub fn parse(text: &str) -> Result<PolicySnapshot, DocumentError> {
    let mut snapshot = PolicySnapshot::default();
    let mut section = Section::None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line {
            "[users]" => {
                section = Section::Users;
                continue;
            }
            "[resources]" => {
                section = Section::Resources;
                continue;
            }
            "[allow_rules]" => {
                section = Section::AllowRules;
                continue;
            }
            _ if line.starts_with('[') => {
                return Err(DocumentError::Parse {
                    line: line_no,
                    message: format!("unknown section header '{line}'"),
                });
            }
            _ => {}
        }

        let Some((first, second)) = line.split_once(',') else {
            return Err(DocumentError::Parse {
                line: line_no,
                message: format!("expected 'key,value', got '{line}'"),
            });
        };
        let (first, second) = (first.trim(), second.trim());

        match section {
            Section::None => {
                return Err(DocumentError::Parse {
                    line: line_no,
                    message: "entry before any section header".into(),
                });
            }
            Section::Users => {
                let source_ip = second.parse().map_err(|e| DocumentError::Parse {
                    line: line_no,
                    message: format!("invalid address '{second}': {e}"),
                })?;
                let previous = snapshot.users.insert(
                    first.to_string(),
                    User {
                        username: first.to_string(),
                        source_ip,
                    },
                );
                if previous.is_some() {
                    return Err(DocumentError::Parse {
                        line: line_no,
                        message: format!("duplicate user '{first}'"),
                    });
                }
            }
            Section::Resources => {
                let resource_ip = second.parse().map_err(|e| DocumentError::Parse {
                    line: line_no,
                    message: format!("invalid address '{second}': {e}"),
                })?;
                let previous = snapshot.resources.insert(
                    first.to_string(),
                    Resource {
                        resource_name: first.to_string(),
                        resource_ip,
                    },
                );
                if previous.is_some() {
                    return Err(DocumentError::Parse {
                        line: line_no,
                        message: format!("duplicate resource '{first}'"),
                    });
                }
            }
            Section::AllowRules => {
                if !snapshot.allow_rules.insert(AllowRule::new(first, second)) {
                    return Err(DocumentError::Parse {
                        line: line_no,
                        message: format!("duplicate allow rule '{first},{second}'"),
                    });
                }
            }
        }
    }

    // Referential integrity: a hand-edited document with dangling keys is
    // an immediate error here, not a latent hole in enforcement.
    for rule in &snapshot.allow_rules {
        if !snapshot.users.contains_key(&rule.username) {
            return Err(DocumentError::DanglingReference {
                username: rule.username.clone(),
                resource_name: rule.resource_name.clone(),
                missing: "user",
            });
        }
        if !snapshot.resources.contains_key(&rule.resource_name) {
            return Err(DocumentError::DanglingReference {
                username: rule.username.clone(),
                resource_name: rule.resource_name.clone(),
                missing: "resource",
            });
        }
    }

    Ok(snapshot)
}

/// Loads the policy document from disk.
///
/// A missing file is a first run and loads as an empty policy. A checksum
/// sidecar, when present, is verified but only warns on mismatch — the
/// document may have been hand-edited, which is legitimate.
pub async fn load(path: &Path) -> Result<PolicySnapshot, DocumentError> {
    if !tokio::fs::try_exists(path).await? {
        info!(?path, "no policy document yet, starting empty");
        return Ok(PolicySnapshot::default());
    }

    let text = tokio::fs::read_to_string(path).await?;

    let checksum_path = with_suffix(path, ".sha256");
    if let Ok(expected) = tokio::fs::read_to_string(&checksum_path).await {
        let actual = checksum(&text);
        if expected.trim() != actual {
            warn!(
                ?path,
                expected = expected.trim(),
                actual,
                "policy document checksum mismatch (hand-edited?)"
            );
        }
    }

    parse(&text)
}

/// Saves the policy document atomically: write to a temp file with 0o600
/// permissions, fsync, rename over the target, then refresh the checksum
/// sidecar.
pub async fn save(path: &Path, snapshot: &PolicySnapshot) -> Result<(), DocumentError> {
    let text = serialize(snapshot);

    let temp_path = with_suffix(path, ".tmp");

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        // Restrictive permissions from the start; the policy names internal
        // hosts and addresses.
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(text.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        tokio::fs::write(&temp_path, &text).await?;
    }

    tokio::fs::rename(&temp_path, path).await?;

    tokio::fs::write(with_suffix(path, ".sha256"), checksum(&text)).await?;

    Ok(())
}

fn checksum(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::PolicyStore;

    fn sample_snapshot() -> PolicySnapshot {
        let store = PolicyStore::new();
        store.add_user("alice", "10.0.0.5").unwrap();
        store.add_user("bob", "192.168.1.0/24").unwrap();
        store.add_resource("db", "10.0.0.9").unwrap();
        store.add_allow_rule("alice", "db").unwrap();
        store.snapshot()
    }

    #[test]
    fn test_serialize_layout() {
        let text = serialize(&sample_snapshot());
        let expected = "\
[users]
alice,10.0.0.5/32
bob,192.168.1.0/24

[resources]
db,10.0.0.9/32

[allow_rules]
alice,db
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_round_trip() {
        let snapshot = sample_snapshot();
        let parsed = parse(&serialize(&snapshot)).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_parse_accepts_bare_addresses() {
        // The original tool wrote addresses without a prefix length
        let text = "[users]\nalice,10.0.0.5\n\n[resources]\n\n[allow_rules]\n";
        let snapshot = parse(text).unwrap();
        assert_eq!(snapshot.users["alice"].source_ip.to_string(), "10.0.0.5/32");
    }

    #[test]
    fn test_parse_rejects_dangling_user() {
        let text = "[users]\n\n[resources]\ndb,10.0.0.9\n\n[allow_rules]\nalice,db\n";
        let err = parse(text).unwrap_err();
        assert!(matches!(
            err,
            DocumentError::DanglingReference { missing: "user", .. }
        ));
    }

    #[test]
    fn test_parse_rejects_dangling_resource() {
        let text = "[users]\nalice,10.0.0.5\n\n[resources]\n\n[allow_rules]\nalice,db\n";
        let err = parse(text).unwrap_err();
        assert!(matches!(
            err,
            DocumentError::DanglingReference {
                missing: "resource",
                ..
            }
        ));
    }

    #[test]
    fn test_parse_rejects_duplicates_with_line_number() {
        let text = "[users]\nalice,10.0.0.5\nalice,10.0.0.6\n";
        let err = parse(text).unwrap_err();
        let DocumentError::Parse { line, message } = err else {
            panic!("expected parse error");
        };
        assert_eq!(line, 3);
        assert!(message.contains("duplicate"));
    }

    #[test]
    fn test_parse_rejects_bad_address() {
        let text = "[users]\nalice,nonsense\n";
        assert!(matches!(
            parse(text),
            Err(DocumentError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_entry_outside_section() {
        let text = "alice,10.0.0.5\n";
        assert!(matches!(
            parse(text),
            Err(DocumentError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let text = "# managed by rampart\n\n[users]\nalice,10.0.0.5\n\n[resources]\n\n[allow_rules]\n";
        let snapshot = parse(text).unwrap();
        assert_eq!(snapshot.users.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.txt");
        let snapshot = sample_snapshot();

        save(&path, &snapshot).await.unwrap();
        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, snapshot);

        // Sidecar checksum was written
        assert!(dir.path().join("policy.txt.sha256").exists());
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty_policy() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = load(&dir.path().join("policy.txt")).await.unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_sidecars_follow_extensionless_paths() {
        let dir = tempfile::tempdir().unwrap();
        // Configured override without a .txt extension
        let path = dir.path().join("policy");
        let snapshot = sample_snapshot();

        save(&path, &snapshot).await.unwrap();
        assert!(dir.path().join("policy.sha256").exists());
        assert!(!dir.path().join("policy.txt.sha256").exists());
        assert!(!dir.path().join("policy.txt.tmp").exists());

        // The sidecar written at save is the one verified at load
        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_concurrent_editors_serialize_on_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.txt");

        // Editor A enters the critical section and makes an edit
        let lock_a = lock_exclusive(&path).unwrap();
        let store = PolicyStore::from_snapshot(load(&path).await.unwrap());
        store.add_user("alice", "10.0.0.5").unwrap();
        save(&path, &store.snapshot()).await.unwrap();

        // Editor B cannot enter while A holds the lock
        assert!(try_lock_exclusive(&path).unwrap().is_none());

        drop(lock_a);

        // B now enters, re-reads the latest document, and its save keeps
        // A's accepted edit instead of overwriting it
        let lock_b = try_lock_exclusive(&path).unwrap();
        assert!(lock_b.is_some());
        let store = PolicyStore::from_snapshot(load(&path).await.unwrap());
        store.add_user("bob", "10.0.0.6").unwrap();
        save(&path, &store.snapshot()).await.unwrap();
        drop(lock_b);

        let final_doc = load(&path).await.unwrap();
        assert!(final_doc.users.contains_key("alice"));
        assert!(final_doc.users.contains_key("bob"));
    }

    #[test]
    fn test_duplicate_add_across_lock_turns_is_rejected() {
        // Two "invocations" both trying to add alice: whoever takes the
        // lock second loads a document that already names her.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.txt");

        let first = lock_exclusive(&path).unwrap();
        let store = PolicyStore::new();
        store.add_user("alice", "10.0.0.5").unwrap();
        let text = serialize(&store.snapshot());
        std::fs::write(&path, &text).unwrap();
        drop(first);

        let _second = lock_exclusive(&path).unwrap();
        let store = PolicyStore::from_snapshot(parse(&std::fs::read_to_string(&path).unwrap()).unwrap());
        let err = store.add_user("alice", "10.0.0.6").unwrap_err();
        assert!(matches!(
            err,
            crate::core::error::PolicyError::DuplicateKey { .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_save_sets_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.txt");
        save(&path, &sample_snapshot()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

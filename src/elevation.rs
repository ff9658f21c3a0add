//! Privilege elevation for nft invocations
//!
//! rampart runs as an unprivileged user and elevates only to run `nft`.
//! Preferred method is `run0` (systemd v256+, no SUID); the fallback is
//! `sudo` on a terminal and `pkexec` otherwise.
//!
//! # Environment Variables
//!
//! - `RAMPART_ELEVATION_METHOD`: force a specific method (`sudo`, `run0`,
//!   or `pkexec`), e.g. for scripts relying on a sudoers NOPASSWD rule.
//! - `RAMPART_NFT_COMMAND`: path of the nft binary to run. Tests point
//!   this at a mock script.
//! - `RAMPART_TEST_NO_ELEVATION`: bypass elevation entirely (testing only).
//!
//! Arguments are passed to `nft` directly, never through a shell, so no
//! interpolation or injection is possible.

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `RAMPART_ELEVATION_METHOD`
    #[error("Invalid RAMPART_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    // Absolute or relative paths (e.g. a mock nft script) bypass the
    // PATH search.
    if name.contains('/') {
        return std::path::Path::new(name).is_file();
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// The nft program to execute, honoring the test override
fn nft_program() -> String {
    std::env::var("RAMPART_NFT_COMMAND").unwrap_or_else(|_| "nft".to_string())
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict test mode override (highest priority)
    if std::env::var("RAMPART_TEST_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Explicit method override. Validated even when already root, so a
    // typo in RAMPART_ELEVATION_METHOD surfaces the same way everywhere.
    if let Ok(method) = std::env::var("RAMPART_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    let mut cmd = Command::new(&method);
                    cmd.arg(program).args(args);
                    Ok(cmd)
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 3. Already root, no prompt needed
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 4. Automatic detection: run0 when available, otherwise sudo on a
    // terminal and pkexec in graphical sessions
    if binary_exists("run0") {
        let mut cmd = Command::new("run0");
        cmd.arg(program).args(args);
        return Ok(cmd);
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        let mut cmd = Command::new("sudo");
        cmd.arg(program).args(args);
        Ok(cmd)
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        let mut cmd = Command::new("pkexec");
        cmd.arg(program).args(args);
        Ok(cmd)
    }
}

/// Creates an elevated `nft` command with the specified arguments.
///
/// # Errors
///
/// Returns an error when no usable elevation method is available or the
/// configured method's binary is missing.
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command(&nft_program(), args)
}

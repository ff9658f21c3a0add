//! Identity source: VPN lease file parsing
//!
//! Policy users normally correspond to VPN clients. The identity source
//! reads a lease file of `username,ip` lines (one per connected client,
//! `#` comments allowed) and produces candidates for `rampart user add`,
//! so operators do not have to transcribe addresses by hand.
//!
//! The lease file is advisory input, not policy: malformed lines are
//! skipped with a warning rather than failing the whole read.

use std::collections::BTreeMap;
use std::path::Path;

use ipnetwork::IpNetwork;
use serde::Serialize;
use tracing::warn;

/// A client the identity source currently knows about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub username: String,
    pub source_ip: IpNetwork,
}

/// Parses lease file text into candidates.
///
/// Lease files append a fresh line when a client reconnects with a new
/// address, so for a repeated username the last line wins. Output is
/// sorted by username.
pub fn parse_leases(text: &str) -> Vec<Candidate> {
    let mut latest: BTreeMap<String, IpNetwork> = BTreeMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((username, addr)) = line.split_once(',') else {
            warn!(line = idx + 1, "lease line has no comma, skipping");
            continue;
        };
        let (username, addr) = (username.trim(), addr.trim());
        if username.is_empty() {
            warn!(line = idx + 1, "lease line has empty username, skipping");
            continue;
        }

        match addr.parse::<IpNetwork>() {
            Ok(source_ip) => {
                latest.insert(username.to_string(), source_ip);
            }
            Err(e) => {
                warn!(line = idx + 1, address = addr, "unparseable lease address, skipping: {e}");
            }
        }
    }

    latest
        .into_iter()
        .map(|(username, source_ip)| Candidate {
            username,
            source_ip,
        })
        .collect()
}

/// Reads and parses a lease file.
///
/// # Errors
///
/// Returns the I/O error when the file cannot be read; a missing file is
/// an error here because the operator asked for candidates explicitly.
pub async fn read_candidates(path: &Path) -> std::io::Result<Vec<Candidate>> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(parse_leases(&text))
}

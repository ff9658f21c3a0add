//! nftables implementation of the [`Enforcer`] contract
//!
//! rampart owns one table, `inet rampart`, with a single forward-hook
//! chain. Every rule it creates carries an owning tag in the nftables
//! comment; listing filters on that tag, so rules belonging to other
//! firewall managers on the host are never read and never mutated.
//!
//! Ordering in the kernel follows the compiled precedence: ALLOW rules are
//! `insert`ed (prepended) and the BASE_DENY is `add`ed (appended), so every
//! allow is evaluated before the default deny regardless of the order the
//! reconciler applies them in.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::core::compile::{EnforcedRule, RuleKind};
use crate::core::enforcer::{ApplyReport, Enforcer};
use crate::core::error::{AppliedOp, EnforceError, FailedOp, OpKind};

/// The nftables table owned by rampart
pub const TABLE: &str = "rampart";

/// The single managed chain (forward hook: user→resource traffic crosses
/// this host as a gateway)
pub const CHAIN: &str = "forward";

const FAMILY: &str = "inet";
const CHAIN_PRIORITY: i32 = -5;

/// Bound on every nft invocation. nft can hang on a wedged netlink socket;
/// expiry surfaces as `Unavailable` rather than blocking the reconciler
/// forever.
const NFT_TIMEOUT: Duration = Duration::from_secs(30);

/// Enforcer backed by the host's `nft` binary
#[derive(Debug, Default)]
pub struct NftEnforcer;

impl NftEnforcer {
    pub fn new() -> Self {
        Self
    }
}

/// Payload that creates the rampart table and chain if absent.
/// Both `add` operations are idempotent in nftables.
fn ensure_payload() -> Value {
    json!({ "nftables": [
        { "add": { "table": { "family": FAMILY, "name": TABLE } } },
        { "add": { "chain": {
            "family": FAMILY,
            "table": TABLE,
            "name": CHAIN,
            "type": "filter",
            "hook": "forward",
            "prio": CHAIN_PRIORITY,
            "policy": "accept"
        } } }
    ] })
}

/// Match expression for a source or destination address
fn addr_match(field: &str, net: ipnetwork::IpNetwork) -> Value {
    json!({
        "match": {
            "left": { "payload": {
                "protocol": if net.is_ipv6() { "ip6" } else { "ip" },
                "field": field
            } },
            "op": "==",
            "right": net.to_string()
        }
    })
}

/// Builds the expression list for a compiled rule
fn rule_expr(rule: &EnforcedRule) -> Vec<Value> {
    match rule.kind {
        RuleKind::Allow => {
            let mut expr = Vec::with_capacity(3);
            if let Some(src) = rule.source {
                expr.push(addr_match("saddr", src));
            }
            if let Some(dst) = rule.dest {
                expr.push(addr_match("daddr", dst));
            }
            expr.push(json!({ "accept": null }));
            expr
        }
        RuleKind::BaseDeny => vec![json!({ "counter": null }), json!({ "drop": null })],
    }
}

/// Payload inserting one compiled rule.
///
/// ALLOW rules prepend so they always sit above the BASE_DENY; the
/// BASE_DENY appends so it stays last.
fn add_payload(rule: &EnforcedRule) -> Value {
    let body = json!({
        "rule": {
            "family": FAMILY,
            "table": TABLE,
            "chain": CHAIN,
            "expr": rule_expr(rule),
            "comment": rule.tag()
        }
    });

    match rule.kind {
        RuleKind::Allow => json!({ "nftables": [ { "insert": body } ] }),
        RuleKind::BaseDeny => json!({ "nftables": [ { "add": body } ] }),
    }
}

/// Payload deleting one kernel rule by handle
fn delete_payload(handle: u64) -> Value {
    json!({ "nftables": [
        { "delete": { "rule": {
            "family": FAMILY,
            "table": TABLE,
            "chain": CHAIN,
            "handle": handle
        } } }
    ] })
}

/// Extracts the rampart-tagged rules (and their kernel handles) from an
/// `nft --json list table` listing. Untagged rules are skipped.
fn parse_listing(listing: &Value) -> Vec<(EnforcedRule, u64)> {
    let Some(objects) = listing.get("nftables").and_then(Value::as_array) else {
        return Vec::new();
    };

    objects
        .iter()
        .filter_map(|obj| {
            let rule = obj.get("rule")?;
            if rule.get("table").and_then(Value::as_str) != Some(TABLE)
                || rule.get("chain").and_then(Value::as_str) != Some(CHAIN)
            {
                return None;
            }
            let comment = rule.get("comment").and_then(Value::as_str)?;
            let enforced = EnforcedRule::from_tag(comment)?;
            let handle = rule.get("handle").and_then(Value::as_u64)?;
            Some((enforced, handle))
        })
        .collect()
}

/// True when stderr indicates the rampart table simply does not exist yet,
/// which reads as an empty enforced set rather than an error.
fn is_missing_table(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such file or directory") || lower.contains("does not exist")
}

/// Runs one elevated nft invocation with the default bounded wait
async fn run_nft(args: &[&str], stdin_json: Option<&Value>) -> Result<Vec<u8>, EnforceError> {
    run_nft_bounded(args, stdin_json, NFT_TIMEOUT).await
}

/// Runs one elevated nft invocation with a bounded wait.
///
/// Returns stdout on success. Spawn failures and timeouts map to
/// `Unavailable`; a non-zero exit maps to `Nft` with the captured stderr.
/// On expiry the child is killed rather than left running elevated in the
/// background.
async fn run_nft_bounded(
    args: &[&str],
    stdin_json: Option<&Value>,
    timeout: Duration,
) -> Result<Vec<u8>, EnforceError> {
    let mut cmd = crate::elevation::create_elevated_nft_command(args)
        .map_err(|e| EnforceError::Unavailable(format!("privilege escalation unavailable: {e}")))?;

    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| EnforceError::Unavailable(format!("failed to spawn nft: {e}")))?;

    if let Some(payload) = stdin_json {
        let json_string = serde_json::to_string(payload)?;
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(json_string.as_bytes()).await?;
        }
    } else {
        drop(child.stdin.take());
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            EnforceError::Unavailable(format!(
                "nft did not respond within {}s",
                timeout.as_secs()
            ))
        })??;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(EnforceError::Nft {
            message: stderr.clone(),
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}

/// Lists the raw kernel state of the rampart table with handles
async fn list_with_handles() -> Result<Vec<(EnforcedRule, u64)>, EnforceError> {
    let stdout = match run_nft(&["--json", "list", "table", FAMILY, TABLE], None).await {
        Ok(stdout) => stdout,
        Err(EnforceError::Nft { stderr: Some(s), .. }) if is_missing_table(&s) => {
            debug!("rampart table absent, treating as empty enforced set");
            return Ok(Vec::new());
        }
        // Querying must distinguish "can't ask" from "asked, table empty"
        Err(EnforceError::Nft { message, .. }) => {
            return Err(EnforceError::Unavailable(message));
        }
        Err(e) => return Err(e),
    };

    let listing: Value = serde_json::from_slice(&stdout)?;
    Ok(parse_listing(&listing))
}

impl Enforcer for NftEnforcer {
    async fn list_enforced(&self) -> Result<BTreeSet<EnforcedRule>, EnforceError> {
        let rules = list_with_handles().await?;
        Ok(rules.into_iter().map(|(rule, _)| rule).collect())
    }

    async fn apply(
        &self,
        add: &[EnforcedRule],
        remove: &[EnforcedRule],
    ) -> Result<ApplyReport, EnforceError> {
        // Idempotent table/chain creation; failure here means nothing was
        // mutated and the whole cycle can simply be retried.
        run_nft(&["--json", "-f", "-"], Some(&ensure_payload()))
            .await
            .map_err(|e| EnforceError::Unavailable(format!("cannot prepare rampart table: {e}")))?;

        let mut applied = Vec::new();
        let mut failed = Vec::new();

        // Removals first so a replaced rule never coexists with its
        // successor in the kernel. Handles are resolved from one fresh
        // listing; each delete is its own nft invocation so one failure
        // cannot take the rest of the batch down with it.
        if !remove.is_empty() {
            let handles = list_with_handles().await?;
            for rule in remove {
                let Some((_, handle)) = handles.iter().find(|(r, _)| r == rule) else {
                    failed.push(FailedOp {
                        op: OpKind::Remove,
                        rule: rule.clone(),
                        reason: "rule not present in kernel".into(),
                    });
                    continue;
                };

                match run_nft(&["--json", "-f", "-"], Some(&delete_payload(*handle))).await {
                    Ok(_) => applied.push(AppliedOp {
                        op: OpKind::Remove,
                        rule: rule.clone(),
                    }),
                    Err(e) => {
                        warn!(rule = %rule, "delete failed: {e}");
                        failed.push(FailedOp {
                            op: OpKind::Remove,
                            rule: rule.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        for rule in add {
            match run_nft(&["--json", "-f", "-"], Some(&add_payload(rule))).await {
                Ok(_) => applied.push(AppliedOp {
                    op: OpKind::Add,
                    rule: rule.clone(),
                }),
                Err(e) => {
                    warn!(rule = %rule, "insert failed: {e}");
                    failed.push(FailedOp {
                        op: OpKind::Add,
                        rule: rule.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if failed.is_empty() {
            info!(ops = applied.len(), "kernel apply complete");
            Ok(ApplyReport { applied })
        } else {
            Err(EnforceError::PartialApply { applied, failed })
        }
    }
}

/// Renders the compiled target as human-readable nft text, for `export`
/// and previews. Mirrors what [`NftEnforcer`] creates in the kernel.
pub fn to_nft_text(target: &BTreeSet<EnforcedRule>) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "table {FAMILY} {TABLE} {{");
    let _ = writeln!(out, "    chain {CHAIN} {{");
    let _ = writeln!(
        out,
        "        type filter hook forward priority {CHAIN_PRIORITY}; policy accept;"
    );

    for rule in target {
        match rule.kind {
            RuleKind::Allow => {
                let _ = write!(out, "        ");
                if let Some(src) = rule.source {
                    let _ = write!(
                        out,
                        "{} saddr {src} ",
                        if src.is_ipv6() { "ip6" } else { "ip" }
                    );
                }
                if let Some(dst) = rule.dest {
                    let _ = write!(
                        out,
                        "{} daddr {dst} ",
                        if dst.is_ipv6() { "ip6" } else { "ip" }
                    );
                }
                let _ = writeln!(out, "accept comment \"{}\"", rule.tag());
            }
            RuleKind::BaseDeny => {
                let _ = writeln!(out, "        counter drop comment \"{}\"", rule.tag());
            }
        }
    }

    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    out
}

/// Renders the compiled target as an nftables JSON batch, for `export`
pub fn to_nft_json(target: &BTreeSet<EnforcedRule>) -> Value {
    let mut objects = ensure_payload()["nftables"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    for rule in target {
        if let Some(batch) = add_payload(rule)["nftables"].as_array() {
            objects.extend(batch.iter().cloned());
        }
    }

    json!({ "nftables": objects })
}

//! Rampart - declarative user→resource firewall policy
//!
//! Rampart manages a deny-by-default access policy between VPN users and
//! protected resources, and keeps the kernel's nftables rules converged
//! onto it. Every mutation goes through the same pipeline: edit the
//! policy, persist it, reconcile the kernel.
//!
//! # Usage
//!
//! ```bash
//! rampart user add alice 10.8.0.2     # Register a user and source address
//! rampart resource add db 10.0.0.9    # Register a protected resource
//! rampart allow alice db              # Grant access
//! rampart revoke alice db             # Revoke access
//! rampart show                        # Print the current policy
//! rampart status                      # Compare policy against the kernel
//! rampart reconcile                   # Force a reconcile cycle
//! rampart candidates                  # List VPN clients not yet in the policy
//! rampart export --format nft         # Render the compiled target ruleset
//! ```
//!
//! # Security
//!
//! - Runs as an unprivileged user, elevates only to run nft
//! - Only rampart-tagged kernel rules are ever touched
//! - Audit trail of every edit and reconcile cycle

mod audit;
mod config;
mod core;
mod elevation;
mod identity;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shadow_rs::shadow;

use crate::core::document;
use crate::core::enforcer::Enforcer;
use crate::core::error::EnforceError;
use crate::core::nft::NftEnforcer;
use crate::core::policy::PolicyStore;
use crate::core::reconcile::Reconciler;

shadow!(build);

#[derive(Parser)]
#[command(name = "rampart")]
#[command(about = "Declarative user→resource firewall policy for nftables", long_about = None)]
#[command(version = build::CLAP_LONG_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage policy users
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Manage protected resources
    Resource {
        #[command(subcommand)]
        action: ResourceAction,
    },
    /// Grant a user access to a resource
    Allow {
        /// Username of an existing user
        username: String,
        /// Name of an existing resource
        resource: String,
    },
    /// Revoke a user's access to a resource
    Revoke {
        /// Username of an existing user
        username: String,
        /// Name of an existing resource
        resource: String,
    },
    /// Print the current policy
    Show,
    /// Compare the policy against the kernel's enforced rules
    Status,
    /// Run one reconcile cycle against the kernel
    Reconcile,
    /// List VPN clients from the lease file that are not yet policy users
    Candidates,
    /// Render the compiled target ruleset
    Export {
        /// Export format (nft or json)
        #[arg(short, long, default_value = "nft")]
        format: String,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Add a user with their source address
    Add {
        username: String,
        /// Source IP or CIDR (e.g. 10.8.0.2 or 10.8.0.0/24)
        source_ip: String,
    },
    /// Remove a user (fails while the user still holds grants)
    Remove { username: String },
}

#[derive(Subcommand)]
enum ResourceAction {
    /// Add a resource with its address
    Add {
        name: String,
        /// Resource IP or CIDR
        resource_ip: String,
    },
    /// Remove a resource (fails while grants still reference it)
    Remove { name: String },
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves the policy document path from config
fn policy_path(config: &config::AppConfig) -> Result<PathBuf, document::DocumentError> {
    match &config.policy_path {
        Some(path) => Ok(path.clone()),
        None => document::default_path(),
    }
}

/// Loads the persisted policy into a store
async fn load_store(path: &PathBuf) -> Result<Arc<PolicyStore>, document::DocumentError> {
    let snapshot = document::load(path).await?;
    Ok(Arc::new(PolicyStore::from_snapshot(snapshot)))
}

/// Persists an edit, audits it, then reconciles the kernel.
///
/// The edit and the enforcement are reported separately: a persisted edit
/// that fails to enforce is not rolled back, it stays pending until the
/// next successful cycle.
async fn save_and_reconcile(
    path: &PathBuf,
    store: Arc<PolicyStore>,
    config: &config::AppConfig,
    operation: &str,
    subject: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    document::save(path, &store.snapshot()).await?;
    if config.enable_audit_log {
        audit::log_edit(operation, subject, true, None).await;
    }
    println!("✓ Policy updated: {operation} {subject}");

    let reconciler = Reconciler::new(store, NftEnforcer::new());
    report_reconcile(&reconciler, config).await
}

/// Runs one cycle and prints/audits the outcome
async fn report_reconcile(
    reconciler: &Reconciler<NftEnforcer>,
    config: &config::AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    match reconciler.reconcile().await {
        Ok(report) => {
            if config.enable_audit_log {
                audit::log_reconcile(
                    Some(report.cycle_id),
                    report.added.len(),
                    report.removed.len(),
                    true,
                    None,
                )
                .await;
            }
            if report.is_noop() {
                println!("✓ Kernel already converged.");
            } else {
                println!(
                    "✓ Kernel converged: {} rule(s) added, {} removed.",
                    report.added.len(),
                    report.removed.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            if config.enable_audit_log {
                audit::log_reconcile(None, 0, 0, false, Some(e.to_string())).await;
            }
            match &e {
                EnforceError::PartialApply { applied, failed } => {
                    eprintln!(
                        "✗ Enforcement incomplete: {} operation(s) applied, {} failed:",
                        applied.len(),
                        failed.len()
                    );
                    for op in failed {
                        eprintln!("    {} {}: {}", op.op, op.rule, op.reason);
                    }
                    eprintln!("  The policy is saved; run 'rampart reconcile' to retry.");
                }
                EnforceError::Nft { message, .. } | EnforceError::Unavailable(message) => {
                    let translation = core::error::NftErrorPattern::match_error(message);
                    eprintln!("✗ {}", translation.user_message);
                    for suggestion in &translation.suggestions {
                        eprintln!("  → {suggestion}");
                    }
                }
                _ => {}
            }
            Err(format!("enforcement failed: {e}").into())
        }
    }
}

/// Takes the cross-process editor lock, telling the operator when it has
/// to wait for another invocation.
fn acquire_editor_lock(
    path: &PathBuf,
) -> Result<nix::fcntl::Flock<std::fs::File>, Box<dyn std::error::Error>> {
    if let Some(lock) = document::try_lock_exclusive(path)? {
        return Ok(lock);
    }
    eprintln!("Waiting for another rampart invocation to finish...");
    Ok(document::lock_exclusive(path)?)
}

async fn handle_cli(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config().await;
    let path = policy_path(&config)?;

    // Edits and kernel applies serialize across processes on the document
    // lock; the reconciler's internal gate only covers one process.
    // Read-only commands rely on atomic document replacement instead.
    let _editor_lock = match &command {
        Commands::Show | Commands::Status | Commands::Candidates | Commands::Export { .. } => None,
        _ => Some(acquire_editor_lock(&path)?),
    };

    match command {
        Commands::User { action } => match action {
            UserAction::Add {
                username,
                source_ip,
            } => {
                let store = load_store(&path).await?;
                store.add_user(&username, &source_ip)?;
                save_and_reconcile(&path, store, &config, "user add", &username).await?;
            }
            UserAction::Remove { username } => {
                let store = load_store(&path).await?;
                store.delete_user(&username)?;
                save_and_reconcile(&path, store, &config, "user remove", &username).await?;
            }
        },
        Commands::Resource { action } => match action {
            ResourceAction::Add { name, resource_ip } => {
                let store = load_store(&path).await?;
                store.add_resource(&name, &resource_ip)?;
                save_and_reconcile(&path, store, &config, "resource add", &name).await?;
            }
            ResourceAction::Remove { name } => {
                let store = load_store(&path).await?;
                store.delete_resource(&name)?;
                save_and_reconcile(&path, store, &config, "resource remove", &name).await?;
            }
        },
        Commands::Allow { username, resource } => {
            let store = load_store(&path).await?;
            store.add_allow_rule(&username, &resource)?;
            let subject = format!("{username} -> {resource}");
            save_and_reconcile(&path, store, &config, "allow", &subject).await?;
        }
        Commands::Revoke { username, resource } => {
            let store = load_store(&path).await?;
            store.delete_allow_rule(&username, &resource)?;
            let subject = format!("{username} -> {resource}");
            save_and_reconcile(&path, store, &config, "revoke", &subject).await?;
        }
        Commands::Show => {
            let snapshot = document::load(&path).await?;
            println!("Users:");
            for user in snapshot.users.values() {
                println!("  {} ({})", user.username, user.source_ip);
            }
            println!("Resources:");
            for resource in snapshot.resources.values() {
                println!("  {} ({})", resource.resource_name, resource.resource_ip);
            }
            println!("Allow rules:");
            for rule in &snapshot.allow_rules {
                println!("  {} -> {}", rule.username, rule.resource_name);
            }
        }
        Commands::Status => {
            let snapshot = document::load(&path).await?;
            let target = core::compile::compile(&snapshot);
            let enforced = NftEnforcer::new().list_enforced().await?;
            let delta = core::reconcile::diff(&enforced, &target);

            println!("Policy rules:   {}", target.len());
            println!("Kernel rules:   {}", enforced.len());
            if delta.is_empty() {
                println!("✓ Converged.");
            } else {
                println!(
                    "✗ Drift: {} rule(s) missing, {} stale. Run 'rampart reconcile'.",
                    delta.to_add.len(),
                    delta.to_remove.len()
                );
            }
        }
        Commands::Reconcile => {
            let store = load_store(&path).await?;
            let reconciler = Reconciler::new(store, NftEnforcer::new());
            report_reconcile(&reconciler, &config).await?;
        }
        Commands::Candidates => {
            let snapshot = document::load(&path).await?;
            let candidates = identity::read_candidates(&config.lease_path).await?;

            let mut new_count = 0;
            for candidate in candidates {
                if snapshot.users.contains_key(&candidate.username) {
                    continue;
                }
                println!("{},{}", candidate.username, candidate.source_ip);
                new_count += 1;
            }
            if new_count == 0 {
                eprintln!("No new candidates in {}.", config.lease_path.display());
            }
        }
        Commands::Export { format } => {
            let snapshot = document::load(&path).await?;
            let target = core::compile::compile(&snapshot);
            match format.as_str() {
                "nft" => print!("{}", core::nft::to_nft_text(&target)),
                "json" => println!(
                    "{}",
                    serde_json::to_string_pretty(&core::nft::to_nft_json(&target))?
                ),
                _ => return Err("Invalid format. Use 'nft' or 'json'.".into()),
            }
        }
    }

    Ok(())
}

use std::path::PathBuf;

use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Override for the policy document location. `None` uses the XDG
    /// data dir.
    #[serde(default)]
    pub policy_path: Option<PathBuf>,

    /// Lease file the identity source reads candidates from
    #[serde(default = "default_lease_path")]
    pub lease_path: PathBuf,

    /// Append policy edits and reconcile cycles to the audit log
    #[serde(default = "default_true")]
    pub enable_audit_log: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            policy_path: None,
            lease_path: default_lease_path(),
            enable_audit_log: true,
        }
    }
}

fn default_lease_path() -> PathBuf {
    PathBuf::from("/var/lib/openvpn/leases.txt")
}

fn default_true() -> bool {
    true
}

/// Saves the config using an atomic write pattern: temp file with 0o600
/// permissions, fsync, rename.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    if let Some(mut path) = get_data_dir() {
        let json = serde_json::to_string_pretty(config)?;

        let mut temp_path = path.clone();
        temp_path.push("config.json.tmp");

        path.push("config.json");

        #[cfg(unix)]
        {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)
                .await?;

            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        #[cfg(not(unix))]
        {
            use tokio::io::AsyncWriteExt;

            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        tokio::fs::rename(temp_path, path).await?;
    }
    Ok(())
}

/// Loads the config from disk, or returns the default if absent or
/// unreadable.
pub async fn load_config() -> AppConfig {
    if let Some(mut path) = get_data_dir() {
        path.push("config.json");
        if let Ok(json) = tokio::fs::read_to_string(&path).await
            && let Ok(config) = serde_json::from_str::<AppConfig>(&json)
        {
            return config;
        }
    }
    AppConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.policy_path.is_none());
        assert!(config.enable_audit_log);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"enable_audit_log": false}"#).unwrap();
        assert!(!config.enable_audit_log);
        assert_eq!(config.lease_path, default_lease_path());
    }

    #[test]
    fn test_config_round_trip() {
        let config = AppConfig {
            policy_path: Some(PathBuf::from("/srv/rampart/policy.txt")),
            lease_path: PathBuf::from("/tmp/leases.txt"),
            enable_audit_log: false,
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.policy_path, config.policy_path);
        assert_eq!(parsed.lease_path, config.lease_path);
    }
}

/// Audit logging for policy and enforcement operations
///
/// Every policy edit and every reconcile cycle appends a structured entry
/// to a JSON-lines log. Audit failures are reported but never abort the
/// operation they describe.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PolicyEdit,
    Reconcile,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates a new audit log instance
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    #[cfg(test)]
    fn at(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    /// Appends an event as one JSON line
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read
    #[allow(dead_code)]
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }
}

/// Logs one policy edit (user/resource/allow-rule mutation)
pub async fn log_edit(operation: &str, subject: &str, success: bool, error: Option<String>) {
    if let Ok(audit) = AuditLog::new() {
        let event = AuditEvent::new(
            EventType::PolicyEdit,
            success,
            serde_json::json!({
                "operation": operation,
                "subject": subject,
            }),
            error,
        );

        if let Err(e) = audit.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Logs one reconcile cycle
pub async fn log_reconcile(
    cycle_id: Option<uuid::Uuid>,
    added: usize,
    removed: usize,
    success: bool,
    error: Option<String>,
) {
    if let Ok(audit) = AuditLog::new() {
        let event = AuditEvent::new(
            EventType::Reconcile,
            success,
            serde_json::json!({
                "cycle_id": cycle_id,
                "added": added,
                "removed": removed,
            }),
            error,
        );

        if let Err(e) = audit.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_creation() {
        let event = AuditEvent::new(
            EventType::Reconcile,
            true,
            serde_json::json!({"added": 2, "removed": 0}),
            None,
        );

        assert!(event.success);
        assert!(event.error.is_none());
        assert_eq!(event.details["added"], 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::PolicyEdit,
            false,
            serde_json::json!({"operation": "user add"}),
            Some("duplicate user".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("policy_edit"));
        assert!(json.contains("duplicate user"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","event_type":"reconcile","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert!(matches!(event.event_type, EventType::Reconcile));
    }

    #[tokio::test]
    async fn test_log_append_and_read_recent() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        for i in 0..3 {
            audit
                .log(AuditEvent::new(
                    EventType::Reconcile,
                    true,
                    serde_json::json!({"added": i}),
                    None,
                ))
                .await
                .unwrap();
        }

        let recent = audit.read_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Newest first
        assert_eq!(recent[0].details["added"], 2);
    }
}

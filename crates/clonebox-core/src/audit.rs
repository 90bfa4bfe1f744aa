//! Append-only JSON-lines audit log, the second piece of legitimate
//! process-wide state alongside the DI container (spec §5/§9).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct Actor {
    pub user: String,
    pub hostname: String,
    pub pid: u32,
}

impl Actor {
    pub fn current() -> Self {
        Self {
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            hostname: hostname_best_effort(),
            pid: std::process::id(),
        }
    }
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetRef {
    pub kind: String,
    pub name: String,
}

/// One JSON object per line, written to `<state_root>/audit.log`.
#[derive(Clone)]
pub struct AuditSink {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AuditSink {
    pub fn new(state_root: impl AsRef<Path>) -> Self {
        Self {
            path: Arc::new(state_root.as_ref().join("audit.log")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Records one event. `details` MUST NOT contain secret values — only
    /// provider names and reference paths (spec invariant 5).
    pub async fn record(
        &self,
        event_type: &str,
        outcome: &str,
        target: Option<TargetRef>,
        details: serde_json::Value,
        error_message: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<()> {
        let actor = Actor::current();
        let timestamp = chrono::Utc::now();
        let event_id = compute_event_id(&timestamp.to_rfc3339(), event_type, &actor.user, actor.pid);
        let record = json!({
            "event_id": event_id,
            "event_type": event_type,
            "timestamp": timestamp,
            "outcome": outcome,
            "actor": actor,
            "target": target,
            "details": details,
            "error_message": error_message,
            "correlation_id": correlation_id,
        });
        let line = serde_json::to_string(&record)?;

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

fn compute_event_id(timestamp: &str, event_type: &str, user: &str, pid: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(b"|");
    hasher.update(event_type.as_bytes());
    hasher.update(b"|");
    hasher.update(user.as_bytes());
    hasher.update(b"|");
    hasher.update(pid.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path());
        sink.record(
            "vm.create",
            "success",
            Some(TargetRef {
                kind: "vm".into(),
                name: "dev".into(),
            }),
            json!({"secrets_used": ["env:DEV_PASSWORD"]}),
            None,
            None,
        )
        .await
        .unwrap();
        sink.record("vm.create", "failure", None, json!({}), Some("boom".into()), None)
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(dir.path().join("audit.log"))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_type"], "vm.create");
        assert_eq!(first["event_id"].as_str().unwrap().len(), 16);
    }
}

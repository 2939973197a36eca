//! Audit log (C11): append-only, monotonically-id'd record of every
//! non-trivial outcome, queryable and retention-purged by the background
//! maintenance task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub ip: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Buffers entries in memory and flushes to disk on a fixed interval and on
/// graceful shutdown only; the tail may be lost on abrupt termination,
/// which is an accepted design tradeoff rather than a bug.
pub struct AuditLog {
    next_id: AtomicU64,
    entries: Mutex<Vec<AuditEntry>>,
    path: Option<std::path::PathBuf>,
}

impl AuditLog {
    pub fn new(path: Option<std::path::PathBuf>) -> Self {
        let next_id = path
            .as_ref()
            .and_then(|p| Self::recover_next_id(p))
            .unwrap_or(1);
        Self {
            next_id: AtomicU64::new(next_id),
            entries: Mutex::new(Vec::new()),
            path,
        }
    }

    /// Reads the last line of a previously-flushed log to recover where the
    /// id sequence left off. Missing file or unparseable tail just means a
    /// fresh sequence starting at 1.
    fn recover_next_id(path: &std::path::Path) -> Option<u64> {
        let contents = std::fs::read_to_string(path).ok()?;
        let last_line = contents.lines().rev().find(|l| !l.trim().is_empty())?;
        let entry: AuditEntry = serde_json::from_str(last_line).ok()?;
        Some(entry.id + 1)
    }

    pub fn record(
        &self,
        actor: &str,
        ip: Option<&str>,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: &str,
        success: bool,
        error: Option<&str>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = AuditEntry {
            id,
            timestamp: Utc::now(),
            actor: actor.to_string(),
            ip: ip.map(|s| s.to_string()),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            details: details.to_string(),
            success,
            error: error.map(|s| s.to_string()),
        };
        self.entries.lock().expect("audit log lock poisoned").push(entry);
        id
    }

    pub fn query(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        actor: Option<&str>,
        action: Option<&str>,
        resource_id: Option<&str>,
    ) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .expect("audit log lock poisoned")
            .iter()
            .filter(|e| since.map(|s| e.timestamp >= s).unwrap_or(true))
            .filter(|e| until.map(|u| e.timestamp <= u).unwrap_or(true))
            .filter(|e| actor.map(|a| e.actor == a).unwrap_or(true))
            .filter(|e| action.map(|a| e.action == a).unwrap_or(true))
            .filter(|e| resource_id.map(|r| e.resource_id == r).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Drops entries older than `retention_days`; returns the count purged.
    pub fn purge_older_than(&self, retention_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let mut guard = self.entries.lock().expect("audit log lock poisoned");
        let before = guard.len();
        guard.retain(|e| e.timestamp >= cutoff);
        before - guard.len()
    }

    pub async fn flush(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let lines: Vec<String> = {
            let guard = self.entries.lock().expect("audit log lock poisoned");
            guard.iter().map(|e| serde_json::to_string(e).expect("audit entry always serializes")).collect()
        };
        tokio::fs::write(path, lines.join("\n")).await
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_monotonic() {
        let log = AuditLog::new(None);
        let mut last = 0;
        for _ in 0..10 {
            let id = log.record("admin", None, "marker.arm", "account", "1001", "", true, None);
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn query_filters_by_actor() {
        let log = AuditLog::new(None);
        log.record("admin", None, "marker.arm", "account", "1", "", true, None);
        log.record("system", None, "marker.arm", "account", "2", "", true, None);
        let results = log.query(None, None, Some("admin"), None, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].actor, "admin");
    }

    #[tokio::test]
    async fn next_id_survives_a_restart_via_the_flushed_log() {
        let dir = std::env::temp_dir().join(format!("sentinel-audit-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("audit.jsonl");

        let log = AuditLog::new(Some(path.clone()));
        for _ in 0..5 {
            log.record("admin", None, "marker.arm", "account", "1001", "", true, None);
        }
        log.flush().await.unwrap();

        let restarted = AuditLog::new(Some(path.clone()));
        let id = restarted.record("admin", None, "marker.arm", "account", "1002", "", true, None);
        assert_eq!(id, 6);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn purge_removes_only_entries_older_than_retention() {
        let log = AuditLog::new(None);
        log.record("admin", None, "marker.arm", "account", "1", "", true, None);
        let purged = log.purge_older_than(90);
        assert_eq!(purged, 0);
        assert_eq!(log.len(), 1);
    }
}

//! Audit log sink - every emitted access command, one JSON object per line
//!
//! Fire-and-forget: write failures are logged and counted, never returned to
//! the decision path. The file is written from its own task.

use crate::domain::types::AccessCommand;
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Consumer of emitted commands
pub trait AuditSink: Send + Sync {
    fn record(&self, cmd: &AccessCommand, delivered: bool);
}

/// One audit line
#[derive(Debug, Serialize)]
pub struct AuditRecord<'a> {
    pub id: &'a str,
    pub camera_id: &'a str,
    #[serde(rename = "type")]
    pub command_type: &'static str,
    pub reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    pub banned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    pub issued_at: u64,
    pub delivered: bool,
    pub logged_at: String,
}

impl<'a> AuditRecord<'a> {
    pub fn new(cmd: &'a AccessCommand, delivered: bool) -> Self {
        let candidate = cmd.candidate();
        Self {
            id: cmd.id(),
            camera_id: cmd.camera_id(),
            command_type: cmd.command_type().as_str(),
            reason: cmd.reason().as_str(),
            identity_id: candidate.map(|c| c.identity_id.0.as_str()),
            label: candidate.map(|c| c.label.as_str()),
            distance: candidate.map(|c| c.distance),
            banned: cmd.banned(),
            retry_after: cmd.retry_after_secs(),
            issued_at: cmd.issued_at(),
            delivered,
            logged_at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        }
    }
}

/// Audit lines buffered ahead of the file writer
pub const AUDIT_QUEUE_CAPACITY: usize = 256;

/// Create the audit sink and the task that owns the file
///
/// The sink only encodes and enqueues; disk I/O happens on the writer task so
/// a slow or stalled disk never holds up command publishing.
pub fn create_audit_log(path: impl AsRef<Path>, metrics: Arc<Metrics>) -> (JsonlAuditLog, AuditWriter) {
    let path = path.as_ref().to_path_buf();
    let (tx, rx) = mpsc::channel(AUDIT_QUEUE_CAPACITY);
    info!(file_path = %path.display(), "audit_log_initialized");
    let log = JsonlAuditLog { path: path.clone(), tx, metrics: metrics.clone(), last_drop_warn: Mutex::new(None) };
    let writer = AuditWriter { path, rx, file: None, metrics };
    (log, writer)
}

/// Sink half: serializes each record and hands it to the writer
pub struct JsonlAuditLog {
    path: PathBuf,
    tx: mpsc::Sender<String>,
    metrics: Arc<Metrics>,
    last_drop_warn: Mutex<Option<Instant>>,
}

impl JsonlAuditLog {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, cmd: &AccessCommand, delivered: bool) {
        let line = match serde_json::to_string(&AuditRecord::new(cmd, delivered)) {
            Ok(line) => line,
            Err(e) => {
                self.metrics.record_audit_failure();
                error!(command_id = %cmd.id(), error = %e, "audit_encode_failed");
                return;
            }
        };

        if let Err(e) = self.tx.try_send(line) {
            self.metrics.record_audit_failure();
            let mut last = self.last_drop_warn.lock();
            if last.map_or(true, |at| at.elapsed() > Duration::from_secs(1)) {
                let reason = match e {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Closed(_) => "writer stopped",
                };
                warn!(command_id = %cmd.id(), reason = %reason, "audit_record_dropped");
                *last = Some(Instant::now());
            }
        }
    }
}

/// Writer half: appends queued lines to the JSONL file
pub struct AuditWriter {
    path: PathBuf,
    rx: mpsc::Receiver<String>,
    file: Option<File>,
    metrics: Arc<Metrics>,
}

impl AuditWriter {
    /// Runs until every sink handle is dropped, then flushes and exits
    pub async fn run(mut self) {
        while let Some(line) = self.rx.recv().await {
            match self.append_line(&line).await {
                Ok(()) => debug!(bytes = %line.len(), "audit_written"),
                Err(e) => {
                    self.metrics.record_audit_failure();
                    error!(file = %self.path.display(), error = %e, "audit_write_failed");
                }
            }
        }
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush().await;
        }
        info!("audit_writer_stopped");
    }

    async fn append_line(&mut self, line: &str) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await?;
                }
            }
            self.file = Some(OpenOptions::new().create(true).append(true).open(&self.path).await?);
        }

        let result = match self.file.as_mut() {
            Some(file) => {
                let mut buf = Vec::with_capacity(line.len() + 1);
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
                match file.write_all(&buf).await {
                    Ok(()) => file.flush().await,
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        };
        // Reopen on the next record after any failure (rotated/removed file)
        if result.is_err() {
            self.file = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DecisionReason, IdentityId, MatchCandidate};
    use tempfile::tempdir;

    fn alice() -> MatchCandidate {
        MatchCandidate { identity_id: IdentityId::from("alice"), label: "Alice".into(), distance: 0.25, banned: false }
    }

    #[tokio::test]
    async fn test_records_append_as_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit").join("access.jsonl");
        let (log, writer) = create_audit_log(&path, Arc::new(Metrics::new()));
        let task = tokio::spawn(writer.run());

        let unlock = AccessCommand::unlock("front", alice());
        let deny = AccessCommand::deny("front", DecisionReason::MixedGroup, false, None);
        log.record(&unlock, true);
        log.record(&deny, false);
        // Dropping the sink lets the writer drain and stop
        drop(log);
        task.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["id"], unlock.id());
        assert_eq!(first["type"], "unlock");
        assert_eq!(first["reason"], "recognized");
        assert_eq!(first["identity_id"], "alice");
        assert_eq!(first["label"], "Alice");
        assert_eq!(first["delivered"], true);
        assert!(first["distance"].as_f64().unwrap() > 0.24);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["type"], "deny");
        assert_eq!(second["reason"], "mixed group");
        assert_eq!(second["delivered"], false);
        assert!(second.get("identity_id").is_none());
    }

    #[tokio::test]
    async fn test_write_failure_is_counted_not_raised() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened for append
        let metrics = Arc::new(Metrics::new());
        let (log, writer) = create_audit_log(dir.path(), metrics.clone());
        let task = tokio::spawn(writer.run());

        log.record(&AccessCommand::manual_unlock("front"), true);
        drop(log);
        task.await.unwrap();
        assert_eq!(metrics.report().audit_failures, 1);
    }

    #[test]
    fn test_record_never_waits_on_the_writer() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        // Writer never started: the queue fills and extra records are dropped
        let (log, _writer) = create_audit_log(dir.path().join("access.jsonl"), metrics.clone());

        let cmd = AccessCommand::manual_unlock("front");
        for _ in 0..AUDIT_QUEUE_CAPACITY + 3 {
            log.record(&cmd, true);
        }
        assert_eq!(metrics.report().audit_failures, 3);
    }
}

//! Append-only audit trail for security events.
//!
//! Records are structured, timestamped, and rendered one per line. Sinks
//! are pluggable; writes are serialized. Error and Critical records are
//! additionally surfaced on the operator stream via `tracing`.
//!
//! Callers must never pass tokens, secrets, or payload bytes into a record;
//! command bodies are sanitized before they get here.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::error;

/// Errors from audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("sink error: {0}")]
    SinkError(String),
    #[error("io error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::IoError(e.to_string())
    }
}

/// Security event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    AuthSuccess,
    AuthFailure,
    SessionStart,
    SessionEnd,
    CommandReceived,
    PermissionDenied,
    RateLimitExceeded,
    EncryptionError,
    SuspiciousActivity,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthSuccess => "AUTH_SUCCESS",
            Self::AuthFailure => "AUTH_FAILURE",
            Self::SessionStart => "SESSION_START",
            Self::SessionEnd => "SESSION_END",
            Self::CommandReceived => "COMMAND_RECEIVED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::EncryptionError => "ENCRYPTION_ERROR",
            Self::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub severity: Severity,
    /// Device-id, session-id, or connection-id the event is about.
    pub subject: String,
    pub message: String,
    pub details: Vec<(String, String)>,
}

impl AuditRecord {
    pub fn new(
        kind: AuditKind,
        severity: Severity,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            severity,
            subject: subject.into(),
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.push((key.into(), value.into()));
        self
    }

    /// Render as a single human-readable line.
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "{} {} {} subject={} \"{}\"",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.kind.as_str(),
            self.severity.as_str(),
            self.subject,
            self.message.replace(['\n', '\r'], " "),
        );
        for (key, value) in &self.details {
            line.push_str(&format!(" {}={}", key, value.replace(['\n', '\r'], " ")));
        }
        line
    }
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// In-memory sink for tests and recent-event buffers. Oldest-first bounded.
#[derive(Debug)]
pub struct MemorySink {
    records: RwLock<Vec<AuditRecord>>,
    max_records: usize,
}

impl MemorySink {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            max_records,
        }
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn emit(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut records = self.records.write().await;
        if records.len() >= self.max_records {
            records.remove(0);
        }
        records.push(record.clone());
        Ok(())
    }
}

/// Append-only file sink, one record per line.
pub struct FileSink {
    path: std::path::PathBuf,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Verify the path is writable; called at startup so a bad path fails
    /// fast instead of on the first event.
    pub async fn probe(&self) -> Result<(), AuditError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for FileSink {
    async fn emit(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(record.to_log_line().as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

/// Fans records out to every sink, serializing writes.
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    pub async fn emit(&self, record: AuditRecord) {
        if record.severity >= Severity::Error {
            error!(
                kind = record.kind.as_str(),
                subject = %record.subject,
                "{}",
                record.message
            );
        }
        let _guard = self.write_lock.lock().await;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(&record).await {
                // The audit trail itself must not take the relay down.
                error!("audit sink failed: {e}");
            }
        }
    }

    // Convenience constructors for the relay's event vocabulary.

    pub async fn auth_success(&self, device_id: &str, method: &str) {
        self.emit(
            AuditRecord::new(
                AuditKind::AuthSuccess,
                Severity::Info,
                device_id,
                "device authenticated",
            )
            .detail("method", method),
        )
        .await;
    }

    pub async fn auth_failure(&self, device_id: &str, reason: &str) {
        self.emit(
            AuditRecord::new(
                AuditKind::AuthFailure,
                Severity::Warning,
                device_id,
                "authentication rejected",
            )
            .detail("reason", reason),
        )
        .await;
    }

    pub async fn session_start(&self, session_id: &str, device_id: &str) {
        self.emit(
            AuditRecord::new(
                AuditKind::SessionStart,
                Severity::Info,
                session_id,
                "session started",
            )
            .detail("device", device_id),
        )
        .await;
    }

    pub async fn session_end(&self, session_id: &str, reason: &str, duration_secs: u64) {
        self.emit(
            AuditRecord::new(
                AuditKind::SessionEnd,
                Severity::Info,
                session_id,
                "session ended",
            )
            .detail("reason", reason)
            .detail("duration_secs", duration_secs.to_string()),
        )
        .await;
    }

    /// `sanitized` must already have sensitive fields redacted.
    pub async fn command_received(&self, session_id: &str, kind: &str, sanitized: String) {
        self.emit(
            AuditRecord::new(
                AuditKind::CommandReceived,
                Severity::Info,
                session_id,
                "command accepted",
            )
            .detail("kind", kind)
            .detail("command", sanitized),
        )
        .await;
    }

    pub async fn permission_denied(&self, subject: &str, what: &str) {
        self.emit(
            AuditRecord::new(
                AuditKind::PermissionDenied,
                Severity::Warning,
                subject,
                "permission denied",
            )
            .detail("operation", what),
        )
        .await;
    }

    pub async fn rate_limit_exceeded(&self, subject: &str, operation: &str) {
        self.emit(
            AuditRecord::new(
                AuditKind::RateLimitExceeded,
                Severity::Info,
                subject,
                "rate limit exceeded",
            )
            .detail("operation", operation),
        )
        .await;
    }

    pub async fn encryption_error(&self, subject: &str, detail: &str) {
        self.emit(
            AuditRecord::new(
                AuditKind::EncryptionError,
                Severity::Error,
                subject,
                "peer reported an encryption failure",
            )
            .detail("detail", detail),
        )
        .await;
    }

    pub async fn suspicious_activity(&self, subject: &str, what: &str) {
        self.emit(
            AuditRecord::new(
                AuditKind::SuspiciousActivity,
                Severity::Error,
                subject,
                "suspicious activity",
            )
            .detail("what", what),
        )
        .await;
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

//! Append-only structured audit sink.
//!
//! One JSON object per line, UTF-8, with an ISO-8601 UTC millisecond
//! timestamp, the event kind, and the stable session id. The file is opened
//! `append|create` with owner-only permissions; single-line appends keep
//! concurrent sessions sharing one path from interleaving partial records.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::warn;

use crate::error::Result;
use crate::error::SecurerErr;

/// Cap on the `code` and result fields of an event.
const MAX_FIELD_CHARS: usize = 10_000;
const TRUNCATION_MARKER: &str = "…[truncated]";

fn format_timestamp(now: OffsetDateTime) -> std::result::Result<String, time::error::Format> {
    let timestamp_format: &[FormatItem] = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );
    now.format(timestamp_format)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    SessionStart,
    SessionClose,
    SessionRestart,
    ExecuteStart,
    ExecuteComplete,
    ExecuteError,
    ExecuteTimeout,
    ToolCall,
    ToolResult,
}

#[derive(Serialize)]
struct AuditEvent<'a> {
    timestamp: String,
    event: AuditEventKind,
    session_id: &'a str,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Per-session handle onto the audit file. Cloning shares the underlying
/// handle, which is how a session and its pool share one log.
#[derive(Clone, Debug)]
pub struct AuditLogger {
    file: Option<Arc<Mutex<File>>>,
    session_id: String,
}

impl AuditLogger {
    pub(crate) fn disabled(session_id: &str) -> Self {
        Self {
            file: None,
            session_id: session_id.to_string(),
        }
    }

    /// Opens (creating if needed) the audit log with path hardening: empty
    /// paths, device nodes, and symlinks are rejected; the parent directory
    /// is created; the file is created owner-only.
    pub(crate) fn open(path: &Path, session_id: &str) -> Result<Self> {
        harden_path(path)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
            session_id: session_id.to_string(),
        })
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Appends one event. Logging failures are warnings, never errors: the
    /// supervisor must not fail an execution because the audit disk is full.
    pub(crate) fn emit(&self, event: AuditEventKind, extra: Map<String, Value>) {
        let Some(file) = &self.file else {
            return;
        };
        let timestamp = match format_timestamp(OffsetDateTime::now_utc()) {
            Ok(ts) => ts,
            Err(err) => {
                warn!("audit: failed to format timestamp: {err}");
                return;
            }
        };
        let record = AuditEvent {
            timestamp,
            event,
            session_id: &self.session_id,
            extra,
        };
        let mut line = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(err) => {
                warn!("audit: failed to serialize event: {err}");
                return;
            }
        };
        line.push('\n');
        let Ok(mut file) = file.lock() else {
            warn!("audit: log mutex poisoned; event dropped");
            return;
        };
        if let Err(err) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            warn!("audit: failed to append event: {err}");
        }
    }
}

fn harden_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(SecurerErr::AuditPathRejected("empty path".to_string()));
    }
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            let file_type = metadata.file_type();
            if file_type.is_symlink() {
                return Err(SecurerErr::AuditPathRejected(format!(
                    "{} is a symlink",
                    path.display()
                )));
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileTypeExt;
                if file_type.is_char_device() || file_type.is_block_device() {
                    return Err(SecurerErr::AuditPathRejected(format!(
                        "{} is a device node",
                        path.display()
                    )));
                }
            }
            if metadata.is_dir() {
                return Err(SecurerErr::AuditPathRejected(format!(
                    "{} is a directory",
                    path.display()
                )));
            }
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SecurerErr::Io(err)),
    }
}

/// Caps a field at 10 000 characters with a marker, per the audit contract.
pub(crate) fn truncate_field(value: &str) -> String {
    if value.chars().count() <= MAX_FIELD_CHARS {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(MAX_FIELD_CHARS).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

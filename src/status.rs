/// Status file: a JSON snapshot of the supervisor, rewritten on every state
/// transition so calling scripts can see what happened to their job.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::signals::{Router, SignalSet};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Supervisor states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    WaitingForLock,
    Running,
    Cleanup,
    Finished,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub identity: String,
    pub state: SupervisorState,
    pub command: Option<String>,
    pub last_exit_status: Option<i32>,
    pub pending: SignalSet,
    pub handled: SignalSet,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file on disk.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".lockrun.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Builds a [`StatusData`] for each update from the router's live signal
/// sets plus whatever the supervisor has recorded so far.
pub struct StatusTracker {
    file: Option<StatusFile>,
    router: Arc<Router>,
    pid: u32,
    identity: String,
    command: Option<String>,
    last_exit_status: Option<i32>,
}

impl StatusTracker {
    /// Create a tracker. With no path, updates are only logged.
    pub fn new(path: Option<PathBuf>, router: Arc<Router>, identity: &str) -> Self {
        Self {
            file: path.map(StatusFile::new),
            router,
            pid: std::process::id(),
            identity: identity.to_string(),
            command: None,
            last_exit_status: None,
        }
    }

    pub fn snapshot(&self, state: SupervisorState) -> StatusData {
        StatusData {
            pid: self.pid,
            identity: self.identity.clone(),
            state,
            command: self.command.clone(),
            last_exit_status: self.last_exit_status,
            pending: self.router.pending(),
            handled: self.router.handled(),
            last_update: Utc::now(),
        }
    }

    /// Record the new state, writing the status file if one is configured.
    pub fn update(&self, state: SupervisorState) {
        let data = self.snapshot(state);
        tracing::debug!(
            state = ?state,
            pending = %data.pending,
            handled = %data.handled,
            "supervisor state"
        );

        let Some(file) = &self.file else {
            return;
        };
        if let Err(e) = file.write(&data) {
            tracing::warn!(path = %file.path().display(), error = %e, "failed to write status file");
        }
    }

    pub fn set_command(&mut self, command: Option<String>) {
        self.command = command;
    }

    pub fn set_exit_status(&mut self, status: i32) {
        self.last_exit_status = Some(status);
    }

    pub fn last_exit_status(&self) -> Option<i32> {
        self.last_exit_status
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}

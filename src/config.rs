use crate::job::JobSpec;
use crate::runtime_dir::{identity_from_path, sanitize_identity, RuntimeDir};
use crate::signals::SignalSet;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from a job file (e.g. `mirror-x.toml`).
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LockrunConfig {
    pub identity: Option<String>,
    pub lock_dir: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub mirror_stop: bool,
    pub jobs: Vec<CommandConfig>,
    pub cleanup: Vec<CleanupConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CommandConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub command: Vec<String>,
    /// Skip this step when any of these signals has been handled.
    pub skip_if_handled: SignalSet,
}

// --- Default implementations ---

impl Default for LockrunConfig {
    fn default() -> Self {
        Self {
            identity: None,
            lock_dir: None,
            status_file: None,
            mirror_stop: true,
            jobs: Vec::new(),
            cleanup: Vec::new(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            skip_if_handled: SignalSet::termination(),
        }
    }
}

/// Command-line values that take precedence over the job file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub identity: Option<String>,
    pub lock_dir: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub no_mirror_stop: bool,
    /// Trailing `-- COMMAND...`, appended as a final job.
    pub command: Vec<String>,
}

/// A cleanup step after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupStep {
    pub job: JobSpec,
    pub skip_if_handled: SignalSet,
}

/// Everything the supervisor needs, with defaults and overrides applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub identity: String,
    pub lock_path: PathBuf,
    pub status_file: Option<PathBuf>,
    pub mirror_stop: bool,
    pub jobs: Vec<JobSpec>,
    pub cleanup: Vec<CleanupStep>,
}

/// Errors from loading or resolving configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl LockrunConfig {
    /// Load a job file from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply overrides and defaults, producing validated settings.
    ///
    /// Identity falls back to the job file's stem, then to the base name of
    /// the first job's program.
    pub fn resolve(self, overrides: Overrides) -> Result<Settings, ConfigError> {
        let mut jobs = Vec::with_capacity(self.jobs.len() + 1);
        for (i, job) in self.jobs.iter().enumerate() {
            let spec = JobSpec::from_command(&job.command)
                .ok_or_else(|| ConfigError::Invalid(format!("jobs[{i}] has an empty command")))?;
            jobs.push(spec);
        }
        if let Some(spec) = JobSpec::from_command(&overrides.command) {
            jobs.push(spec);
        }
        if jobs.is_empty() {
            return Err(ConfigError::Invalid(
                "nothing to run: give a command after `--` or [[jobs]] in the job file"
                    .to_string(),
            ));
        }

        let mut cleanup = Vec::with_capacity(self.cleanup.len());
        for (i, step) in self.cleanup.iter().enumerate() {
            let job = JobSpec::from_command(&step.command).ok_or_else(|| {
                ConfigError::Invalid(format!("cleanup[{i}] has an empty command"))
            })?;
            cleanup.push(CleanupStep {
                job,
                skip_if_handled: step.skip_if_handled,
            });
        }

        let identity = match overrides.identity.or(self.identity) {
            Some(identity) => sanitize_identity(&identity),
            None => match &overrides.config_path {
                Some(path) => identity_from_path(path),
                None => identity_from_path(Path::new(&jobs[0].program)),
            },
        };

        let lock_dir = overrides.lock_dir.or(self.lock_dir);
        let lock_path = RuntimeDir::resolve(lock_dir.as_deref()).lock_file(&identity);

        Ok(Settings {
            identity,
            lock_path,
            status_file: overrides.status_file.or(self.status_file),
            mirror_stop: self.mirror_stop && !overrides.no_mirror_stop,
            jobs,
            cleanup,
        })
    }
}

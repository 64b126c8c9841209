use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Environment variable that overrides the lock directory.
pub const LOCK_DIR_ENV: &str = "LOCKRUN_LOCK_DIR";

static UNSAFE_IDENTITY_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static regex"));

/// Where lock files live.
///
/// One file per lock identity: `<root>/<identity>.lock`. The directory is
/// created on first acquisition, not here.
#[derive(Debug, Clone)]
pub struct RuntimeDir {
    root: PathBuf,
}

impl RuntimeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Pick the lock directory: an explicit path, then `$LOCKRUN_LOCK_DIR`,
    /// then `$XDG_RUNTIME_DIR/lockrun`, then a per-user temp directory.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        resolve_from(
            explicit,
            std::env::var_os(LOCK_DIR_ENV),
            std::env::var_os("XDG_RUNTIME_DIR"),
            nix::unistd::getuid().as_raw(),
        )
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the lock file for `identity`.
    pub fn lock_file(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{}.lock", sanitize_identity(identity)))
    }
}

pub(crate) fn resolve_from(
    explicit: Option<&Path>,
    env_dir: Option<OsString>,
    xdg_runtime: Option<OsString>,
    uid: u32,
) -> RuntimeDir {
    if let Some(path) = explicit {
        return RuntimeDir::new(path);
    }
    if let Some(dir) = env_dir.filter(|d| !d.is_empty()) {
        return RuntimeDir::new(dir);
    }
    if let Some(dir) = xdg_runtime.filter(|d| !d.is_empty()) {
        return RuntimeDir::new(PathBuf::from(dir).join("lockrun"));
    }
    RuntimeDir::new(std::env::temp_dir().join(format!("lockrun-{uid}")))
}

/// Turn an arbitrary task name into something safe to use as a file name.
pub fn sanitize_identity(raw: &str) -> String {
    let cleaned = UNSAFE_IDENTITY_CHARS.replace_all(raw.trim(), "_");
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Base identity of a task given its script or program path:
/// `/usr/local/bin/mirror-x.sh` -> `mirror-x`.
pub fn identity_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());
    sanitize_identity(&stem)
}

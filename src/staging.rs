//! Job Staging / Lifecycle
//!
//! Working directories live under `{root}/{identity}/`. Pipeline runs stage
//! into `{root}/{identity}/{run_id}/` so concurrent runs for one identity
//! never share files; `cleanup(identity)` still removes all of them.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Invalid identity {0:?}: must be a single non-empty path component")]
    InvalidIdentity(String),

    #[error("Invalid file name {0:?}")]
    InvalidFileName(String),

    #[error("Staging I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StagingError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StagingError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Returns true if `name` can be used as exactly one path component.
pub fn is_single_component(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Root of all job working directories.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity_dir(&self, identity: &str) -> Result<PathBuf, StagingError> {
        if !is_single_component(identity) {
            return Err(StagingError::InvalidIdentity(identity.to_string()));
        }
        Ok(self.root.join(identity))
    }

    /// Create (or reuse) the working directory for `identity`.
    pub fn stage(&self, identity: &str) -> Result<JobDir, StagingError> {
        let path = self.identity_dir(identity)?;
        fs::create_dir_all(&path).map_err(|e| StagingError::io(&path, e))?;
        Ok(JobDir {
            identity: identity.to_string(),
            run_id: None,
            path,
        })
    }

    /// Create a fresh per-run directory beneath the identity directory.
    pub fn stage_run(&self, identity: &str) -> Result<JobDir, StagingError> {
        let run_id = Uuid::new_v4();
        let path = self.identity_dir(identity)?.join(run_id.to_string());
        fs::create_dir_all(&path).map_err(|e| StagingError::io(&path, e))?;
        debug!(identity, %run_id, "Staged run directory");
        Ok(JobDir {
            identity: identity.to_string(),
            run_id: Some(run_id),
            path,
        })
    }

    /// Remove everything staged for `identity`. Missing directories are fine.
    pub fn cleanup(&self, identity: &str) -> Result<(), StagingError> {
        let path = self.identity_dir(identity)?;
        remove_tree(&path)?;
        debug!(identity, "Cleaned up working directory");
        Ok(())
    }

    /// Remove a single staged directory (a run, or the identity directory).
    pub fn cleanup_dir(&self, dir: &JobDir) -> Result<(), StagingError> {
        remove_tree(&dir.path)
    }
}

fn remove_tree(path: &Path) -> Result<(), StagingError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StagingError::io(path, e)),
    }
}

/// Handle to a staged working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDir {
    identity: String,
    run_id: Option<Uuid>,
    path: PathBuf,
}

impl JobDir {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `name` inside this directory. `name` must be a bare file name.
    pub fn file(&self, name: &str) -> Result<PathBuf, StagingError> {
        if !is_single_component(name) {
            return Err(StagingError::InvalidFileName(name.to_string()));
        }
        Ok(self.path.join(name))
    }

    pub fn write_file(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, StagingError> {
        let path = self.file(name)?;
        fs::write(&path, bytes).map_err(|e| StagingError::io(&path, e))?;
        Ok(path)
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>, StagingError> {
        let path = self.file(name)?;
        fs::read(&path).map_err(|e| StagingError::io(&path, e))
    }

    /// Guard that removes this directory once every clone has been dropped.
    pub fn release_guard(&self) -> ReleaseGuard {
        ReleaseGuard::new(self.path.clone())
    }
}

/// Reference-counted deferred cleanup.
///
/// Hand a clone to every reader of the directory (for instance the task
/// streaming a response body). The directory is removed when the last clone
/// goes away.
#[derive(Debug, Clone)]
pub struct ReleaseGuard {
    inner: Arc<ReleaseInner>,
}

#[derive(Debug)]
struct ReleaseInner {
    path: PathBuf,
}

impl ReleaseGuard {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(ReleaseInner { path }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of live holders.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Signal that this holder is finished.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ReleaseInner {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released working directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to release working directory"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        let first = ws.stage("user-1").unwrap();
        first.write_file("model.stl", b"solid x").unwrap();

        let second = ws.stage("user-1").unwrap();
        assert_eq!(first.path(), second.path());
        assert_eq!(second.read_file("model.stl").unwrap(), b"solid x");
    }

    #[test]
    fn test_cleanup_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        ws.stage("user-1").unwrap();
        ws.cleanup("user-1").unwrap();
        ws.cleanup("user-1").unwrap();
        assert!(!tmp.path().join("user-1").exists());
    }

    #[test]
    fn test_runs_are_isolated_under_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        let a = ws.stage_run("user-1").unwrap();
        let b = ws.stage_run("user-1").unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(tmp.path().join("user-1")));

        ws.cleanup("user-1").unwrap();
        assert!(!a.path().exists());
        assert!(!b.path().exists());
    }

    #[test]
    fn test_rejects_path_like_identities() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        for bad in ["", ".", "..", "a/b", "..\\x", "nul\0"] {
            assert!(
                matches!(ws.stage(bad), Err(StagingError::InvalidIdentity(_))),
                "accepted {bad:?}"
            );
        }
        let dir = ws.stage("ok").unwrap();
        assert!(matches!(dir.file("../escape"), Err(StagingError::InvalidFileName(_))));
    }

    #[test]
    fn test_release_guard_waits_for_last_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        let dir = ws.stage("user-1").unwrap();
        dir.write_file("out.gcode", b"G28").unwrap();

        let guard = dir.release_guard();
        let transfer = guard.clone();
        assert_eq!(guard.holders(), 2);

        guard.release();
        assert!(dir.path().exists());

        drop(transfer);
        assert!(!dir.path().exists());
    }
}

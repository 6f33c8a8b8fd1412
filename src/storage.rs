//! Object storage seam.
//!
//! The hosted bucket client lives outside this crate. [`LocalObjectStore`]
//! keeps buckets as directories and is used by the CLI and tests.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::staging::is_single_component;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File '{filename}' already exists at directory: {directory}")]
    Conflict { directory: String, filename: String },

    #[error("Object not found: {bucket}/{path}")]
    NotFound { bucket: String, path: String },

    #[error("Invalid object path: {0:?}")]
    InvalidPath(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Successful,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub status: UploadStatus,
    pub filename: String,
    /// Path within the bucket, `identity/[folder/]filename`.
    pub path: String,
}

pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `identity/[folder/]filename`.
    ///
    /// Fails with [`StorageError::Conflict`] when the object exists and
    /// `overwrite` is false.
    fn upload(
        &self,
        identity: &str,
        folder: Option<&str>,
        bucket: &str,
        bytes: &[u8],
        filename: &str,
        overwrite: bool,
    ) -> Result<StoredObject, StorageError>;

    fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError>;

    fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError>;
}

/// Object directory for an upload: `identity` or `identity/folder`.
pub fn object_directory(identity: &str, folder: Option<&str>) -> String {
    match folder.map(|f| f.trim_matches('/')).filter(|f| !f.is_empty()) {
        Some(folder) => format!("{identity}/{folder}"),
        None => identity.to_string(),
    }
}

/// Final component of an object path.
pub fn object_filename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Filesystem-backed store: `{root}/{bucket}/{object path}`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, bucket: &str, path: &str) -> Result<PathBuf, StorageError> {
        if !is_single_component(bucket) {
            return Err(StorageError::InvalidPath(bucket.to_string()));
        }
        let mut resolved = self.root.join(bucket);
        let mut segments = 0;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !is_single_component(segment) {
                return Err(StorageError::InvalidPath(path.to_string()));
            }
            resolved.push(segment);
            segments += 1;
        }
        if segments == 0 {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(resolved)
    }
}

impl ObjectStore for LocalObjectStore {
    fn upload(
        &self,
        identity: &str,
        folder: Option<&str>,
        bucket: &str,
        bytes: &[u8],
        filename: &str,
        overwrite: bool,
    ) -> Result<StoredObject, StorageError> {
        if !is_single_component(filename) {
            return Err(StorageError::InvalidPath(filename.to_string()));
        }
        let directory = object_directory(identity, folder);
        let object_path = format!("{directory}/{filename}");
        let target = self.resolve(bucket, &object_path)?;

        if target.exists() && !overwrite {
            return Err(StorageError::Conflict {
                directory,
                filename: filename.to_string(),
            });
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, bytes)?;
        debug!(bucket, path = %object_path, bytes = bytes.len(), "Stored object");

        Ok(StoredObject {
            status: UploadStatus::Successful,
            filename: filename.to_string(),
            path: object_path,
        })
    }

    fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(bucket, path)?;
        fs::read(&target).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            },
            _ => StorageError::Io(e),
        })
    }

    fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(bucket, path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            }),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_download_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        let stored = store
            .upload("u1", Some("jobs/a"), "stl-files", b"solid", "part.stl", false)
            .unwrap();
        assert_eq!(stored.path, "u1/jobs/a/part.stl");
        assert_eq!(stored.status, UploadStatus::Successful);
        assert_eq!(store.download("stl-files", &stored.path).unwrap(), b"solid");

        store.delete("stl-files", &stored.path).unwrap();
        assert!(matches!(
            store.download("stl-files", &stored.path),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn test_conflict_without_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        store.upload("u1", None, "b", b"one", "part.stl", false).unwrap();

        let err = store.upload("u1", None, "b", b"two", "part.stl", false).unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
        assert!(err.to_string().contains("part.stl"));

        store.upload("u1", None, "b", b"two", "part.stl", true).unwrap();
        assert_eq!(store.download("b", "u1/part.stl").unwrap(), b"two");
    }

    #[test]
    fn test_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        assert!(matches!(
            store.download("b", "u1/../../etc/passwd"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(store.download("..", "x"), Err(StorageError::InvalidPath(_))));
        assert!(matches!(
            store.upload("u1", None, "b", b"", "../x", false),
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_object_paths() {
        assert_eq!(object_directory("u", None), "u");
        assert_eq!(object_directory("u", Some("")), "u");
        assert_eq!(object_directory("u", Some("/a/b/")), "u/a/b");
        assert_eq!(object_filename("u/a/part.gcode"), "part.gcode");
        assert_eq!(object_filename("part.gcode"), "part.gcode");
    }
}

//! Storage resource descriptors.
//!
//! Serializers and loaders consume storage through an opaque handle that is
//! resolved once at construction and held for the instance's lifetime.
//! Only the local filesystem backend is wired in here; object-store
//! backends plug in at this boundary without touching the pipeline.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

const ACCESS_KEY_ENV: &str = "BENCHTRACE_ACCESS_KEY";
const SECRET_KEY_ENV: &str = "BENCHTRACE_SECRET_KEY";

/// Resource descriptor: where trace data lives and how to reach it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Local path or object-store URI.
    pub location: String,
    /// Endpoint override for object-store backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl StorageOptions {
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self {
            location: path.as_ref().to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    /// Explicit credentials win over environment-provided ones.
    pub fn resolved_credentials(&self) -> (Option<String>, Option<String>) {
        let access = self
            .access_key
            .clone()
            .or_else(|| env::var(ACCESS_KEY_ENV).ok());
        let secret = self
            .secret_key
            .clone()
            .or_else(|| env::var(SECRET_KEY_ENV).ok());
        (access, secret)
    }

    fn is_local(&self) -> bool {
        !self.location.contains("://") || self.location.starts_with("file://")
    }
}

/// Resolved storage handle. Dropping it releases the resource.
#[derive(Debug)]
pub struct StorageHandle {
    root: PathBuf,
}

impl StorageHandle {
    /// Resolve `options`, creating the local directory if needed.
    pub fn open(options: &StorageOptions) -> Result<Self> {
        if !options.is_local() {
            return Err(Error::UnsupportedStorage {
                location: options.location.clone(),
            });
        }
        let root = PathBuf::from(
            options
                .location
                .strip_prefix("file://")
                .unwrap_or(&options.location),
        );
        if !root.exists() {
            fs::create_dir_all(&root)?;
        } else if !root.is_dir() {
            return Err(Error::UnsupportedStorage {
                location: format!("{} exists but is not a directory", root.display()),
            });
        }
        Ok(Self { root })
    }

    /// Resolve for reading: the directory must already exist.
    pub fn open_existing(options: &StorageOptions) -> Result<Self> {
        let handle = Self::open(options)?;
        Ok(handle)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_paths_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let opts = StorageOptions::local(dir.path());
        let handle = StorageHandle::open(&opts).unwrap();
        assert_eq!(handle.root(), dir.path());
        assert_eq!(
            handle.path_for("a.parquet"),
            dir.path().join("a.parquet")
        );
    }

    #[test]
    fn object_store_uris_are_rejected() {
        let opts = StorageOptions {
            location: "s3://bucket/traces".to_string(),
            ..Default::default()
        };
        match StorageHandle::open(&opts) {
            Err(Error::UnsupportedStorage { location }) => {
                assert!(location.contains("s3://"))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn explicit_credentials_win() {
        let opts = StorageOptions {
            location: ".".to_string(),
            access_key: Some("explicit".to_string()),
            ..Default::default()
        };
        let (access, _) = opts.resolved_credentials();
        assert_eq!(access.as_deref(), Some("explicit"));
    }
}

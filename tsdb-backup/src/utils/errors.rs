//! Custom error types for backup and restore.

use crate::api::ApiError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error at {path:?}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Multipart error: {0}")]
    Multipart(#[from] multer::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("unsupported version {version} found in manifest at {path:?}")]
    UnsupportedManifestVersion { version: i64, path: PathBuf },

    #[error("no backup manifests found at {0:?}")]
    NoBackupsFound(PathBuf),

    #[error("local KV store in inconsistent state: {0}")]
    Inconsistent(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("failed to unmarshal v1 database info: {0}")]
    MetaDecode(#[from] prost::DecodeError),

    #[error("failed to download snapshot of shard {shard_id} in bucket {bucket_id}: {source}")]
    Shard {
        shard_id: i64,
        bucket_id: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BackupError {
    /// Wrap an error with a description of the step that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        BackupError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Attach the offending path to an I/O error.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::FileIo {
            path: path.into(),
            source,
        }
    }
}

/// Extension for annotating results with the failed step.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<BackupError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Into::<BackupError>::into(e).context(context))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| Into::<BackupError>::into(e).context(f()))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

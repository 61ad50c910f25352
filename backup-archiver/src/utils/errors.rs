//! Custom error types for the backup archiver.

use crate::archiver::manifest::ManifestError;
use crate::remote::RemoteError;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Manifest error in {backup}: {source}")]
    Manifest {
        backup: String,
        #[source]
        source: ManifestError,
    },

    #[error("Archive directory {} already exists, another process may be running", .0.display())]
    DirectoryExists(PathBuf),

    #[error("Extraction of {} failed ({status}): {stderr}", path.display())]
    Extraction {
        path: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("Invalid remote key: {0}")]
    InvalidKey(String),

    #[error("Lease serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backup {backup} is leased by {owner} until {expires_at}")]
    LeaseHeld {
        backup: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Archiving {backup} ran for {elapsed:?}, longer than the allowed {limit:?}")]
    Overran {
        backup: String,
        elapsed: Duration,
        limit: Duration,
    },
}

impl ArchiveError {
    /// Errors that suggest a concurrent, conflicting archiver. The remaining
    /// backups of the prefix group are skipped until the next run.
    pub fn is_group_abort(&self) -> bool {
        matches!(self, ArchiveError::LeaseHeld { .. } | ArchiveError::Overran { .. })
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

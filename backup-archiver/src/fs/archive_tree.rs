//! Local archive tree.
//!
//! Every archived backup is materialized as `{root}/{backup_name}/`, holding
//! the packaged files at their manifest `gpg_path` plus a local copy of the
//! `archive-info` marker.

use crate::layout::DOWNLOAD_DIR;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File count and size of one archive directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveUsage {
    pub files: usize,
    pub bytes: u64,
}

/// Filesystem view of the archive root.
#[derive(Debug, Clone)]
pub struct ArchiveTree {
    root: PathBuf,
}

impl ArchiveTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_dir(&self, backup_name: &str) -> PathBuf {
        self.root.join(backup_name)
    }

    pub fn download_dir(&self, backup_name: &str) -> PathBuf {
        self.archive_dir(backup_name).join(DOWNLOAD_DIR)
    }

    /// Names of the archive directories starting with `prefix`, oldest first.
    /// A missing root simply has no archives.
    pub fn list_archives(&self, prefix: &str) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                if name.starts_with(prefix) {
                    names.push(name);
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Recursively delete one archive directory
    pub async fn remove_archive(&self, backup_name: &str) -> io::Result<()> {
        tokio::fs::remove_dir_all(self.archive_dir(backup_name)).await
    }

    /// Count files and bytes below an archive directory
    pub fn usage(&self, backup_name: &str) -> io::Result<ArchiveUsage> {
        let mut usage = ArchiveUsage::default();

        for entry in WalkDir::new(self.archive_dir(backup_name)).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_file() {
                usage.files += 1;
                usage.bytes += entry.metadata()?.len();
            }
        }

        Ok(usage)
    }
}

/// True if `path` is a regular file of exactly `size` bytes.
pub async fn file_matches(path: &Path, size: u64) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && metadata.len() == size,
        Err(_) => false,
    }
}

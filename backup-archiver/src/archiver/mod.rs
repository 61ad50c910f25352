//! Archive orchestration - turns uploaded backups into local archive
//! directories.
//!
//! For every backup of a prefix group that has a `backup-info` but no
//! `archive-info` on the remote store:
//! - claim the backup with a lease
//! - download and parse the manifest
//! - download the payload objects and unpack tar packages
//! - move every packaged file into place, reusing inherited files from older
//!   archives and falling back to a search over all archives of the group
//! - write and upload `archive-info`, which marks the backup as done

pub mod extract;
pub mod lease;
pub mod manifest;

use crate::config::Config;
use crate::fs::{file_matches, ArchiveTree, ArchiveUsage};
use crate::layout::{
    belongs_to_group, is_control_object, is_valid_backup_name, object_key, split_key,
    ARCHIVE_INFO, BACKUP_INFO,
};
use crate::remote::{download_with_retry, get_with_retry, RemoteObject, RemoteStore, RetryPolicy};
use crate::utils::errors::{ArchiveError, Result};
use bytes::Bytes;
use chrono::Utc;
use extract::{extract_tar, is_tar};
use manifest::{ManifestEntry, ManifestIndex};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Backup names under `prefix` that have a `backup-info` but no
/// `archive-info`, oldest first.
pub fn discover_unarchived(objects: &[RemoteObject], prefix: &str) -> Vec<String> {
    let mut uploaded = BTreeSet::new();
    let mut archived = BTreeSet::new();

    for object in objects {
        let Some((backup, file)) = split_key(&object.key) else {
            continue;
        };
        if !belongs_to_group(backup, prefix) || !is_valid_backup_name(backup) {
            continue;
        }
        match file {
            BACKUP_INFO => {
                uploaded.insert(backup);
            }
            ARCHIVE_INFO => {
                archived.insert(backup);
            }
            _ => {}
        }
    }

    uploaded
        .difference(&archived)
        .map(|name| name.to_string())
        .collect()
}

/// Knobs of a single archiving run.
#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub tar_command: String,
    pub retry: RetryPolicy,
    /// Also the lease duration
    pub max_duration: Duration,
    /// Lease owner, unique to this process; `None` disables leasing
    pub lease_owner: Option<String>,
}

impl ArchiveSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tar_command: config.archive.tar_command.clone(),
            retry: RetryPolicy {
                attempts: config.remote.download_attempts,
                delay: config.remote.retry_delay(),
            },
            max_duration: config.archive.max_duration(),
            lease_owner: config
                .lease
                .enabled
                .then(|| lease::process_owner(&config.lease.owner)),
        }
    }
}

/// Outcome of archiving one backup.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub backup: String,
    pub new_entries: usize,
    pub inherited_entries: usize,
    /// Entries written to `archive-info`
    pub recorded: usize,
    pub omitted: usize,
    pub usage: Option<ArchiveUsage>,
    pub elapsed: Duration,
}

/// Outcome of archiving every pending backup of a prefix group.
#[derive(Debug, Default)]
pub struct GroupArchiveReport {
    pub archived: Vec<BackupReport>,
    pub failed: Vec<String>,
    /// Set when a conflicting run stopped the group early
    pub aborted: Option<ArchiveError>,
    pub cancelled: bool,
}

impl GroupArchiveReport {
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }
}

/// Archives backups from a remote store into a local archive tree.
pub struct Archiver<'a, S> {
    store: &'a S,
    tree: &'a ArchiveTree,
    settings: &'a ArchiveSettings,
}

impl<'a, S: RemoteStore> Archiver<'a, S> {
    pub fn new(store: &'a S, tree: &'a ArchiveTree, settings: &'a ArchiveSettings) -> Self {
        Self {
            store,
            tree,
            settings,
        }
    }

    /// Archive every pending backup of `prefix`, oldest first.
    ///
    /// A failing backup is logged and skipped. A lease conflict or an overrun
    /// stops the group, and so does a cancellation between two backups.
    pub async fn archive_group(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<GroupArchiveReport> {
        let objects = self.store.list().await?;
        let pending = discover_unarchived(&objects, prefix);
        info!(prefix = %prefix, pending = pending.len(), "Discovered unarchived backups");

        let mut report = GroupArchiveReport::default();
        for name in pending {
            if cancel.is_cancelled() {
                warn!(prefix = %prefix, "Shutdown requested, leaving remaining backups for the next run");
                report.cancelled = true;
                break;
            }

            match self.archive_one(prefix, &name, &objects).await {
                Ok(backup) => report.archived.push(backup),
                Err(e) if e.is_group_abort() => {
                    error!(backup = %name, "Stopping group {}: {}", prefix, e);
                    report.aborted = Some(e);
                    break;
                }
                Err(e) => {
                    error!(backup = %name, "Archiving failed: {}", e);
                    report.failed.push(name);
                }
            }
        }

        Ok(report)
    }

    /// Archive a single backup. `objects` is the remote listing the backup
    /// was discovered in.
    pub async fn archive_one(
        &self,
        prefix: &str,
        name: &str,
        objects: &[RemoteObject],
    ) -> Result<BackupReport> {
        let started = Instant::now();
        info!(backup = %name, "Archiving backup");

        let lease = match &self.settings.lease_owner {
            Some(owner) => Some(
                lease::acquire(self.store, name, owner, self.settings.max_duration, Utc::now())
                    .await?,
            ),
            None => None,
        };

        let reclaim = lease.as_ref().map(|l| l.took_over).unwrap_or(false);
        let result = self
            .materialize(prefix, name, objects, reclaim, started)
            .await;

        if let Some(lease) = &lease {
            if let Err(e) = lease::release(self.store, lease).await {
                warn!(backup = %name, "Failed to release lease: {}", e);
            }
        }

        result
    }

    async fn materialize(
        &self,
        prefix: &str,
        name: &str,
        objects: &[RemoteObject],
        reclaim: bool,
        started: Instant,
    ) -> Result<BackupReport> {
        let archive_dir = self.tree.archive_dir(name);
        if tokio::fs::try_exists(&archive_dir).await? {
            // Only a run whose lease expired can have left this behind.
            if !reclaim {
                return Err(ArchiveError::DirectoryExists(archive_dir));
            }
            warn!(backup = %name, "Removing leftover archive directory of an expired run");
            self.tree.remove_archive(name).await?;
        }

        let manifest_key = object_key(name, BACKUP_INFO);
        let raw = get_with_retry(self.store, &manifest_key, self.settings.retry).await?;
        let manifest = ManifestIndex::parse_bytes(&raw).map_err(|source| ArchiveError::Manifest {
            backup: name.to_string(),
            source,
        })?;

        let (new, inherited) = manifest.partition(name);
        info!(
            backup = %name,
            new = new.len(),
            inherited = inherited.len(),
            "Manifest loaded"
        );

        let download_dir = self.tree.download_dir(name);
        tokio::fs::create_dir_all(&download_dir).await?;
        self.download_payloads(name, objects, &download_dir).await?;

        let placed = self.collect_files(prefix, name, &manifest, &download_dir).await?;
        tokio::fs::remove_dir_all(&download_dir).await?;

        let recorded = self.verify(name, &placed, &archive_dir).await;
        let omitted = manifest.len() - recorded.len();
        let encoded = recorded.encode();
        tokio::fs::write(archive_dir.join(ARCHIVE_INFO), &encoded).await?;

        let elapsed = started.elapsed();
        if elapsed > self.settings.max_duration {
            return Err(ArchiveError::Overran {
                backup: name.to_string(),
                elapsed,
                limit: self.settings.max_duration,
            });
        }

        self.store
            .put(&object_key(name, ARCHIVE_INFO), Bytes::from(encoded))
            .await?;

        let usage = {
            let tree = self.tree.clone();
            let backup = name.to_string();
            match tokio::task::spawn_blocking(move || tree.usage(&backup)).await {
                Ok(Ok(usage)) => Some(usage),
                Ok(Err(e)) => {
                    warn!(backup = %name, "Failed to measure archive: {}", e);
                    None
                }
                Err(e) => {
                    warn!(backup = %name, "Archive measurement task failed: {}", e);
                    None
                }
            }
        };

        info!(
            backup = %name,
            recorded = recorded.len(),
            omitted,
            files = usage.map(|u| u.files).unwrap_or_default(),
            bytes = usage.map(|u| u.bytes).unwrap_or_default(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Backup archived"
        );

        Ok(BackupReport {
            backup: name.to_string(),
            new_entries: new.len(),
            inherited_entries: inherited.len(),
            recorded: recorded.len(),
            omitted,
            usage,
            elapsed,
        })
    }

    /// Fetch every payload object of `name` into `download_dir` and unpack
    /// tar packages in place.
    async fn download_payloads(
        &self,
        name: &str,
        objects: &[RemoteObject],
        download_dir: &Path,
    ) -> Result<()> {
        for object in objects {
            let Some((backup, file)) = split_key(&object.key) else {
                continue;
            };
            if backup != name || is_control_object(file) {
                continue;
            }
            if !Path::new(file)
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            {
                return Err(ArchiveError::InvalidKey(object.key.clone()));
            }

            let dest = download_dir.join(file);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let written =
                download_with_retry(self.store, &object.key, &dest, self.settings.retry).await?;
            debug!(backup = %name, object = %file, bytes = written, "Downloaded payload");

            if is_tar(&dest) {
                extract_tar(&self.settings.tar_command, &dest, download_dir).await?;
            }
        }
        Ok(())
    }

    /// Move the packaged file of every manifest entry into the archive
    /// directory. Returns the entries that were placed, re-keyed to `name`.
    async fn collect_files(
        &self,
        prefix: &str,
        name: &str,
        manifest: &ManifestIndex,
        download_dir: &Path,
    ) -> Result<ManifestIndex> {
        let archive_dir = self.tree.archive_dir(name);

        // Newest first, so the fallback prefers the most recent copy.
        let mut candidates = self.tree.list_archives(prefix)?;
        candidates.retain(|candidate| candidate != name && belongs_to_group(candidate, prefix));
        candidates.reverse();

        let mut placed = ManifestIndex::default();
        for entry in manifest.sorted() {
            let Some(rel) = entry.relative_gpg_path() else {
                warn!(backup = %name, path = %entry.path, "Skipping entry with unsafe path {:?}", entry.gpg_path);
                continue;
            };

            let dest = archive_dir.join(rel);
            if file_matches(&dest, entry.gpg_size).await {
                // Already moved for an entry sharing the same packaged file.
                placed.insert(entry.rebased(name));
                continue;
            }

            let Some(source) = self
                .locate(name, entry, rel, download_dir, &candidates)
                .await
            else {
                warn!(
                    backup = %name,
                    path = %entry.path,
                    declared = %entry.backup_name,
                    "No valid copy of {} found, omitting it",
                    entry.gpg_path
                );
                continue;
            };

            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&source, &dest).await?;
            placed.insert(entry.rebased(name));
        }

        Ok(placed)
    }

    /// Find a valid copy of an entry's packaged file: its declared location
    /// first, then every other archive of the group.
    async fn locate(
        &self,
        name: &str,
        entry: &ManifestEntry,
        rel: &Path,
        download_dir: &Path,
        candidates: &[String],
    ) -> Option<PathBuf> {
        let declared = if entry.backup_name == name {
            Some(download_dir.join(rel))
        } else if is_valid_backup_name(&entry.backup_name) {
            Some(self.tree.archive_dir(&entry.backup_name).join(rel))
        } else {
            warn!(backup = %name, path = %entry.path, "Invalid owning backup {:?}", entry.backup_name);
            None
        };

        if let Some(declared) = declared {
            if file_matches(&declared, entry.gpg_size).await {
                return Some(declared);
            }
        }

        for candidate in candidates {
            if *candidate == entry.backup_name {
                continue;
            }
            let path = self.tree.archive_dir(candidate).join(rel);
            if file_matches(&path, entry.gpg_size).await {
                info!(
                    backup = %name,
                    path = %entry.path,
                    declared = %entry.backup_name,
                    found = %candidate,
                    "Recovered file from another archive"
                );
                return Some(path);
            }
        }

        None
    }

    /// Keep only the placed entries whose file is present with the expected
    /// size.
    async fn verify(&self, name: &str, placed: &ManifestIndex, archive_dir: &Path) -> ManifestIndex {
        let mut recorded = ManifestIndex::default();
        for entry in placed.sorted() {
            let present = match entry.relative_gpg_path() {
                Some(rel) => file_matches(&archive_dir.join(rel), entry.gpg_size).await,
                None => false,
            };
            if present {
                recorded.insert(entry.clone());
            } else {
                warn!(backup = %name, path = %entry.path, "File missing or resized after placement, not recording it");
            }
        }
        recorded
    }
}

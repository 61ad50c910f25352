//! One archiving run over every configured backup group.
//!
//! Per group: archive pending backups, rotate the local archives, then prune
//! superseded backups from the remote store. Groups run one after another.

use crate::archiver::{ArchiveSettings, Archiver};
use crate::config::{Config, GroupConfig};
use crate::fs::ArchiveTree;
use crate::remote::cleanup::{prune_remote, CleanupReport};
use crate::remote::RemoteStore;
use crate::retention::{self, RetentionOutcome};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Default)]
pub struct GroupReport {
    pub prefix: String,
    pub archived: Vec<String>,
    pub failed: Vec<String>,
    /// Why archiving stopped early, if it did
    pub aborted: Option<String>,
    pub retention: Option<RetentionOutcome>,
    pub cleanup: Option<CleanupReport>,
}

impl GroupReport {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_none()
    }
}

#[derive(Debug, Default)]
pub struct JobReport {
    pub groups: Vec<GroupReport>,
    pub cancelled: bool,
}

impl JobReport {
    pub fn archived(&self) -> usize {
        self.groups.iter().map(|g| g.archived.len()).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.groups.iter().any(|g| !g.is_clean())
    }
}

/// Run every configured group once.
pub async fn run<S: RemoteStore>(
    config: &Config,
    store: &S,
    cancel: &CancellationToken,
) -> JobReport {
    let tree = ArchiveTree::new(&config.archive.root);
    let settings = ArchiveSettings::from_config(config);
    let archiver = Archiver::new(store, &tree, &settings);

    let mut report = JobReport::default();
    for group in &config.groups {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let span = info_span!("group", prefix = %group.prefix);
        let outcome = run_group(&archiver, &tree, store, config, group, cancel)
            .instrument(span)
            .await;
        report.cancelled |= outcome.1;
        report.groups.push(outcome.0);
    }

    info!(
        groups = report.groups.len(),
        archived = report.archived(),
        cancelled = report.cancelled,
        "Archiving run finished"
    );
    report
}

async fn run_group<S: RemoteStore>(
    archiver: &Archiver<'_, S>,
    tree: &ArchiveTree,
    store: &S,
    config: &Config,
    group: &GroupConfig,
    cancel: &CancellationToken,
) -> (GroupReport, bool) {
    let prefix = group.prefix.as_str();
    let mut report = GroupReport::new(prefix);

    let archived = match archiver.archive_group(prefix, cancel).await {
        Ok(archived) => archived,
        Err(e) => {
            error!("Listing backups failed, skipping group: {}", e);
            report.aborted = Some(e.to_string());
            return (report, false);
        }
    };

    report.archived = archived.archived.iter().map(|b| b.backup.clone()).collect();
    report.failed = archived.failed;

    if let Some(abort) = archived.aborted {
        warn!("Skipping retention and remote cleanup after: {}", abort);
        report.aborted = Some(abort.to_string());
        return (report, archived.cancelled);
    }
    if archived.cancelled {
        return (report, true);
    }

    match retention::enforce(tree, prefix, &group.retention, Utc::now()).await {
        Ok(outcome) => report.retention = Some(outcome),
        Err(e) => error!("Retention pass failed: {}", e),
    }

    match prune_remote(store, prefix, config.remote.delete_rounds).await {
        Ok(cleanup) => report.cleanup = Some(cleanup),
        Err(e) => error!("Remote cleanup failed: {}", e),
    }

    (report, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::lease::LeaseRecord;
    use crate::layout::{object_key, ARCHIVE_INFO, ARCHIVE_LEASE, BACKUP_INFO};
    use crate::remote::BucketStore;
    use bytes::Bytes;
    use chrono::{DateTime, Duration};
    use tempfile::TempDir;

    const CONFIG: &str = r#"
        [archive]
        root = "/unused"

        [remote]
        kind = "memory"
        retry_delay_ms = 1

        [lease]
        owner = "node-1"

        [[groups]]
        prefix = "db_"
        kind = "incremental"
        day_count = 1
    "#;

    fn name(ts: DateTime<Utc>) -> String {
        format!("db_{}", ts.format("%Y-%m-%dT%H:%M:%SZ"))
    }

    async fn upload(store: &BucketStore, backup: &str) {
        let line = format!("/A\t6\tsha\tA.gpg\t3\tgpg-sha\t{}\n", backup);
        store
            .put(&object_key(backup, BACKUP_INFO), Bytes::from(line))
            .await
            .unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "A.gpg", &b"aaa"[..]).unwrap();
        store
            .put(&object_key(backup, "package.tar"), Bytes::from(builder.into_inner().unwrap()))
            .await
            .unwrap();
    }

    async fn keys(store: &BucketStore) -> Vec<String> {
        let mut keys: Vec<String> = store.list().await.unwrap().into_iter().map(|o| o.key).collect();
        keys.sort();
        keys
    }

    fn setup() -> (TempDir, Config, Vec<String>) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::from_toml(CONFIG).unwrap();
        config.archive.root = dir.path().join("archive");

        let now = Utc::now();
        let names = vec![
            name(now - Duration::days(3)),
            name(now - Duration::days(2)),
            name(now - Duration::hours(1)),
        ];
        (dir, config, names)
    }

    #[tokio::test]
    async fn test_run_archives_rotates_and_prunes() {
        let (_dir, config, names) = setup();
        let store = BucketStore::in_memory();
        for backup in &names {
            upload(&store, backup).await;
        }

        let report = run(&config, &store, &CancellationToken::new()).await;
        assert!(!report.has_failures());
        assert_eq!(report.archived(), 3);

        let group = &report.groups[0];
        assert_eq!(group.archived, names);
        assert_eq!(group.retention.as_ref().unwrap().deleted(), &names[..2]);
        assert_eq!(group.cleanup.as_ref().unwrap().kept.as_ref(), Some(&names[2]));

        let tree = ArchiveTree::new(&config.archive.root);
        assert_eq!(tree.list_archives("db_").unwrap(), vec![names[2].clone()]);

        let newest = &names[2];
        assert_eq!(
            keys(&store).await,
            vec![
                object_key(newest, ARCHIVE_INFO),
                object_key(newest, BACKUP_INFO),
                object_key(newest, "package.tar"),
            ]
        );
    }

    #[tokio::test]
    async fn test_group_abort_skips_rotation_and_cleanup() {
        let (_dir, config, names) = setup();
        let store = BucketStore::in_memory();
        for backup in &names {
            upload(&store, backup).await;
        }

        let now = Utc::now();
        let record = LeaseRecord {
            owner: "node-2".to_string(),
            run_id: uuid::Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + Duration::hours(12),
        };
        store
            .put(
                &object_key(&names[2], ARCHIVE_LEASE),
                Bytes::from(serde_json::to_vec(&record).unwrap()),
            )
            .await
            .unwrap();

        let report = run(&config, &store, &CancellationToken::new()).await;
        assert!(report.has_failures());

        let group = &report.groups[0];
        assert_eq!(group.archived, &names[..2]);
        assert!(group.aborted.is_some());
        assert!(group.retention.is_none());
        assert!(group.cleanup.is_none());

        let tree = ArchiveTree::new(&config.archive.root);
        assert_eq!(tree.list_archives("db_").unwrap(), &names[..2]);
        assert!(keys(&store).await.contains(&object_key(&names[0], BACKUP_INFO)));
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_groups() {
        let (_dir, config, names) = setup();
        let store = BucketStore::in_memory();
        upload(&store, &names[0]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = run(&config, &store, &cancel).await;

        assert!(report.cancelled);
        assert!(report.groups.is_empty());
        assert_eq!(keys(&store).await.len(), 2);
    }
}

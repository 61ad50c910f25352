//! Retention rotation of the local archive tree.
//!
//! Full backups keep one archive per recent day and per recent month.
//! Incremental backups keep the last `day_count` archives as well as every
//! archive of the last `day_count` days. Both run behind [`check_clock`], which
//! refuses to prune when the newest archive is dated in the future or has not
//! been refreshed for [`STALENESS_BOUND_DAYS`].

use crate::fs::ArchiveTree;
use crate::layout::backup_timestamp;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;
use tracing::{info, warn};

/// Full backups always keep at least this many daily archives.
pub const DAILY_FLOOR: usize = 3;

/// Pruning stops when the newest archive is older than this.
pub const STALENESS_BOUND_DAYS: i64 = 7;

/// Retention policy of one backup group, selected by `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RetentionPolicy {
    Full {
        daily_count: usize,
        monthly_count: usize,
    },
    Incremental {
        day_count: usize,
    },
}

/// Reasons to skip a whole retention pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SafetyAbort {
    #[error("newest archive {name} is dated {timestamp}, in the future")]
    FutureArchive {
        name: String,
        timestamp: DateTime<Utc>,
    },

    #[error("newest archive {name} is dated {timestamp}, more than 7 days ago")]
    StaleArchive {
        name: String,
        timestamp: DateTime<Utc>,
    },
}

/// An archive directory with the timestamp parsed from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveStamp {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

/// Archives to keep and to delete, as decided by a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub keep: BTreeSet<String>,
    pub delete: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionOutcome {
    Skipped(SafetyAbort),
    Pruned {
        kept: Vec<String>,
        deleted: Vec<String>,
        failed: Vec<String>,
    },
}

impl RetentionOutcome {
    pub fn deleted(&self) -> &[String] {
        match self {
            RetentionOutcome::Skipped(_) => &[],
            RetentionOutcome::Pruned { deleted, .. } => deleted,
        }
    }
}

/// Refuse to prune when the clock or the archiving pipeline looks wrong.
///
/// An empty list passes: there is nothing to delete anyway.
pub fn check_clock(archives: &[ArchiveStamp], now: DateTime<Utc>) -> Result<(), SafetyAbort> {
    let newest = archives
        .iter()
        .max_by(|a, b| (a.timestamp, &a.name).cmp(&(b.timestamp, &b.name)));
    let Some(newest) = newest else {
        return Ok(());
    };

    if newest.timestamp > now {
        return Err(SafetyAbort::FutureArchive {
            name: newest.name.clone(),
            timestamp: newest.timestamp,
        });
    }
    if now - newest.timestamp > Duration::days(STALENESS_BOUND_DAYS) {
        return Err(SafetyAbort::StaleArchive {
            name: newest.name.clone(),
            timestamp: newest.timestamp,
        });
    }

    Ok(())
}

fn newest_first(archives: &[ArchiveStamp]) -> Vec<&ArchiveStamp> {
    let mut sorted: Vec<&ArchiveStamp> = archives.iter().collect();
    sorted.sort_by(|a, b| (b.timestamp, &b.name).cmp(&(a.timestamp, &a.name)));
    sorted
}

fn plan_from_keep(archives: &[ArchiveStamp], keep: BTreeSet<String>) -> RetentionPlan {
    let mut delete: Vec<String> = archives
        .iter()
        .filter(|a| !keep.contains(&a.name))
        .map(|a| a.name.clone())
        .collect();
    delete.sort();
    delete.dedup();
    RetentionPlan { keep, delete }
}

/// Daily/monthly rotation for full backups.
///
/// Walking newest-first, the first archive seen on a calendar day (UTC) is
/// that day's representative, likewise per month. The most recent
/// `max(DAILY_FLOOR, daily_count)` days and `monthly_count` months are kept.
pub fn plan_full(archives: &[ArchiveStamp], daily_count: usize, monthly_count: usize) -> RetentionPlan {
    let daily_count = daily_count.max(DAILY_FLOOR);

    let mut seen_days: HashSet<NaiveDate> = HashSet::new();
    let mut seen_months: HashSet<(i32, u32)> = HashSet::new();
    let mut daily = Vec::new();
    let mut monthly = Vec::new();

    for archive in newest_first(archives) {
        let ts = archive.timestamp;
        if seen_days.insert(ts.date_naive()) {
            daily.push(archive.name.clone());
        }
        if seen_months.insert((ts.year(), ts.month())) {
            monthly.push(archive.name.clone());
        }
    }

    let keep: BTreeSet<String> = daily
        .into_iter()
        .take(daily_count)
        .chain(monthly.into_iter().take(monthly_count))
        .collect();

    plan_from_keep(archives, keep)
}

/// Count and time-window rotation for incremental backups.
///
/// Keeps the `day_count` most recent archives plus every archive newer than
/// `now - day_count days`.
pub fn plan_incremental(archives: &[ArchiveStamp], day_count: usize, now: DateTime<Utc>) -> RetentionPlan {
    // A window reaching past the representable range keeps everything.
    let window_start = i64::try_from(day_count)
        .ok()
        .and_then(Duration::try_days)
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let by_count = newest_first(archives)
        .into_iter()
        .take(day_count)
        .map(|a| a.name.clone());
    let by_time = archives
        .iter()
        .filter(|a| a.timestamp > window_start)
        .map(|a| a.name.clone());

    let keep: BTreeSet<String> = by_count.chain(by_time).collect();
    plan_from_keep(archives, keep)
}

impl RetentionPolicy {
    pub fn plan(&self, archives: &[ArchiveStamp], now: DateTime<Utc>) -> RetentionPlan {
        match *self {
            RetentionPolicy::Full {
                daily_count,
                monthly_count,
            } => plan_full(archives, daily_count, monthly_count),
            RetentionPolicy::Incremental { day_count } => plan_incremental(archives, day_count, now),
        }
    }
}

/// Apply `policy` to the archives of `prefix` below `tree`.
///
/// Directories whose name carries no parsable timestamp are left alone. A
/// failed deletion is logged and reported; the pass continues.
pub async fn enforce(
    tree: &ArchiveTree,
    prefix: &str,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> std::io::Result<RetentionOutcome> {
    let mut archives = Vec::new();
    for name in tree.list_archives(prefix)? {
        match backup_timestamp(&name, prefix) {
            Some(timestamp) => archives.push(ArchiveStamp { name, timestamp }),
            None => warn!(prefix = %prefix, "Ignoring archive {} without a timestamp", name),
        }
    }

    if let Err(abort) = check_clock(&archives, now) {
        warn!(prefix = %prefix, "Skipping retention: {}", abort);
        return Ok(RetentionOutcome::Skipped(abort));
    }

    let plan = policy.plan(&archives, now);
    let mut deleted = Vec::new();
    let mut failed = Vec::new();

    for name in plan.delete {
        match tree.remove_archive(&name).await {
            Ok(()) => {
                info!(prefix = %prefix, "Deleted archive {}", name);
                deleted.push(name);
            }
            Err(e) => {
                warn!(prefix = %prefix, "Failed to delete archive {}: {}", name, e);
                failed.push(name);
            }
        }
    }

    info!(
        prefix = %prefix,
        kept = plan.keep.len(),
        deleted = deleted.len(),
        "Retention pass complete"
    );

    Ok(RetentionOutcome::Pruned {
        kept: plan.keep.into_iter().collect(),
        deleted,
        failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const PREFIX: &str = "file-storage_";

    fn stamp(ts: DateTime<Utc>) -> ArchiveStamp {
        ArchiveStamp {
            name: format!("{}{}", PREFIX, ts.format("%Y-%m-%dT%H:%M:%SZ")),
            timestamp: ts,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    /// One archive per day at 01:00, ending on `last`.
    fn daily_series(last: DateTime<Utc>, days: i64) -> Vec<ArchiveStamp> {
        (0..days).rev().map(|i| stamp(last - Duration::days(i))).collect()
    }

    #[test]
    fn test_check_clock_passes_recent_archive() {
        let now = at(2024, 3, 10, 12);
        let archives = daily_series(at(2024, 3, 10, 1), 5);
        assert_eq!(check_clock(&archives, now), Ok(()));
        assert_eq!(check_clock(&[], now), Ok(()));
    }

    #[test]
    fn test_check_clock_future_archive() {
        let now = at(2024, 3, 10, 12);
        let mut archives = daily_series(at(2024, 3, 10, 1), 5);
        archives.push(stamp(now + Duration::hours(1)));

        assert!(matches!(check_clock(&archives, now), Err(SafetyAbort::FutureArchive { .. })));
    }

    #[test]
    fn test_check_clock_stale_archive() {
        let now = at(2024, 3, 10, 12);
        let archives = daily_series(now - Duration::days(8), 5);
        assert!(matches!(check_clock(&archives, now), Err(SafetyAbort::StaleArchive { .. })));

        let archives = daily_series(now - Duration::days(7), 5);
        assert_eq!(check_clock(&archives, now), Ok(()));
    }

    #[test]
    fn test_full_daily_floor() {
        let archives = daily_series(at(2024, 3, 20, 1), 10);
        let plan = plan_full(&archives, 1, 0);

        assert_eq!(plan.keep.len(), 3);
        assert_eq!(plan.delete.len(), 7);
        for archive in &archives[7..] {
            assert!(plan.keep.contains(&archive.name));
        }
    }

    #[test]
    fn test_full_keeps_newest_of_each_day() {
        let archives = vec![
            stamp(at(2024, 3, 20, 1)),
            stamp(at(2024, 3, 20, 13)),
            stamp(at(2024, 3, 19, 1)),
            stamp(at(2024, 3, 18, 1)),
            stamp(at(2024, 3, 17, 1)),
        ];
        let plan = plan_full(&archives, 3, 0);

        assert!(plan.keep.contains(&stamp(at(2024, 3, 20, 13)).name));
        assert!(plan.keep.contains(&stamp(at(2024, 3, 19, 1)).name));
        assert!(plan.keep.contains(&stamp(at(2024, 3, 18, 1)).name));
        assert_eq!(
            plan.delete,
            vec![stamp(at(2024, 3, 17, 1)).name, stamp(at(2024, 3, 20, 1)).name]
        );
    }

    #[test]
    fn test_full_monthly_representatives() {
        let mut archives = daily_series(at(2024, 3, 31, 1), 90);
        archives.sort_by(|a, b| a.name.cmp(&b.name));
        let plan = plan_full(&archives, 3, 3);

        // Three newest days plus the last day of March (already kept), February and January.
        assert!(plan.keep.contains(&stamp(at(2024, 3, 31, 1)).name));
        assert!(plan.keep.contains(&stamp(at(2024, 2, 29, 1)).name));
        assert!(plan.keep.contains(&stamp(at(2024, 1, 31, 1)).name));
        assert_eq!(plan.keep.len(), 5);
        assert_eq!(plan.keep.len() + plan.delete.len(), 90);
    }

    #[test]
    fn test_full_bound_and_newest_kept() {
        let last = at(2024, 6, 30, 1);
        for (daily, monthly) in [(1, 1), (3, 0), (5, 2), (7, 12), (30, 6)] {
            let archives = daily_series(last, 200);
            let plan = plan_full(&archives, daily, monthly);
            assert!(plan.keep.len() <= daily.max(DAILY_FLOOR) + monthly);
            assert!(plan.keep.contains(&stamp(last).name));
            assert_eq!(plan.keep.len() + plan.delete.len(), 200);
        }
    }

    #[test]
    fn test_incremental_count_and_window() {
        let now = at(2024, 3, 20, 12);

        // Runs every 12 hours: the window keeps more than the count
        let frequent: Vec<ArchiveStamp> = (0..20)
            .rev()
            .map(|i| stamp(at(2024, 3, 20, 1) - Duration::hours(12 * i)))
            .collect();
        let plan = plan_incremental(&frequent, 3, now);
        assert_eq!(plan.keep.len(), 6);

        // Missed runs: the count keeps more than the window
        let sparse: Vec<ArchiveStamp> = (0..6)
            .rev()
            .map(|i| stamp(at(2024, 3, 20, 1) - Duration::days(5 * i)))
            .collect();
        let plan = plan_incremental(&sparse, 3, now);
        assert_eq!(plan.keep.len(), 3);
        assert_eq!(plan.delete.len(), 3);
        assert!(plan.keep.contains(&stamp(at(2024, 3, 20, 1)).name));
    }

    #[test]
    fn test_incremental_huge_day_count_keeps_everything() {
        let now = at(2024, 3, 20, 12);
        let archives: Vec<ArchiveStamp> = (0..5)
            .rev()
            .map(|i| stamp(at(2024, 3, 20, 1) - Duration::days(400 * i)))
            .collect();

        for day_count in [usize::MAX, i64::MAX as usize, 10_000_000_000_000] {
            let plan = plan_incremental(&archives, day_count, now);
            assert_eq!(plan.keep.len(), 5);
            assert!(plan.delete.is_empty());
        }
    }

    #[test]
    fn test_policy_dispatch() {
        let now = at(2024, 3, 20, 12);
        let archives = daily_series(at(2024, 3, 20, 1), 10);

        let full = RetentionPolicy::Full {
            daily_count: 4,
            monthly_count: 0,
        };
        assert_eq!(full.plan(&archives, now).keep.len(), 4);

        let incremental = RetentionPolicy::Incremental { day_count: 2 };
        assert_eq!(incremental.plan(&archives, now).keep.len(), 2);
    }

    fn make_tree(names: &[String]) -> std::io::Result<(TempDir, ArchiveTree)> {
        let temp_dir = TempDir::new()?;
        let tree = ArchiveTree::new(temp_dir.path());
        for name in names {
            std::fs::create_dir_all(tree.archive_dir(name))?;
            std::fs::write(tree.archive_dir(name).join("a.gpg"), b"data")?;
        }
        Ok((temp_dir, tree))
    }

    #[tokio::test]
    async fn test_enforce_deletes_directories() -> std::io::Result<()> {
        let now = at(2024, 3, 20, 12);
        let archives = daily_series(at(2024, 3, 20, 1), 6);
        let mut names: Vec<String> = archives.iter().map(|a| a.name.clone()).collect();
        names.push(format!("{}garbage", PREFIX));
        let (_temp_dir, tree) = make_tree(&names)?;

        let policy = RetentionPolicy::Incremental { day_count: 2 };
        let outcome = enforce(&tree, PREFIX, &policy, now).await?;

        assert_eq!(outcome.deleted().len(), 4);
        let remaining = tree.list_archives(PREFIX)?;
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&format!("{}garbage", PREFIX)));
        Ok(())
    }

    #[tokio::test]
    async fn test_enforce_future_archive_deletes_nothing() -> std::io::Result<()> {
        let now = at(2024, 3, 20, 12);
        let mut archives = daily_series(at(2024, 3, 20, 1), 6);
        archives.push(stamp(now + Duration::hours(1)));
        let names: Vec<String> = archives.iter().map(|a| a.name.clone()).collect();
        let (_temp_dir, tree) = make_tree(&names)?;

        let policy = RetentionPolicy::Incremental { day_count: 1 };
        let outcome = enforce(&tree, PREFIX, &policy, now).await?;

        assert!(matches!(outcome, RetentionOutcome::Skipped(SafetyAbort::FutureArchive { .. })));
        assert_eq!(tree.list_archives(PREFIX)?.len(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_enforce_stale_archive_deletes_nothing() -> std::io::Result<()> {
        let now = at(2024, 3, 20, 12);
        let archives = daily_series(now - Duration::days(8), 6);
        let names: Vec<String> = archives.iter().map(|a| a.name.clone()).collect();
        let (_temp_dir, tree) = make_tree(&names)?;

        let policy = RetentionPolicy::Full {
            daily_count: 3,
            monthly_count: 0,
        };
        let outcome = enforce(&tree, PREFIX, &policy, now).await?;

        assert!(matches!(outcome, RetentionOutcome::Skipped(SafetyAbort::StaleArchive { .. })));
        assert_eq!(tree.list_archives(PREFIX)?.len(), 6);
        Ok(())
    }
}

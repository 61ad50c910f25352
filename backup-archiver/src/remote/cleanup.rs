//! Pruning of superseded backups from the remote store.
//!
//! Once a group is archived locally only the newest archived backup has to
//! stay remote. Every object of an older backup is deleted in bounded
//! delete-then-relist rounds, so a store whose listings lag behind deletions
//! still converges without an unbounded loop.

use super::{RemoteError, RemoteObject, RemoteStore};
use crate::layout::{belongs_to_group, split_key, ARCHIVE_INFO};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

/// Objects to delete for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupPlan {
    /// Newest backup carrying an `archive-info` marker
    pub keep: String,
    pub doomed: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub kept: Option<String>,
    pub deleted: usize,
    /// Objects still listed after the last round
    pub remaining: Vec<String>,
    pub rounds: usize,
}

/// Decide which objects to delete. Returns `None` when no backup of the
/// prefix has been archived yet.
///
/// Only backups older than the newest archived one are doomed; newer backups
/// still waiting to be archived stay untouched.
pub fn plan_cleanup(objects: &[RemoteObject], prefix: &str) -> Option<CleanupPlan> {
    let keep = objects
        .iter()
        .filter_map(|o| split_key(&o.key))
        .filter(|(backup, file)| *file == ARCHIVE_INFO && belongs_to_group(backup, prefix))
        .map(|(backup, _)| backup)
        .max()?
        .to_string();

    let doomed = objects
        .iter()
        .filter(|o| {
            split_key(&o.key)
                .map(|(backup, _)| backup < keep.as_str() && belongs_to_group(backup, prefix))
                .unwrap_or(false)
        })
        .map(|o| o.key.clone())
        .collect();

    Some(CleanupPlan { keep, doomed })
}

/// Delete every superseded object of `prefix`, in at most `max_rounds`
/// delete-then-relist rounds.
pub async fn prune_remote<S: RemoteStore>(
    store: &S,
    prefix: &str,
    max_rounds: usize,
) -> Result<CleanupReport, RemoteError> {
    let objects = store.list().await?;
    let Some(plan) = plan_cleanup(&objects, prefix) else {
        info!(prefix = %prefix, "No archived backup on the remote store, nothing to prune");
        return Ok(CleanupReport::default());
    };

    let total = plan.doomed.len();
    let mut pending = plan.doomed;
    let mut rounds = 0;

    while !pending.is_empty() && rounds < max_rounds {
        rounds += 1;

        for key in &pending {
            if let Err(e) = store.delete(key).await {
                warn!("Failed to delete {}: {}", key, e);
            }
        }

        let present: HashSet<String> = store.list().await?.into_iter().map(|o| o.key).collect();
        pending.retain(|key| present.contains(key));
        debug!(prefix = %prefix, round = rounds, remaining = pending.len(), "Delete round finished");
    }

    if !pending.is_empty() {
        warn!(
            prefix = %prefix,
            "{} objects still present after {} delete rounds",
            pending.len(),
            rounds
        );
    }

    info!(
        prefix = %prefix,
        kept = %plan.keep,
        deleted = total - pending.len(),
        rounds,
        "Remote cleanup complete"
    );

    Ok(CleanupReport {
        kept: Some(plan.keep),
        deleted: total - pending.len(),
        remaining: pending.into_iter().collect(),
        rounds,
    })
}

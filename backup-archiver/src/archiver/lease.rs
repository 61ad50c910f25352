//! Per-backup lease held on the remote store while a backup is archived.
//!
//! The lease is a small JSON record at `{backup}/archive-lease`, created with a
//! conditional put so two archivers cannot both claim the same backup. A live
//! record is never taken over, not even by the same host: owners are unique per
//! process. A record left behind by a crashed run is taken over once it
//! expires, and only then may the crashed run's leftovers be cleared.

use crate::layout::{object_key, ARCHIVE_LEASE};
use crate::remote::{RemoteError, RemoteStore};
use crate::utils::errors::{ArchiveError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    pub run_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A lease acquired by this run.
#[derive(Debug, Clone)]
pub struct Lease {
    pub backup: String,
    pub record: LeaseRecord,
    /// Replaced an expired or unreadable record of an earlier run
    pub took_over: bool,
}

impl Lease {
    fn key(&self) -> String {
        object_key(&self.backup, ARCHIVE_LEASE)
    }
}

/// Lease owner unique to this process, `{host}/{uuid}`.
pub fn process_owner(host: &str) -> String {
    format!("{}/{}", host, Uuid::new_v4())
}

/// Claim `backup` for `ttl`.
///
/// Any live lease, whoever owns it, fails with [`ArchiveError::LeaseHeld`].
pub async fn acquire<S: RemoteStore>(
    store: &S,
    backup: &str,
    owner: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Lease> {
    let expires_at = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| ArchiveError::Config(format!("lease duration {:?} out of range", ttl)))?;
    let record = LeaseRecord {
        owner: owner.to_string(),
        run_id: Uuid::new_v4(),
        acquired_at: now,
        expires_at,
    };
    let mut lease = Lease {
        backup: backup.to_string(),
        record,
        took_over: false,
    };
    let key = lease.key();
    let body = Bytes::from(serde_json::to_vec(&lease.record)?);

    match store.put_if_absent(&key, body.clone()).await {
        Ok(()) => {
            debug!(backup = %backup, run_id = %lease.record.run_id, "Lease acquired");
            return Ok(lease);
        }
        Err(RemoteError::AlreadyExists(_)) => {}
        Err(e) => return Err(e.into()),
    }

    match store.get(&key).await {
        Ok(bytes) => match serde_json::from_slice::<LeaseRecord>(&bytes) {
            Ok(existing) if !existing.is_expired(now) => {
                return Err(ArchiveError::LeaseHeld {
                    backup: backup.to_string(),
                    owner: existing.owner,
                    expires_at: existing.expires_at,
                });
            }
            Ok(existing) => {
                info!(
                    backup = %backup,
                    previous_owner = %existing.owner,
                    previous_run = %existing.run_id,
                    "Taking over expired lease"
                );
                lease.took_over = true;
            }
            Err(e) => {
                warn!(backup = %backup, "Unreadable lease record, replacing it: {}", e);
                lease.took_over = true;
            }
        },
        // Released between our create and read.
        Err(RemoteError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    store.delete(&key).await?;
    match store.put_if_absent(&key, body).await {
        Ok(()) => Ok(lease),
        // Another archiver won the race for the freed record.
        Err(RemoteError::AlreadyExists(_)) => {
            let holder = store
                .get(&key)
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice::<LeaseRecord>(&bytes).ok());
            Err(ArchiveError::LeaseHeld {
                backup: backup.to_string(),
                owner: holder.as_ref().map(|r| r.owner.clone()).unwrap_or_default(),
                expires_at: holder.map(|r| r.expires_at).unwrap_or(now),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete the lease record, unless another run has replaced it meanwhile.
pub async fn release<S: RemoteStore>(store: &S, lease: &Lease) -> Result<()> {
    let key = lease.key();
    let current = match store.get(&key).await {
        Ok(bytes) => bytes,
        Err(RemoteError::NotFound(_)) => {
            warn!(backup = %lease.backup, "Lease record vanished before release");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice::<LeaseRecord>(&current) {
        Ok(record) if record.run_id == lease.record.run_id => {
            store.delete(&key).await?;
            debug!(backup = %lease.backup, "Lease released");
        }
        Ok(record) => {
            warn!(
                backup = %lease.backup,
                owner = %record.owner,
                "Lease was taken over by another run, leaving it in place"
            );
        }
        Err(e) => {
            warn!(backup = %lease.backup, "Unreadable lease record, leaving it in place: {}", e);
        }
    }

    Ok(())
}

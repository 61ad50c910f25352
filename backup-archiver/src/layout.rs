//! Names shared by the remote key layout and the local archive tree.
//!
//! Remote objects live at `{backup_name}/{file_name}`; the local archive of a
//! backup lives at `{archive_root}/{backup_name}/`. Backup names are
//! `{prefix}{RFC 3339 timestamp}`, so string order is chronological order.

use chrono::{DateTime, Utc};

/// Producer-written manifest of a backup.
pub const BACKUP_INFO: &str = "backup-info";

/// Completion marker written once a backup is fully archived.
pub const ARCHIVE_INFO: &str = "archive-info";

/// Lease record held while a backup is being archived.
pub const ARCHIVE_LEASE: &str = "archive-lease";

/// Scratch directory inside an archive that holds in-flight downloads.
pub const DOWNLOAD_DIR: &str = "download";

/// Split a remote key into `(backup_name, file_name)`.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (backup, file) = key.split_once('/')?;
    if backup.is_empty() || file.is_empty() {
        return None;
    }
    Some((backup, file))
}

/// Remote key of `file_name` inside `backup_name`.
pub fn object_key(backup_name: &str, file_name: &str) -> String {
    format!("{}/{}", backup_name, file_name)
}

/// True for the objects this engine reads or writes itself, as opposed to
/// payload objects uploaded by the producer.
pub fn is_control_object(file_name: &str) -> bool {
    matches!(file_name, BACKUP_INFO | ARCHIVE_INFO | ARCHIVE_LEASE)
}

/// A backup name is used as a single directory component under the archive
/// root, so it must not contain separators or be a relative marker.
pub fn is_valid_backup_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

/// Timestamp encoded in `name` after `prefix`, if it parses.
pub fn backup_timestamp(name: &str, prefix: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(prefix)?;
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A backup belongs to a prefix group only if the rest of its name is a
/// timestamp, so `db_` does not claim the backups of a `db_x_` group.
pub fn belongs_to_group(name: &str, prefix: &str) -> bool {
    backup_timestamp(name, prefix).is_some()
}

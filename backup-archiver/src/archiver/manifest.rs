//! Manifest types for incremental archiving.
//!
//! A manifest (`backup-info` from the producer, `archive-info` from the
//! archiver) lists every logical file of a backup, one tab-separated line per
//! file:
//!
//! ```text
//! path \t size \t sha512 \t gpg_path \t gpg_size \t gpg_sha512 \t backup_name
//! ```
//!
//! `backup_name` points at the backup whose payload physically holds the
//! packaged file. When it names an earlier backup the file is unchanged and is
//! reused from that backup's archive instead of being downloaded again. Tabs
//! inside fields are not escaped.

use std::collections::HashMap;
use std::path::{Component, Path};
use thiserror::Error;
use tracing::warn;

const FIELD_COUNT: usize = 7;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ManifestError {
    #[error("line {line}: expected 7 tab-separated fields, found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("line {line}: invalid {field} {value:?}")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("manifest is not valid UTF-8")]
    Encoding,
}

/// Metadata for a single logical file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub sha512: String,
    pub gpg_path: String,
    pub gpg_size: u64,
    pub gpg_sha512: String,
    pub backup_name: String,
}

impl ManifestEntry {
    /// Encode as a single manifest line, without the trailing newline.
    pub fn encode(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.path,
            self.size,
            self.sha512,
            self.gpg_path,
            self.gpg_size,
            self.gpg_sha512,
            self.backup_name
        )
    }

    /// Decode one manifest line. `line_no` is only used for error reporting.
    pub fn decode(line: &str, line_no: usize) -> Result<Self, ManifestError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != FIELD_COUNT {
            return Err(ManifestError::FieldCount {
                line: line_no,
                found: fields.len(),
            });
        }

        Ok(Self {
            path: fields[0].to_string(),
            size: parse_size(fields[1], "size", line_no)?,
            sha512: fields[2].to_string(),
            gpg_path: fields[3].to_string(),
            gpg_size: parse_size(fields[4], "gpg size", line_no)?,
            gpg_sha512: fields[5].to_string(),
            backup_name: fields[6].to_string(),
        })
    }

    /// The packaged file's location relative to an archive directory.
    ///
    /// Returns `None` for paths that are absolute or would leave the archive
    /// directory, so such entries are never materialized.
    pub fn relative_gpg_path(&self) -> Option<&Path> {
        let path = Path::new(&self.gpg_path);
        if self.gpg_path.is_empty() {
            return None;
        }
        let contained = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        contained.then_some(path)
    }

    /// Same entry, re-keyed to `backup_name`.
    pub fn rebased(&self, backup_name: &str) -> Self {
        Self {
            backup_name: backup_name.to_string(),
            ..self.clone()
        }
    }
}

fn parse_size(value: &str, field: &'static str, line: usize) -> Result<u64, ManifestError> {
    value.parse().map_err(|_| ManifestError::InvalidNumber {
        line,
        field,
        value: value.to_string(),
    })
}

/// All entries of one manifest, keyed by logical path.
#[derive(Debug, Clone, Default)]
pub struct ManifestIndex {
    entries: HashMap<String, ManifestEntry>,
}

impl ManifestIndex {
    /// Parse a whole manifest. Blank lines are skipped; a repeated path
    /// replaces the earlier entry.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut entries = HashMap::new();

        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = ManifestEntry::decode(line, idx + 1)?;
            if let Some(previous) = entries.insert(entry.path.clone(), entry) {
                warn!("Manifest repeats path {}, keeping the later line", previous.path);
            }
        }

        Ok(Self { entries })
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ManifestError::Encoding)?;
        Self::parse(text)
    }

    pub fn insert(&mut self, entry: ManifestEntry) -> Option<ManifestEntry> {
        self.entries.insert(entry.path.clone(), entry)
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by logical path.
    pub fn sorted(&self) -> Vec<&ManifestEntry> {
        let mut entries: Vec<&ManifestEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    /// Split into entries packaged in `backup_name` itself and entries
    /// inherited from earlier backups.
    pub fn partition<'a>(
        &'a self,
        backup_name: &str,
    ) -> (Vec<&'a ManifestEntry>, Vec<&'a ManifestEntry>) {
        self.sorted()
            .into_iter()
            .partition(|entry| entry.backup_name == backup_name)
    }

    /// Encode every entry, one line each, ordered by path.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for entry in self.sorted() {
            out.push_str(&entry.encode());
            out.push('\n');
        }
        out
    }
}

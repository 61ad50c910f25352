//! Backup Archiver Library
//!
//! Archives uploaded backups from an object store into a local archive tree,
//! rotates the local archives and prunes superseded backups remotely.

pub mod archiver;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod job;
pub mod layout;
pub mod remote;
pub mod retention;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{ArchiveError, Result};

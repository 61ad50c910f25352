//! Local filesystem side of the archiver.

pub mod archive_tree;

pub use archive_tree::{file_matches, ArchiveTree, ArchiveUsage};

//! Unpacking of downloaded `.tar` payloads with the external tar tool.

use crate::utils::errors::{ArchiveError, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// True if the downloaded object is a tar package that must be unpacked.
pub fn is_tar(path: &Path) -> bool {
    path.extension().map(|ext| ext == "tar").unwrap_or(false)
}

/// Run `{tar_command} -xf {archive} -C {dest}` and delete the tar file once
/// it has been unpacked.
pub async fn extract_tar(tar_command: &str, archive: &Path, dest: &Path) -> Result<()> {
    debug!("Extracting {} into {}", archive.display(), dest.display());

    let output = Command::new(tar_command)
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .await?;

    if !output.status.success() {
        return Err(ArchiveError::Extraction {
            path: archive.to_path_buf(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    tokio::fs::remove_file(archive).await?;
    Ok(())
}

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::util;

/// Grace period for the OS to release file handles after a forced kill.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Backup {
    pub path: PathBuf,
    /// False when a backup from an earlier run was left in place.
    pub created: bool,
    pub digest: blake3::Hash,
}

/// Best-effort termination of every running `image_name` process.
///
/// Never fails. The process may restart before the target is opened; the
/// engine then sees a locked file and reports it per site.
pub async fn ensure_not_running(image_name: &str) {
    log::info!("Attempting to close any running {} instances...", image_name);

    let mut cmd = kill_command(image_name);
    match cmd.output().await {
        Ok(output) if output.status.success() => {
            log::debug!("{}", String::from_utf8_lossy(&output.stdout).trim());
            tokio::time::sleep(SETTLE_DELAY).await;
        }
        Ok(output) => {
            // Both taskkill and pkill exit non-zero when nothing matched.
            log::debug!(
                "no {} process terminated ({}): {}",
                image_name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => log::warn!("Could not run process termination command: {}", e),
    }
}

#[cfg(windows)]
fn kill_command(image_name: &str) -> Command {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/F", "/IM", image_name]);
    cmd
}

#[cfg(not(windows))]
fn kill_command(image_name: &str) -> Command {
    let stem = Path::new(image_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(image_name);
    let mut cmd = Command::new("pkill");
    cmd.args(["-x", stem]);
    cmd
}

/// Copy `target` to `<target><suffix>` unless that file already exists.
///
/// An existing backup is never overwritten: it is the only copy of the
/// unpatched file once the first run has written anything.
pub async fn ensure_backup(target: &Path, suffix: &str) -> Result<Backup> {
    let path = util::backup_path(target, suffix);

    if tokio::fs::try_exists(&path)
        .await
        .with_context(|| format!("Failed to check for backup: {}", path.display()))?
    {
        log::info!("Backup already exists: {}", path.display());
        let digest = hash(path.clone()).await?;
        return Ok(Backup {
            path,
            created: false,
            digest,
        });
    }

    log::info!("Creating backup of {}...", target.display());
    let digest = copy_verified(target, &path).await?;
    log::info!("Backup created at: {}", path.display());

    Ok(Backup {
        path,
        created: true,
        digest,
    })
}

/// Put the backup taken by [`ensure_backup`] back over `target`.
///
/// The backup itself is kept so a later run can restore again.
pub async fn restore_backup(target: &Path, suffix: &str) -> Result<blake3::Hash> {
    let path = util::backup_path(target, suffix);
    if !tokio::fs::try_exists(&path)
        .await
        .with_context(|| format!("Failed to check for backup: {}", path.display()))?
    {
        bail!("No backup found at {}", path.display());
    }

    log::info!("Restoring {} from {}", target.display(), path.display());
    copy_verified(&path, target).await
}

/// Copy `src` to `dst`, then hash both in parallel and require a match.
async fn copy_verified(src: &Path, dst: &Path) -> Result<blake3::Hash> {
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;

    let (src_hash, dst_hash) = tokio::try_join!(hash(src.to_path_buf()), hash(dst.to_path_buf()))?;
    if src_hash != dst_hash {
        bail!(
            "Copy verification failed: {} ({}) != {} ({})",
            dst.display(),
            dst_hash.to_hex(),
            src.display(),
            src_hash.to_hex()
        );
    }

    Ok(dst_hash)
}

async fn hash(path: PathBuf) -> Result<blake3::Hash> {
    tokio::task::spawn_blocking(move || util::hash_file_streaming(&path)).await?
}

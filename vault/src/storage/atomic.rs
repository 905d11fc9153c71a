use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{WalletError, WalletResult};

const TMP_EXTENSION: &str = "new";

/// Write `bytes` to `path` via a sibling temp file and a rename, so readers
/// only ever observe the old or the new content. The file is owner-only.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> WalletResult<()> {
    let tmp_path = stage(path, bytes)?;
    if let Err(err) = commit(&tmp_path, path) {
        if tmp_path.exists() {
            discard(&tmp_path);
        }
        return Err(err);
    }
    Ok(())
}

/// Write the new content next to `path` without replacing it yet.
pub fn stage(path: &Path, bytes: &[u8]) -> WalletResult<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| WalletError::StorageError("Invalid storage path".to_string()))?;
    fs::create_dir_all(dir)?;

    let tmp_path = staged_path(path);
    let mut file = create_private(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(tmp_path)
}

/// Replace `final_path` with a previously staged file. The parent
/// directory is synced so the rename itself is durable.
pub fn commit(tmp_path: &Path, final_path: &Path) -> WalletResult<()> {
    fs::rename(tmp_path, final_path)?;
    if let Some(dir) = final_path.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Drop a staged file that will never be committed.
pub fn discard(tmp_path: &Path) {
    if let Err(err) = fs::remove_file(tmp_path) {
        log::warn!("Failed to remove staged file {}: {}", tmp_path.display(), err);
    }
}

pub fn staged_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TMP_EXTENSION);
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> WalletResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

// Directory handles cannot be synced through std on other platforms.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> WalletResult<()> {
    Ok(())
}

#[cfg(unix)]
fn create_private(path: &Path) -> WalletResult<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() is ignored for pre-existing files
    restrict_file(path)?;
    Ok(file)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> WalletResult<File> {
    Ok(OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> WalletResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Restrict a directory to its owner.
#[cfg(unix)]
pub fn restrict_dir(path: &Path) -> WalletResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn restrict_dir(_path: &Path) -> WalletResult<()> {
    Ok(())
}

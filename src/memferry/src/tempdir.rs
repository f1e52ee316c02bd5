use std::{
    env, io,
    path::{Path, PathBuf},
};

use nix::{
    sys::statvfs::statvfs,
    unistd::{access, AccessFlags},
};
use tracing::debug;

/// RAM-backed mount preferred as the root for pool folders.
pub const SYSTEM_SHARED_MEM_FS: &str = "/dev/shm";

/// Minimum free space on the shared-memory mount before it is considered.
pub const SYSTEM_SHARED_MEM_FS_MIN_SIZE: u64 = 2_000_000_000;

/// Environment override for the temp root.
pub const TEMP_FOLDER_ENV: &str = "JOBLIB_TEMP_FOLDER";

/// Resolve the full path of a pool folder and report whether it landed on
/// the shared-memory filesystem.
///
/// Candidates, in order: the explicit `temp_folder` root, the
/// `JOBLIB_TEMP_FOLDER` environment variable, `/dev/shm`, the platform temp
/// dir (`TMPDIR`/`TMP`/`TEMP`). The folder itself is not created; creation
/// is deferred to the first dump.
pub fn get_temp_dir(
    pool_folder_name: &str,
    temp_folder: Option<&Path>,
) -> io::Result<(PathBuf, bool)> {
    let mut use_shared_mem = false;
    let root = match temp_folder {
        Some(root) => root.to_owned(),
        None => env_override()
            .or_else(|| {
                shared_mem_root().inspect(|_| {
                    use_shared_mem = true;
                })
            })
            .unwrap_or_else(env::temp_dir),
    };
    let root = std::path::absolute(expand_user(&root))?;
    Ok((root.join(pool_folder_name), use_shared_mem))
}

fn env_override() -> Option<PathBuf> {
    let value = env::var_os(TEMP_FOLDER_ENV).filter(|v| !v.is_empty())?;
    let root = PathBuf::from(value);
    if root.is_dir() && access(&root, AccessFlags::W_OK).is_ok() {
        Some(root)
    } else {
        debug!(
            "{} points at unusable {}; falling back",
            TEMP_FOLDER_ENV,
            root.display()
        );
        None
    }
}

/// The shared-memory mount qualifies only when it is present, writable and
/// reasonably large; any probing failure silently demotes to the system
/// temp dir.
fn shared_mem_root() -> Option<PathBuf> {
    let root = Path::new(SYSTEM_SHARED_MEM_FS);
    if !root.exists() {
        return None;
    }
    let stats = statvfs(root).ok()?;
    let available = stats.block_size() as u64 * stats.blocks_available() as u64;
    if available <= SYSTEM_SHARED_MEM_FS_MIN_SIZE {
        return None;
    }
    access(root, AccessFlags::W_OK).ok()?;
    Some(root.to_owned())
}

fn expand_user(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_owned()
}

use std::{fs, io, path::Path, thread, time::Duration};

use tracing::debug;

const UNLINK_NUM_RETRIES: u32 = 10;
const UNLINK_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Remove a file, retrying on `PermissionDenied`.
///
/// A tracker can observe a refcount hit zero while the last mapping of the
/// file is still being torn down in a worker; on some platforms the unlink
/// fails with a permission error until that mapping is gone. A missing file
/// is not an error here: cleanup may race with another process's cleanup.
pub fn unlink_file(path: &Path) -> io::Result<()> {
    for retry in 1..=UNLINK_NUM_RETRIES {
        match fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && retry < UNLINK_NUM_RETRIES => {
                debug!(
                    "unlink of {} hit a permission error, retrying",
                    path.display()
                );
                thread::sleep(UNLINK_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("unlink retry loop always returns")
}

/// Delete a pool folder. `allow_non_empty` is used at program exit, where
/// workers may still be tearing down their last mappings.
pub fn delete_folder(path: &Path, allow_non_empty: bool) -> io::Result<()> {
    let res = if allow_non_empty {
        fs::remove_dir_all(path)
    } else {
        fs::remove_dir(path)
    };
    match res {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

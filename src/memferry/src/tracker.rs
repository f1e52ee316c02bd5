use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::disk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    File,
    Folder,
}

pub type CleanupFn = fn(&Path) -> io::Result<()>;

fn folder_cleanup(path: &Path) -> io::Result<()> {
    disk::delete_folder(path, true)
}

fn default_cleanups() -> HashMap<ResourceKind, CleanupFn> {
    HashMap::from([
        (ResourceKind::File, disk::unlink_file as CleanupFn),
        (ResourceKind::Folder, folder_cleanup as CleanupFn),
    ])
}

enum Request {
    Register(PathBuf, ResourceKind),
    Unregister(PathBuf, ResourceKind),
    MaybeUnlink(PathBuf, ResourceKind),
    Flush(Sender<()>),
}

/// Process-wide refcounting registry for shared temporary files and
/// folders.
///
/// All requests are served in order by a single thread, so concurrent
/// producers cannot double-free a resource. Deletion happens only through
/// [`maybe_unlink`](Self::maybe_unlink) reaching a zero count.
pub struct ResourceTracker {
    tx: Sender<Request>,
}

impl ResourceTracker {
    fn spawn(cleanups: HashMap<ResourceKind, CleanupFn>) -> Self {
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("memferry-resource-tracker".into())
            .spawn(move || serve(rx, cleanups))
            .expect("failed to spawn resource tracker thread");
        Self { tx }
    }

    /// The per-process tracker, started on first use with the default
    /// cleanup functions. Repeated calls return the same instance.
    pub fn global() -> &'static ResourceTracker {
        static TRACKER: OnceLock<ResourceTracker> = OnceLock::new();
        TRACKER.get_or_init(|| ResourceTracker::spawn(default_cleanups()))
    }

    /// Take one reference on the resource.
    pub fn register(&self, path: &Path, kind: ResourceKind) {
        self.send(Request::Register(path.to_owned(), kind));
    }

    /// Drop one reference without ever deleting the resource.
    pub fn unregister(&self, path: &Path, kind: ResourceKind) {
        self.send(Request::Unregister(path.to_owned(), kind));
    }

    /// Drop one reference; the resource is deleted when the count reaches
    /// zero.
    pub fn maybe_unlink(&self, path: &Path, kind: ResourceKind) {
        self.send(Request::MaybeUnlink(path.to_owned(), kind));
    }

    /// Wait until every previously sent request has been served.
    pub fn flush(&self) {
        let (done_tx, done_rx) = bounded(1);
        self.send(Request::Flush(done_tx));
        let _ = done_rx.recv();
    }

    fn send(&self, req: Request) {
        // the serving thread never exits while the process lives
        let _ = self.tx.send(req);
    }
}

/// Convenience accessor for the process-global tracker.
pub fn tracker() -> &'static ResourceTracker {
    ResourceTracker::global()
}

fn serve(rx: Receiver<Request>, cleanups: HashMap<ResourceKind, CleanupFn>) {
    let mut counts: HashMap<(PathBuf, ResourceKind), u64> = HashMap::new();
    for req in rx {
        match req {
            Request::Register(path, kind) => {
                *counts.entry((path, kind)).or_insert(0) += 1;
            }
            Request::Unregister(path, kind) => {
                decrement(&mut counts, &(path, kind));
            }
            Request::MaybeUnlink(path, kind) => {
                let key = (path, kind);
                if decrement(&mut counts, &key) == Some(0) {
                    debug!("deleting unreferenced {:?} {}", kind, key.0.display());
                    if let Err(e) = cleanups[&kind](&key.0) {
                        warn!("failed to delete {}: {}", key.0.display(), e);
                    }
                }
            }
            Request::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn decrement(
    counts: &mut HashMap<(PathBuf, ResourceKind), u64>,
    key: &(PathBuf, ResourceKind),
) -> Option<u64> {
    match counts.get_mut(key) {
        Some(count) => {
            *count -= 1;
            let left = *count;
            if left == 0 {
                counts.remove(key);
            }
            Some(left)
        }
        None => {
            warn!(
                "dropping a reference to untracked {:?} {}",
                key.1,
                key.0.display()
            );
            None
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;

    fn private_tracker() -> ResourceTracker {
        ResourceTracker::spawn(default_cleanups())
    }

    #[test]
    fn register_then_matching_unlinks_delete_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.bin");
        fs::write(&path, b"payload").unwrap();

        let tracker = private_tracker();
        tracker.register(&path, ResourceKind::File);
        tracker.register(&path, ResourceKind::File);

        tracker.maybe_unlink(&path, ResourceKind::File);
        tracker.flush();
        assert!(path.exists());

        tracker.maybe_unlink(&path, ResourceKind::File);
        tracker.flush();
        assert!(!path.exists());
    }

    #[test]
    fn unregister_never_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kept.bin");
        fs::write(&path, b"payload").unwrap();

        let tracker = private_tracker();
        tracker.register(&path, ResourceKind::File);
        tracker.unregister(&path, ResourceKind::File);
        tracker.flush();
        assert!(path.exists());
    }

    #[test]
    fn unknown_key_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-registered");
        let tracker = private_tracker();
        tracker.maybe_unlink(&path, ResourceKind::File);
        tracker.unregister(&path, ResourceKind::File);
        tracker.flush();
    }

    #[test]
    fn folder_cleanup_tolerates_contents() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("pool");
        fs::create_dir(&folder).unwrap();
        fs::write(folder.join("leftover"), b"x").unwrap();

        let tracker = private_tracker();
        tracker.register(&folder, ResourceKind::Folder);
        tracker.maybe_unlink(&folder, ResourceKind::Folder);
        tracker.flush();
        assert!(!folder.exists());
    }

    #[test]
    fn file_and_folder_counts_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("both");
        fs::create_dir(&path).unwrap();

        let tracker = private_tracker();
        tracker.register(&path, ResourceKind::Folder);
        // a file-kind unlink of the same path must not touch the folder count
        tracker.maybe_unlink(&path, ResourceKind::File);
        tracker.flush();
        assert!(path.exists());
    }
}

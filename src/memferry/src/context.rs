use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process,
    sync::{Arc, Once, OnceLock},
};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::TransportOptions,
    disk,
    error::{Error, Result},
    reduce::{get_memmapping_reducers, BackwardReducer, ForwardReducer, TempFolderResolver},
    tempdir,
    tracker::{tracker, ResourceKind},
};

struct ManagerState {
    current_context: String,
    folders: HashMap<String, PathBuf>,
}

/// Owns the pool folders of one executor: one folder per context, resolved
/// up front, created lazily at the first dump, and removed by refcount, by
/// explicit teardown, or at process exit.
pub struct TemporaryResourcesManager {
    manager_id: String,
    temp_folder_root: Option<PathBuf>,
    state: Arc<Mutex<ManagerState>>,
}

impl TemporaryResourcesManager {
    pub fn new(temp_folder_root: Option<PathBuf>, context_id: Option<String>) -> Result<Self> {
        // a fresh manager id keeps a restarted executor from sharing
        // folders with its crashed predecessor under the same context id
        let manager_id = Uuid::new_v4().simple().to_string();
        let context_id = context_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let manager = Self {
            manager_id,
            temp_folder_root,
            state: Arc::new(Mutex::new(ManagerState {
                current_context: String::new(),
                folders: HashMap::new(),
            })),
        };
        manager.set_current_context(&context_id)?;
        Ok(manager)
    }

    pub fn with_options(options: &TransportOptions) -> Result<Self> {
        Self::new(options.temp_folder_root.clone(), options.context_id.clone())
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn current_context(&self) -> String {
        self.state.lock().current_context.clone()
    }

    /// Switch the active context, registering it first if it is new.
    pub fn set_current_context(&self, context_id: &str) -> Result<()> {
        self.register_new_context(context_id)?;
        self.state.lock().current_context = context_id.to_owned();
        Ok(())
    }

    /// Compute and cache the pool folder of a context. Re-registering a
    /// known context is a no-op.
    pub fn register_new_context(&self, context_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.folders.contains_key(context_id) {
            return Ok(());
        }
        let folder_name = format!(
            "joblib_memmapping_folder_{}_{}_{}",
            process::id(),
            self.manager_id,
            context_id
        );
        let (folder, _) = tempdir::get_temp_dir(&folder_name, self.temp_folder_root.as_deref())
            .map_err(|e| Error::io("resolve temp folder", &folder_name, e))?;
        register_folder_finalizer(&folder);
        state.folders.insert(context_id.to_owned(), folder);
        Ok(())
    }

    /// Pool folder of the active context.
    pub fn resolve_temp_folder_name(&self) -> PathBuf {
        let state = self.state.lock();
        state.folders[&state.current_context].clone()
    }

    /// A resolver for reducers. Closes over the shared state only, so
    /// holding it cannot keep the pool alive.
    pub fn resolver(&self) -> TempFolderResolver {
        let state = Arc::clone(&self.state);
        Arc::new(move || {
            let state = state.lock();
            state.folders[&state.current_context].clone()
        })
    }

    /// Reducer pair bound to this manager's active context.
    pub fn reducers(&self, options: &TransportOptions) -> (ForwardReducer, BackwardReducer) {
        get_memmapping_reducers(self.resolver(), options)
    }

    fn context_folders(&self, context_id: Option<&str>) -> Vec<PathBuf> {
        let state = self.state.lock();
        match context_id {
            Some(id) => state.folders.get(id).cloned().into_iter().collect(),
            None => state.folders.values().cloned().collect(),
        }
    }

    /// Give up the batch's hold on every file of the context (or of every
    /// context), then try to remove the folder if it emptied out.
    pub fn unlink_temporary_resources(&self, context_id: Option<&str>) {
        for folder in self.context_folders(context_id) {
            let Ok(entries) = fs::read_dir(&folder) else {
                continue;
            };
            for entry in entries.flatten() {
                tracker().maybe_unlink(&entry.path(), ResourceKind::File);
            }
            // wait for the queued unlinks so the folder has a chance of
            // being empty before the delete below
            tracker().flush();
            if let Err(e) = disk::delete_folder(&folder, false) {
                // workers may still hold maps; exit cleanup will retry
                debug!("could not delete {} yet: {}", folder.display(), e);
            }
        }
    }

    /// Drop this process's registrations without deleting anything.
    pub fn unregister_temporary_resources(&self, context_id: Option<&str>) {
        for folder in self.context_folders(context_id) {
            let Ok(entries) = fs::read_dir(&folder) else {
                continue;
            };
            for entry in entries.flatten() {
                tracker().unregister(&entry.path(), ResourceKind::File);
            }
        }
    }

    /// Force-delete context folders; failures are left to the exit cleanup.
    pub fn try_delete_folder(&self, allow_non_empty: bool, context_id: Option<&str>) {
        for folder in self.context_folders(context_id) {
            if let Err(e) = disk::delete_folder(&folder, allow_non_empty) {
                debug!("could not delete {}: {}", folder.display(), e);
            }
        }
    }

    /// Forget contexts; their folders are left to the exit cleanup.
    pub fn unregister_context(&self, context_id: Option<&str>) {
        let mut state = self.state.lock();
        match context_id {
            Some(id) => {
                state.folders.remove(id);
            }
            None => state.folders.clear(),
        }
    }
}

// === exit cleanup === //

fn exit_folders() -> &'static Mutex<Vec<PathBuf>> {
    static FOLDERS: OnceLock<Mutex<Vec<PathBuf>>> = OnceLock::new();
    FOLDERS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a pool folder with the tracker and for deletion at process
/// exit, in case the caller never tears the manager down explicitly. The
/// exit hook holds folder paths only, never the manager.
fn register_folder_finalizer(folder: &Path) {
    tracker().register(folder, ResourceKind::Folder);
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        libc::atexit(cleanup_at_exit);
    });
    exit_folders().lock().push(folder.to_owned());
}

/// Best-effort removal of every registered pool folder. Safe to run more
/// than once: each folder is handed out only the first time.
extern "C" fn cleanup_at_exit() {
    let folders = std::mem::take(&mut *exit_folders().lock());
    for folder in folders {
        match disk::delete_folder(&folder, true) {
            Ok(()) => tracker().unregister(&folder, ResourceKind::Folder),
            Err(e) => warn!(
                "failed to delete temporary folder {}: {}",
                folder.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn manager_in(root: &Path) -> TemporaryResourcesManager {
        TemporaryResourcesManager::new(Some(root.to_owned()), Some("ctx".to_owned())).unwrap()
    }

    #[test]
    fn folder_name_carries_pid_manager_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        let folder = manager.resolve_temp_folder_name();
        let name = folder.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(&format!("joblib_memmapping_folder_{}_", process::id())));
        assert!(name.ends_with("_ctx"));
        assert!(name.contains(manager.manager_id()));
        // resolution does not create anything
        assert!(!folder.exists());
    }

    #[test]
    fn managers_never_share_folders() {
        let dir = tempfile::tempdir().unwrap();
        let a = manager_in(dir.path());
        let b = manager_in(dir.path());
        assert_ne!(a.resolve_temp_folder_name(), b.resolve_temp_folder_name());
    }

    #[test]
    fn reregistering_a_context_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        let before = manager.resolve_temp_folder_name();
        manager.register_new_context("ctx").unwrap();
        assert_eq!(manager.resolve_temp_folder_name(), before);
    }

    #[test]
    fn resolver_follows_context_switches() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        let resolver = manager.resolver();
        let first = resolver();
        manager.set_current_context("other").unwrap();
        let second = resolver();
        assert_ne!(first, second);
        assert!(second.file_name().unwrap().to_str().unwrap().ends_with("_other"));
    }

    #[test]
    fn exit_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        let folder = manager.resolve_temp_folder_name();
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("leftover.pkl"), b"x").unwrap();

        cleanup_at_exit();
        assert!(!folder.exists());
        // a second run has nothing left to do and must not fail
        cleanup_at_exit();
    }

    #[test]
    fn unlink_ignores_unmaterialized_folders() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        // the folder was never created; teardown must cope
        manager.unlink_temporary_resources(None);
        manager.unregister_temporary_resources(Some("ctx"));
        manager.try_delete_folder(true, None);
    }
}

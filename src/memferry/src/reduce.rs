use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use bincode::{Decode, Encode};
use ndview::{Array, MmapMode};
use parking_lot::Mutex;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::{
    config::{Prewarm, TransportOptions},
    error::Result,
    store,
    tempdir::SYSTEM_SHARED_MEM_FS,
    tracker::{tracker, ResourceKind},
    weakmap::WeakArrayKeyMap,
    wire::{self, Descriptor, InlineArray, Payload},
};

/// Folder-path resolver handed to reducers. Closes over shared state only,
/// never over the pool that owns it.
pub type TempFolderResolver = Arc<dyn Fn() -> PathBuf + Send + Sync>;

/// Backing files this process received from a peer. Views over these may
/// travel back by reference (their cleanup is refcounted); any mapping a
/// process made on its own is copied instead, because the receiver could
/// never coordinate its deletion.
fn transport_owned_mmaps() -> &'static Mutex<HashSet<PathBuf>> {
    static OWNED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OWNED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Stable per-thread number used in backing-file names. Together with the
/// pid it makes orphaned files attributable after a hard kill; uniqueness
/// comes from the uuid.
fn current_thread_num() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    thread_local! {
        static THREAD_NUM: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_NUM.with(|n| *n)
}

struct ReducerState {
    dumped: WeakArrayKeyMap<String>,
    emitted: HashSet<PathBuf>,
}

/// Coordinator-side reducer: decides, per argument, between reusing an
/// existing mapped file, dumping to a fresh backing file, and inlining.
///
/// Clones share the dedup state, so one reducer can serve every thread of a
/// pool.
#[derive(Clone)]
pub struct ForwardReducer {
    max_nbytes: Option<u64>,
    resolver: TempFolderResolver,
    mmap_mode: MmapMode,
    prewarm: Prewarm,
    unlink_on_gc_collect: bool,
    verbose: u32,
    state: Arc<Mutex<ReducerState>>,
}

impl ForwardReducer {
    pub fn new(resolver: TempFolderResolver, options: &TransportOptions) -> Self {
        Self {
            max_nbytes: options.max_nbytes,
            resolver,
            // w+ must never reach the wire
            mmap_mode: options.mmap_mode.canonicalize(),
            prewarm: options.prewarm,
            unlink_on_gc_collect: options.unlink_on_gc_collect,
            verbose: options.verbose,
            state: Arc::new(Mutex::new(ReducerState {
                dumped: WeakArrayKeyMap::new(),
                emitted: HashSet::new(),
            })),
        }
    }

    /// Reduce one outgoing argument.
    pub fn reduce(&self, a: &Array) -> Result<Payload> {
        if a.backing_mmap().is_some() {
            // already file-backed: ship the view, never a new file
            if self.verbose > 1 {
                info!("reusing the backing file of a mapped view, shape {:?}", a.shape());
            }
            return Ok(Payload::View(wire::encode_view(a, false)?));
        }

        if !a.dtype().is_opaque()
            && self
                .max_nbytes
                .is_some_and(|max| a.nbytes() as u64 > max)
        {
            return self.reduce_via_backing_file(a);
        }

        if self.verbose > 1 {
            info!("inlining array of shape {:?} dtype {}", a.shape(), a.dtype());
        } else {
            trace!("inlining array of shape {:?} dtype {}", a.shape(), a.dtype());
        }
        Ok(Payload::Inline(InlineArray::from_array(a)))
    }

    fn reduce_via_backing_file(&self, a: &Array) -> Result<Payload> {
        let folder = (self.resolver)();
        store::ensure_pool_folder(&folder)?;

        let (filename, is_new) = {
            let mut state = self.state.lock();
            let basename = match state.dumped.get(a) {
                Some(name) => name,
                None => {
                    let name = format!(
                        "{}-{}-{}.pkl",
                        process::id(),
                        current_thread_num(),
                        Uuid::new_v4().simple()
                    );
                    state.dumped.set(a, name.clone());
                    name
                }
            };
            let filename = folder.join(basename);
            let is_new = state.emitted.insert(filename.clone());
            (filename, is_new)
        };

        if self.unlink_on_gc_collect {
            // one reference per send, paid back by the receiving view's
            // finalizer
            tracker().register(&filename, ResourceKind::File);
        }
        if is_new {
            // one extra reference held for the whole batch, paid back by
            // unlink_temporary_resources; taken before the descriptor can
            // reach a worker so an early finalizer cannot win the race
            tracker().register(&filename, ResourceKind::File);
        }

        let offset = store::file_layout(a)?;
        if !filename.exists() {
            if self.verbose > 0 {
                info!(
                    "dumping array of shape {:?} dtype {} to {}",
                    a.shape(),
                    a.dtype(),
                    filename.display()
                );
            } else {
                debug!(
                    "dumping array of shape {:?} dtype {} to {}",
                    a.shape(),
                    a.dtype(),
                    filename.display()
                );
            }
            let written = store::dump_array(a, &filename)?;
            debug_assert_eq!(written, offset);
            if self.effective_prewarm(&folder) {
                let (lo, hi) = a.byte_bounds();
                store::prewarm_file(&filename, offset, hi - lo)?;
            }
        } else if self.verbose > 1 {
            info!("reusing backing file {}", filename.display());
        }

        let (order, strides, total_buffer_len) = wire::view_layout(a);
        Ok(Payload::Stored(Descriptor {
            filename: wire::utf8_path(&filename)?,
            dtype: a.dtype(),
            mode: self.mmap_mode,
            offset,
            order,
            shape: a.shape().iter().map(|&n| n as u64).collect(),
            strides,
            total_buffer_len,
            unlink_on_gc: self.unlink_on_gc_collect,
        }))
    }

    fn effective_prewarm(&self, folder: &Path) -> bool {
        match self.prewarm {
            Prewarm::Always => true,
            Prewarm::Never => false,
            Prewarm::Auto => !folder.starts_with(SYSTEM_SHARED_MEM_FS),
        }
    }

    /// Freeze the reducer for shipping to a worker. The dedup state stays
    /// behind: liveness of coordinator arrays means nothing elsewhere.
    pub fn to_handle(&self) -> Result<ReducerHandle> {
        Ok(ReducerHandle {
            max_nbytes: self.max_nbytes,
            temp_folder: wire::utf8_path(&(self.resolver)())?,
            mmap_mode: self.mmap_mode,
            prewarm: self.prewarm,
            unlink_on_gc_collect: self.unlink_on_gc_collect,
            verbose: self.verbose,
        })
    }

    pub fn from_handle(handle: &ReducerHandle) -> Self {
        let folder = PathBuf::from(&handle.temp_folder);
        let resolver: TempFolderResolver = Arc::new(move || folder.clone());
        Self {
            max_nbytes: handle.max_nbytes,
            resolver,
            mmap_mode: handle.mmap_mode.canonicalize(),
            prewarm: handle.prewarm,
            unlink_on_gc_collect: handle.unlink_on_gc_collect,
            verbose: handle.verbose,
            state: Arc::new(Mutex::new(ReducerState {
                dumped: WeakArrayKeyMap::new(),
                emitted: HashSet::new(),
            })),
        }
    }
}

/// Wire form of a forward reducer: its options and the already-resolved
/// pool folder, nothing process-local.
#[derive(Debug, Clone, Encode, Decode)]
pub struct ReducerHandle {
    pub max_nbytes: Option<u64>,
    pub temp_folder: String,
    pub mmap_mode: MmapMode,
    pub prewarm: Prewarm,
    pub unlink_on_gc_collect: bool,
    pub verbose: u32,
}

/// Worker-side reducer. Workers never create backing files: only views over
/// transport-owned maps go back by reference, everything else is copied.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackwardReducer;

impl BackwardReducer {
    pub fn reduce(&self, a: &Array) -> Result<Payload> {
        if let Some(region) = a.backing_mmap() {
            if transport_owned_mmaps().lock().contains(region.path()) {
                return Ok(Payload::View(wire::encode_view(a, false)?));
            }
        }
        // a fresh allocation, or a mapping whose lifetime the receiver
        // could not coordinate: copy it
        Ok(Payload::Inline(InlineArray::from_array(a)))
    }
}

/// Receiving side of the transport: open or rebuild the array a payload
/// describes.
pub fn materialize(payload: Payload) -> Result<Array> {
    match payload {
        Payload::Stored(d) => {
            let mut region = wire::open_region(&d)?;
            let path = region.path().to_owned();
            transport_owned_mmaps().lock().insert(path.clone());
            if d.unlink_on_gc {
                debug!("adding unlink finalizer for {}", path.display());
                region.set_drop_hook(move || {
                    tracker().maybe_unlink(&path, ResourceKind::File);
                });
            }
            wire::view_from_region(&d, region)
        }
        Payload::View(d) => wire::decode_view(&d),
        Payload::Inline(inline) => inline.into_array(),
    }
}

/// Build the reducer pair the outer pool installs for array arguments.
pub fn get_memmapping_reducers(
    resolver: TempFolderResolver,
    options: &TransportOptions,
) -> (ForwardReducer, BackwardReducer) {
    (ForwardReducer::new(resolver, options), BackwardReducer)
}

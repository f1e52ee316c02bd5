//! Zero-copy transport of large numeric arrays between cooperating
//! processes.
//!
//! Arguments above a size threshold are dumped once to a memory-mapped file
//! on a fast temporary filesystem and cross the process boundary as compact
//! descriptors; arguments that are already views over a mapped file travel
//! as descriptors without any copy at all. Identical re-sends of one array
//! share one backing file, and a per-process resource tracker refcounts the
//! files so the last process referencing one removes it.

pub mod config;
pub mod context;
pub mod disk;
pub mod reduce;
pub mod store;
pub mod tempdir;
pub mod tracker;
pub mod weakmap;
pub mod wire;

mod error;

pub use config::{Prewarm, TransportOptions, DEFAULT_MAX_NBYTES};
pub use context::TemporaryResourcesManager;
pub use error::{Error, Result};
pub use reduce::{
    get_memmapping_reducers, materialize, BackwardReducer, ForwardReducer, ReducerHandle,
    TempFolderResolver,
};
pub use weakmap::WeakArrayKeyMap;
pub use wire::{decode_view, encode_view, Descriptor, InlineArray, Payload};

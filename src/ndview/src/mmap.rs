use std::{
    fmt,
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::OnceLock,
};

use bincode::{Decode, Encode};
use memmap2::{Mmap, MmapMut, MmapOptions};
use thiserror::Error;

/// How a file-backed window is shared with the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum MmapMode {
    /// `r`: strictly read-shared.
    Read,
    /// `r+`: shared, writes go back to the file.
    ReadWrite,
    /// `c`: copy-on-write, writes stay private to this mapping.
    CopyOnWrite,
    /// `w+`: accepted from configuration and peers for compatibility, but
    /// canonicalized to `r+` before any file is opened so a receiver never
    /// zeroes data that another process is reading.
    WriteNew,
}

#[derive(Debug, Error)]
#[error("unknown mmap mode {0:?} (expected one of r, r+, c, w+)")]
pub struct ParseMmapModeError(String);

impl MmapMode {
    pub fn canonicalize(self) -> Self {
        match self {
            MmapMode::WriteNew => MmapMode::ReadWrite,
            mode => mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MmapMode::Read => "r",
            MmapMode::ReadWrite => "r+",
            MmapMode::CopyOnWrite => "c",
            MmapMode::WriteNew => "w+",
        }
    }
}

impl FromStr for MmapMode {
    type Err = ParseMmapModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" => Ok(MmapMode::Read),
            "r+" => Ok(MmapMode::ReadWrite),
            "c" => Ok(MmapMode::CopyOnWrite),
            "w+" => Ok(MmapMode::WriteNew),
            _ => Err(ParseMmapModeError(s.to_owned())),
        }
    }
}

impl fmt::Display for MmapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum MapVariant {
    Ro(Mmap),
    Rw(MmapMut),
    Cow(MmapMut),
}

impl MapVariant {
    fn bytes(&self) -> &[u8] {
        match self {
            MapVariant::Ro(map) => map.as_ref(),
            MapVariant::Rw(map) | MapVariant::Cow(map) => map.as_ref(),
        }
    }
}

type DropHook = Box<dyn FnOnce() + Send + Sync>;

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// A logical byte window `[file_offset, file_offset + len)` of a mapped
/// file.
///
/// The kernel wants page-aligned map offsets; callers don't. The region maps
/// from the enclosing page boundary and hides the delta, so `as_slice()` is
/// exactly the requested window.
pub struct MmapRegion {
    map: MapVariant,
    path: PathBuf,
    mode: MmapMode,
    file_offset: u64,
    delta: usize,
    len: usize,
    drop_hook: Option<DropHook>,
}

impl MmapRegion {
    pub fn open(path: &Path, mode: MmapMode, file_offset: u64, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty window",
            ));
        }
        let mode = mode.canonicalize();
        let file = OpenOptions::new()
            .read(true)
            .write(matches!(mode, MmapMode::ReadWrite))
            .open(path)?;

        // mapping past EOF would defer the failure to a fault on first touch
        let file_len = file.metadata()?.len();
        let end = file_offset + len as u64;
        if end > file_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "window {}..{} extends past end of file ({} bytes)",
                    file_offset, end, file_len
                ),
            ));
        }

        let map_start = file_offset - file_offset % page_size() as u64;
        let delta = (file_offset - map_start) as usize;
        let mut opts = MmapOptions::new();
        opts.offset(map_start).len(len + delta);
        let map = match mode {
            MmapMode::Read => MapVariant::Ro(unsafe { opts.map(&file)? }),
            MmapMode::ReadWrite | MmapMode::WriteNew => {
                MapVariant::Rw(unsafe { opts.map_mut(&file)? })
            }
            MmapMode::CopyOnWrite => MapVariant::Cow(unsafe { opts.map_copy(&file)? }),
        };

        Ok(Self {
            map,
            path: path.to_owned(),
            mode,
            file_offset,
            delta,
            len,
            drop_hook: None,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map.bytes()[self.delta..self.delta + self.len]
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode the file is mapped with; never `WriteNew`.
    pub fn mode(&self) -> MmapMode {
        self.mode
    }

    /// Offset of the window within the file.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `hook` when the region is dropped. The transport uses this to
    /// decrement the refcount of a temporary file once a received view dies.
    pub fn set_drop_hook(&mut self, hook: impl FnOnce() + Send + Sync + 'static) {
        self.drop_hook = Some(Box::new(hook));
    }
}

impl fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapRegion")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("file_offset", &self.file_offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Some(hook) = self.drop_hook.take() {
            hook();
        }
    }
}

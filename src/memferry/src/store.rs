use std::{
    fs,
    io::{self, BufWriter, Write},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use bincode::{Decode, Encode};
use ndview::{Array, DType, MmapMode, MmapRegion, Order};

use crate::{
    error::{Error, Result},
    wire,
};

/// Owner-only modes for everything the transport writes.
pub const FILE_PERMISSIONS: u32 = 0o600;
pub const FOLDER_PERMISSIONS: u32 = 0o700;

const STORE_MAGIC: [u8; 4] = *b"MFY1";

/// Payload bytes start on this boundary so contiguous views map back as
/// properly aligned slices.
const PAYLOAD_ALIGN: u64 = 64;

/// Stride used when touching pages during prewarm.
const PREWARM_STRIDE: usize = 4096;

/// Self-description written ahead of the payload window.
#[derive(Debug, Clone, Encode, Decode)]
struct StoreHeader {
    dtype: DType,
    order: Order,
    shape: Vec<u64>,
    strides: Option<Vec<i64>>,
    total_buffer_len: Option<u64>,
}

fn header_for(a: &Array) -> StoreHeader {
    let (order, strides, total_buffer_len) = wire::view_layout(a);
    StoreHeader {
        dtype: a.dtype(),
        order,
        shape: a.shape().iter().map(|&n| n as u64).collect(),
        strides,
        total_buffer_len,
    }
}

fn encoded_header(a: &Array) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(
        header_for(a),
        bincode::config::standard(),
    )?)
}

/// Byte offset at which the payload window of a dump of `a` starts. Pure in
/// `a`'s metadata, so descriptors for deduplicated re-sends never reopen
/// the file.
pub fn file_layout(a: &Array) -> Result<u64> {
    let header = encoded_header(a)?;
    Ok(((STORE_MAGIC.len() + header.len()) as u64).next_multiple_of(PAYLOAD_ALIGN))
}

/// Create the pool folder lazily with owner-only permissions, tolerating a
/// concurrent creation by a sibling process.
pub fn ensure_pool_folder(folder: &Path) -> Result<()> {
    if folder.is_dir() {
        return Ok(());
    }
    if let Err(e) = fs::create_dir_all(folder) {
        if e.kind() != io::ErrorKind::AlreadyExists {
            return Err(Error::io("create pool folder", folder, e));
        }
    }
    fs::set_permissions(folder, fs::Permissions::from_mode(FOLDER_PERMISSIONS))
        .map_err(|e| Error::io("chmod pool folder", folder, e))
}

/// Write `a`'s byte window to `path`: magic, header, zero padding up to the
/// payload boundary, then the raw window. The file is complete and chmod'd
/// owner-only before this returns; on failure the partial file is removed
/// before the error propagates. Returns the payload offset.
pub fn dump_array(a: &Array, path: &Path) -> Result<u64> {
    let header = encoded_header(a)?;
    let offset = ((STORE_MAGIC.len() + header.len()) as u64).next_multiple_of(PAYLOAD_ALIGN);

    let file = fs::File::create(path).map_err(|e| Error::io("create backing file", path, e))?;
    // receivers must never observe a torso
    let cleanup = scopeguard::guard((), |()| {
        let _ = fs::remove_file(path);
    });

    let written = (|| -> io::Result<()> {
        let mut writer = BufWriter::new(&file);
        writer.write_all(&STORE_MAGIC)?;
        writer.write_all(&header)?;
        let pad = offset as usize - STORE_MAGIC.len() - header.len();
        writer.write_all(&vec![0u8; pad])?;
        writer.write_all(a.byte_window())?;
        writer.flush()?;
        file.set_permissions(fs::Permissions::from_mode(FILE_PERMISSIONS))?;
        Ok(())
    })();

    match written {
        Ok(()) => {
            scopeguard::ScopeGuard::into_inner(cleanup);
            Ok(offset)
        }
        Err(e) => Err(Error::io("write backing file", path, e)),
    }
}

/// Touch every page of the payload window so the disk is read once in the
/// dumping process instead of once per worker.
pub fn prewarm_file(path: &Path, offset: u64, len: usize) -> Result<()> {
    let region =
        MmapRegion::open(path, MmapMode::Read, offset, len).map_err(|e| Error::io("prewarm", path, e))?;
    let bytes = region.as_slice();
    let mut checksum = 0u8;
    let mut pos = 0;
    while pos < bytes.len() {
        checksum ^= bytes[pos];
        pos += PREWARM_STRIDE;
    }
    checksum ^= bytes[bytes.len() - 1];
    std::hint::black_box(checksum);
    Ok(())
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::MetadataExt;

    use ndview::Element;

    use super::*;

    #[test]
    fn dump_places_payload_at_layout_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pkl");
        let a = Array::from_vec((0..100i64).collect(), &[100]).unwrap();

        let offset = dump_array(&a, &path).unwrap();
        assert_eq!(offset, file_layout(&a).unwrap());
        assert_eq!(offset % PAYLOAD_ALIGN, 0);

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), offset + a.nbytes() as u64);
        assert_eq!(meta.mode() & 0o777, FILE_PERMISSIONS);

        let region = MmapRegion::open(&path, MmapMode::Read, offset, a.nbytes()).unwrap();
        assert_eq!(region.as_slice(), a.byte_window());
    }

    #[test]
    fn dump_of_strided_view_keeps_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.pkl");
        let a = Array::from_vec((0..24i32).collect(), &[4, 6]).unwrap();
        let s = a.slice(1, 1, 5);

        let offset = dump_array(&s, &path).unwrap();
        let (lo, hi) = s.byte_bounds();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), offset + (hi - lo) as u64);
    }

    #[test]
    fn pool_folder_is_owner_only_and_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("ctx");
        ensure_pool_folder(&folder).unwrap();
        let meta = fs::metadata(&folder).unwrap();
        assert_eq!(meta.mode() & 0o777, FOLDER_PERMISSIONS);
        // second call sees the folder and leaves it alone
        ensure_pool_folder(&folder).unwrap();
    }

    #[test]
    fn prewarm_reads_the_whole_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warm.pkl");
        let a = Array::from_vec((0..100_000u64).collect(), &[100_000]).unwrap();
        let offset = dump_array(&a, &path).unwrap();
        prewarm_file(&path, offset, a.nbytes()).unwrap();
    }

    #[test]
    fn header_layout_matches_element_type() {
        let a = Array::from_vec(vec![1.5f64, 2.5], &[2]).unwrap();
        let header = header_for(&a);
        assert_eq!(header.dtype, <f64 as Element>::DTYPE);
        assert_eq!(header.order, Order::C);
        assert!(header.strides.is_none());
    }
}

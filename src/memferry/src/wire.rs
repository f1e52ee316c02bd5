use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};
use ndview::{Array, DType, MmapMode, MmapRegion, Order};

use crate::error::{Error, Result};

/// Wire form of an array view over a mapped file. Field order is the wire
/// layout; `strides` and `total_buffer_len` travel only for views that are
/// neither C- nor F-contiguous.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Descriptor {
    pub filename: String,
    pub dtype: DType,
    pub mode: MmapMode,
    pub offset: u64,
    pub order: Order,
    pub shape: Vec<u64>,
    pub strides: Option<Vec<i64>>,
    pub total_buffer_len: Option<u64>,
    pub unlink_on_gc: bool,
}

/// Inline fallback: the elements themselves, gathered contiguously.
#[derive(Debug, Clone, Encode, Decode)]
pub struct InlineArray {
    pub dtype: DType,
    pub order: Order,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl InlineArray {
    pub fn from_array(a: &Array) -> Self {
        let order = if a.is_f_contiguous() && !a.is_c_contiguous() {
            Order::F
        } else {
            Order::C
        };
        Self {
            dtype: a.dtype(),
            order,
            shape: a.shape().iter().map(|&n| n as u64).collect(),
            data: a.to_contiguous(order),
        }
    }

    pub fn into_array(self) -> Result<Array> {
        let shape: Vec<usize> = self.shape.iter().map(|&n| n as usize).collect();
        Ok(Array::from_bytes_with_order(
            self.data, self.dtype, &shape, self.order,
        )?)
    }
}

/// One reduced argument as it crosses the process boundary.
#[derive(Debug, Clone, Encode, Decode)]
pub enum Payload {
    /// A temporary backing file created by the transport; receivers track
    /// it and take part in its refcounted cleanup.
    Stored(Descriptor),
    /// A view over a file that was already memory-mapped on the sending
    /// side; no ownership changes hands.
    View(Descriptor),
    /// A plain copy of the elements.
    Inline(InlineArray),
}

impl Payload {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (payload, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(payload)
    }
}

pub(crate) fn utf8_path(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::NonUtf8Path(path.to_owned()))
}

/// Layout of a view within its byte window: the contiguity order, plus
/// explicit strides and the window's element count when the view is not
/// contiguous either way.
pub(crate) fn view_layout(a: &Array) -> (Order, Option<Vec<i64>>, Option<u64>) {
    let c_contig = a.is_c_contiguous();
    let f_contig = a.is_f_contiguous();
    let order = if f_contig && !c_contig {
        Order::F
    } else {
        Order::C
    };
    if c_contig || f_contig {
        (order, None, None)
    } else {
        let (lo, hi) = a.byte_bounds();
        let strides = a.strides().iter().map(|&s| s as i64).collect();
        let total = ((hi - lo) / a.dtype().itemsize()) as u64;
        (order, Some(strides), Some(total))
    }
}

/// Describe `a` as a view over its backing mapped file. Pure: no file is
/// created, nothing is registered.
pub fn encode_view(a: &Array, unlink_on_gc: bool) -> Result<Descriptor> {
    let region = a.backing_mmap().ok_or(Error::NotMemmapBacked)?;
    let (lo, _) = a.byte_bounds();
    let (order, strides, total_buffer_len) = view_layout(a);

    Ok(Descriptor {
        filename: utf8_path(region.path())?,
        dtype: a.dtype(),
        // the region mode is canonical already, so w+ never hits the wire
        mode: region.mode(),
        offset: region.file_offset() + lo as u64,
        order,
        shape: a.shape().iter().map(|&n| n as u64).collect(),
        strides,
        total_buffer_len,
        unlink_on_gc,
    })
}

/// Open the file window a descriptor points at.
pub(crate) fn open_region(d: &Descriptor) -> Result<MmapRegion> {
    let path = PathBuf::from(&d.filename);
    // tolerate w+ from a peer: receivers must never zero shared data
    let mode = d.mode.canonicalize();
    let nelem = match &d.strides {
        None => d.shape.iter().product::<u64>(),
        Some(_) => d.total_buffer_len.ok_or(Error::MissingTotalLen)?,
    };
    let len = nelem as usize * d.dtype.itemsize();
    MmapRegion::open(&path, mode, d.offset, len).map_err(|e| Error::io("mmap", path, e))
}

/// Rebuild the sender's view over an opened region.
pub(crate) fn view_from_region(d: &Descriptor, region: MmapRegion) -> Result<Array> {
    let shape: Vec<usize> = d.shape.iter().map(|&n| n as usize).collect();
    let array = match &d.strides {
        None => Array::from_mmap(region, d.dtype, &shape, d.order)?,
        Some(strides) => {
            let strides: Vec<isize> = strides.iter().map(|&s| s as isize).collect();
            Array::from_mmap_strided(region, d.dtype, &shape, &strides)?
        }
    };
    Ok(array)
}

/// Reconstitute the array view a descriptor describes.
pub fn decode_view(d: &Descriptor) -> Result<Array> {
    let region = open_region(d)?;
    view_from_region(d, region)
}

#[cfg(test)]
mod test {
    use ndview::Element;

    use super::*;

    #[test]
    fn payload_bytes_round_trip() {
        let descriptor = Descriptor {
            filename: "/tmp/pool/1-0-abc.pkl".to_owned(),
            dtype: <f64 as Element>::DTYPE,
            mode: MmapMode::Read,
            offset: 64,
            order: Order::C,
            shape: vec![2, 3],
            strides: None,
            total_buffer_len: None,
            unlink_on_gc: true,
        };
        let bytes = Payload::Stored(descriptor).to_bytes().unwrap();
        match Payload::from_bytes(&bytes).unwrap() {
            Payload::Stored(d) => {
                assert_eq!(d.filename, "/tmp/pool/1-0-abc.pkl");
                assert_eq!(d.shape, vec![2, 3]);
                assert_eq!(d.offset, 64);
                assert!(d.unlink_on_gc);
            }
            other => panic!("wrong payload variant: {:?}", other),
        }
    }

    #[test]
    fn inline_round_trip_keeps_layout() {
        let a = Array::from_vec((0..12i32).collect(), &[3, 4]).unwrap();
        let t = a.transpose();
        let b = InlineArray::from_array(&t).into_array().unwrap();
        assert_eq!(b.shape(), t.shape());
        assert_eq!(b.to_vec::<i32>(), t.to_vec::<i32>());
        // the transpose of a C array gathers without copying, as F data
        assert!(b.is_f_contiguous());
    }

    #[test]
    fn contiguous_views_omit_strides() {
        let a = Array::from_vec((0..6i32).collect(), &[2, 3]).unwrap();
        let (order, strides, total) = view_layout(&a);
        assert_eq!(order, Order::C);
        assert!(strides.is_none());
        assert!(total.is_none());

        let (order, strides, total) = view_layout(&a.transpose());
        assert_eq!(order, Order::F);
        assert!(strides.is_none());
        assert!(total.is_none());
    }

    #[test]
    fn strided_views_carry_total_len() {
        let a = Array::from_vec((0..24i32).collect(), &[4, 6]).unwrap();
        let s = a.slice(1, 1, 5);
        let (order, strides, total) = view_layout(&s);
        assert_eq!(order, Order::C);
        assert_eq!(strides.unwrap(), vec![24, 4]);
        // the window runs from element [0,1] through [3,4]: 88 bytes
        assert_eq!(total.unwrap(), 22);
    }

    #[test]
    fn encode_refuses_heap_arrays() {
        let a = Array::from_vec(vec![1i32, 2], &[2]).unwrap();
        assert!(matches!(
            encode_view(&a, false),
            Err(Error::NotMemmapBacked)
        ));
    }
}

//! Rectangular numeric views over heap or memory-mapped byte buffers.
//!
//! An [`Array`] is a window into a shared [`Buffer`]: an element type, a
//! shape, byte strides and a byte offset. Views made from an array (slices,
//! transposes, reversals) share the same buffer, so "is this backed by a
//! mapped file" is a property of the allocation, not of the view.

mod dtype;
pub mod mmap;

pub use dtype::{ByteOrder, DType, Element, Kind};
pub use mmap::{MmapMode, MmapRegion};

use std::{fmt, sync::Arc};

use bincode::{Decode, Encode};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

pub type Shape = SmallVec<[usize; 4]>;
pub type Strides = SmallVec<[isize; 4]>;

/// Memory layout of a contiguous array: row-major or column-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Order {
    C,
    F,
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("view of shape {shape:?} needs {need} bytes but the buffer holds {have}")]
    OutOfBounds {
        shape: Vec<usize>,
        need: usize,
        have: usize,
    },
    #[error("expected {expected} data bytes for this shape, got {got}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("rank mismatch: shape has {shape} dims, strides has {strides}")]
    RankMismatch { shape: usize, strides: usize },
}

/// Backing storage of an [`Array`]: an owned heap allocation or a window of
/// a memory-mapped file.
pub struct Buffer(Repr);

enum Repr {
    Heap(Box<[u8]>),
    Mapped(MmapRegion),
}

impl Buffer {
    pub fn bytes(&self) -> &[u8] {
        match &self.0 {
            Repr::Heap(bytes) => bytes,
            Repr::Mapped(region) => region.as_slice(),
        }
    }

    pub fn mmap(&self) -> Option<&MmapRegion> {
        match &self.0 {
            Repr::Mapped(region) => Some(region),
            Repr::Heap(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Heap(bytes) => f.debug_tuple("Heap").field(&bytes.len()).finish(),
            Repr::Mapped(region) => f.debug_tuple("Mapped").field(region).finish(),
        }
    }
}

/// Strides of a contiguous layout over `shape`, in bytes.
pub fn strides_for(shape: &[usize], itemsize: usize, order: Order) -> Strides {
    let mut strides: Strides = smallvec![0; shape.len()];
    let mut step = itemsize as isize;
    match order {
        Order::C => {
            for axis in (0..shape.len()).rev() {
                strides[axis] = step;
                step *= shape[axis] as isize;
            }
        }
        Order::F => {
            for axis in 0..shape.len() {
                strides[axis] = step;
                step *= shape[axis] as isize;
            }
        }
    }
    strides
}

/// Span, in bytes, that negative strides reach below element `[0, …, 0]`.
fn negative_span(shape: &[usize], strides: &[isize]) -> usize {
    shape
        .iter()
        .zip(strides)
        .map(|(&n, &s)| {
            if s < 0 && n > 1 {
                (-s) as usize * (n - 1)
            } else {
                0
            }
        })
        .sum()
}

#[derive(Debug, Clone)]
pub struct Array {
    buf: Arc<Buffer>,
    dtype: DType,
    offset: usize,
    shape: Shape,
    strides: Strides,
}

impl Array {
    /// Own `data` as a C-ordered array of the given shape.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self, ViewError> {
        Self::from_vec_with_order(data, shape, Order::C)
    }

    /// Own `data` as an array of the given shape; `data` is interpreted as
    /// the flat buffer in the requested layout.
    pub fn from_vec_with_order<T: Element>(
        data: Vec<T>,
        shape: &[usize],
        order: Order,
    ) -> Result<Self, ViewError> {
        let nelem: usize = shape.iter().product();
        if nelem != data.len() {
            return Err(ViewError::SizeMismatch {
                expected: nelem * std::mem::size_of::<T>(),
                got: std::mem::size_of_val(&data[..]),
            });
        }
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        Ok(Self {
            buf: Arc::new(Buffer(Repr::Heap(bytes.to_vec().into_boxed_slice()))),
            dtype: T::DTYPE,
            offset: 0,
            shape: Shape::from_slice(shape),
            strides: strides_for(shape, T::DTYPE.itemsize(), order),
        })
    }

    /// Own raw `data` under an explicit dtype, C order.
    pub fn from_bytes(data: Vec<u8>, dtype: DType, shape: &[usize]) -> Result<Self, ViewError> {
        Self::from_bytes_with_order(data, dtype, shape, Order::C)
    }

    pub fn from_bytes_with_order(
        data: Vec<u8>,
        dtype: DType,
        shape: &[usize],
        order: Order,
    ) -> Result<Self, ViewError> {
        let nelem: usize = shape.iter().product();
        let expected = nelem * dtype.itemsize();
        if expected != data.len() {
            return Err(ViewError::SizeMismatch {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            buf: Arc::new(Buffer(Repr::Heap(data.into_boxed_slice()))),
            dtype,
            offset: 0,
            shape: Shape::from_slice(shape),
            strides: strides_for(shape, dtype.itemsize(), order),
        })
    }

    /// Contiguous view of the given layout over a mapped window.
    pub fn from_mmap(
        region: MmapRegion,
        dtype: DType,
        shape: &[usize],
        order: Order,
    ) -> Result<Self, ViewError> {
        let nelem: usize = shape.iter().product();
        let need = nelem * dtype.itemsize();
        if need > region.len() {
            return Err(ViewError::OutOfBounds {
                shape: shape.to_vec(),
                need,
                have: region.len(),
            });
        }
        Ok(Self {
            buf: Arc::new(Buffer(Repr::Mapped(region))),
            dtype,
            offset: 0,
            shape: Shape::from_slice(shape),
            strides: strides_for(shape, dtype.itemsize(), order),
        })
    }

    /// Strided view over a mapped window. Element `[0, …, 0]` is placed past
    /// the span of the negative strides, so the lowest addressed byte of the
    /// view is the window start and negative strides stay in bounds.
    pub fn from_mmap_strided(
        region: MmapRegion,
        dtype: DType,
        shape: &[usize],
        strides: &[isize],
    ) -> Result<Self, ViewError> {
        if shape.len() != strides.len() {
            return Err(ViewError::RankMismatch {
                shape: shape.len(),
                strides: strides.len(),
            });
        }
        let array = Self {
            buf: Arc::new(Buffer(Repr::Mapped(region))),
            dtype,
            offset: negative_span(shape, strides),
            shape: Shape::from_slice(shape),
            strides: Strides::from_slice(strides),
        };
        let (_, hi) = array.byte_bounds();
        if hi > array.buf.len() {
            return Err(ViewError::OutOfBounds {
                shape: shape.to_vec(),
                need: hi,
                have: array.buf.len(),
            });
        }
        Ok(array)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Byte offset of element `[0, …, 0]` within the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype.itemsize()
    }

    /// The shared backing allocation; its address is the identity of the
    /// array for deduplication purposes.
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buf
    }

    /// The mapped region backing this view, if its allocation is a mapped
    /// file rather than heap memory.
    pub fn backing_mmap(&self) -> Option<&MmapRegion> {
        self.buf.mmap()
    }

    pub fn is_c_contiguous(&self) -> bool {
        let mut step = self.dtype.itemsize() as isize;
        for (&n, &s) in self.shape.iter().zip(&self.strides).rev() {
            if n == 0 {
                return true;
            }
            if n != 1 {
                if s != step {
                    return false;
                }
                step *= n as isize;
            }
        }
        true
    }

    pub fn is_f_contiguous(&self) -> bool {
        let mut step = self.dtype.itemsize() as isize;
        for (&n, &s) in self.shape.iter().zip(&self.strides) {
            if n == 0 {
                return true;
            }
            if n != 1 {
                if s != step {
                    return false;
                }
                step *= n as isize;
            }
        }
        true
    }

    /// Lowest and one-past-highest byte of the view within its buffer.
    /// Equal for empty arrays.
    pub fn byte_bounds(&self) -> (usize, usize) {
        if self.len() == 0 {
            return (self.offset, self.offset);
        }
        let mut lo = self.offset as isize;
        let mut hi = self.offset as isize;
        for (&n, &s) in self.shape.iter().zip(&self.strides) {
            let span = s * (n as isize - 1);
            if span < 0 {
                lo += span;
            } else {
                hi += span;
            }
        }
        hi += self.dtype.itemsize() as isize;
        (lo as usize, hi as usize)
    }

    /// The `[lo, hi)` byte run of the buffer this view touches.
    pub fn byte_window(&self) -> &[u8] {
        let (lo, hi) = self.byte_bounds();
        &self.buf.bytes()[lo..hi]
    }

    /// View with reversed axes; shares the buffer.
    pub fn transpose(&self) -> Array {
        let mut out = self.clone();
        out.shape.reverse();
        out.strides.reverse();
        out
    }

    /// View of `start..end` along `axis`; shares the buffer.
    pub fn slice(&self, axis: usize, start: usize, end: usize) -> Array {
        assert!(
            axis < self.ndim() && start <= end && end <= self.shape[axis],
            "slice {}..{} out of bounds on axis {}",
            start,
            end,
            axis
        );
        let mut out = self.clone();
        out.shape[axis] = end - start;
        if end > start {
            out.offset = (out.offset as isize + self.strides[axis] * start as isize) as usize;
        }
        out
    }

    /// View with `axis` running backwards (negative stride); shares the
    /// buffer.
    pub fn reversed(&self, axis: usize) -> Array {
        assert!(axis < self.ndim(), "axis {} out of bounds", axis);
        let mut out = self.clone();
        let n = self.shape[axis];
        if n > 0 {
            out.offset = (out.offset as isize + self.strides[axis] * (n as isize - 1)) as usize;
        }
        out.strides[axis] = -self.strides[axis];
        out
    }

    fn element_offset(&self, index: &[usize]) -> usize {
        assert_eq!(index.len(), self.ndim(), "index rank mismatch");
        let mut off = self.offset as isize;
        for ((&i, &n), &s) in index.iter().zip(&self.shape).zip(&self.strides) {
            assert!(i < n, "index {} out of bounds for axis of length {}", i, n);
            off += i as isize * s;
        }
        off as usize
    }

    /// Read one element; tolerates unaligned storage.
    pub fn get<T: Element>(&self, index: &[usize]) -> T {
        assert_eq!(T::DTYPE, self.dtype, "dtype mismatch");
        let off = self.element_offset(index);
        bytemuck::pod_read_unaligned(&self.buf.bytes()[off..off + self.dtype.itemsize()])
    }

    /// Gather the elements into a fresh contiguous byte run of the given
    /// layout. Contiguous views are a plain copy of their byte window.
    pub fn to_contiguous(&self, order: Order) -> Vec<u8> {
        let itemsize = self.dtype.itemsize();
        let mut out = Vec::with_capacity(self.nbytes());
        if self.len() == 0 {
            return out;
        }
        let already = match order {
            Order::C => self.is_c_contiguous(),
            Order::F => self.is_f_contiguous(),
        };
        if already {
            out.extend_from_slice(self.byte_window());
            return out;
        }

        let bytes = self.buf.bytes();
        let mut index: Shape = smallvec![0; self.ndim()];
        for _ in 0..self.len() {
            let off = self.element_offset(&index);
            out.extend_from_slice(&bytes[off..off + itemsize]);
            advance(&mut index, &self.shape, order);
        }
        out
    }

    /// The elements in C order.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        assert_eq!(T::DTYPE, self.dtype, "dtype mismatch");
        bytemuck::pod_collect_to_vec(&self.to_contiguous(Order::C))
    }
}

fn advance(index: &mut [usize], shape: &[usize], order: Order) {
    match order {
        Order::C => {
            for axis in (0..shape.len()).rev() {
                index[axis] += 1;
                if index[axis] < shape[axis] {
                    return;
                }
                index[axis] = 0;
            }
        }
        Order::F => {
            for axis in 0..shape.len() {
                index[axis] += 1;
                if index[axis] < shape[axis] {
                    return;
                }
                index[axis] = 0;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arange(n: usize) -> Vec<i32> {
        (0..n as i32).collect()
    }

    #[test]
    fn c_and_f_strides() {
        assert_eq!(strides_for(&[2, 3, 4], 4, Order::C)[..], [48, 16, 4]);
        assert_eq!(strides_for(&[2, 3, 4], 4, Order::F)[..], [4, 8, 24]);
    }

    #[test]
    fn from_vec_is_c_contiguous() {
        let a = Array::from_vec(arange(24), &[2, 3, 4]).unwrap();
        assert!(a.is_c_contiguous());
        assert!(!a.is_f_contiguous());
        assert_eq!(a.nbytes(), 96);
        assert_eq!(a.get::<i32>(&[1, 2, 3]), 23);
        assert_eq!(a.byte_bounds(), (0, 96));
    }

    #[test]
    fn transpose_swaps_strides() {
        let a = Array::from_vec(arange(12), &[3, 4]).unwrap();
        let t = a.transpose();
        assert_eq!(t.shape(), &[4, 3]);
        assert!(!t.is_c_contiguous());
        assert!(t.is_f_contiguous());
        for i in 0..4 {
            for j in 0..3 {
                assert_eq!(t.get::<i32>(&[i, j]), a.get::<i32>(&[j, i]));
            }
        }
    }

    #[test]
    fn slice_offsets_into_buffer() {
        let a = Array::from_vec(arange(10), &[10]).unwrap();
        let s = a.slice(0, 3, 7);
        assert_eq!(s.shape(), &[4]);
        assert_eq!(s.offset(), 12);
        assert_eq!(s.to_vec::<i32>(), vec![3, 4, 5, 6]);
        assert!(Arc::ptr_eq(a.buffer(), s.buffer()));
    }

    #[test]
    fn reversed_has_negative_stride() {
        let a = Array::from_vec(arange(5), &[5]).unwrap();
        let r = a.reversed(0);
        assert_eq!(r.strides(), &[-4]);
        assert_eq!(r.to_vec::<i32>(), vec![4, 3, 2, 1, 0]);
        // bounds still cover the same window
        assert_eq!(r.byte_bounds(), (0, 20));
    }

    #[test]
    fn byte_bounds_of_inner_slice() {
        let a = Array::from_vec(arange(12), &[3, 4]).unwrap();
        let s = a.slice(0, 1, 3).slice(1, 1, 3);
        assert_eq!(s.shape(), &[2, 2]);
        let (lo, hi) = s.byte_bounds();
        assert_eq!(lo, 20);
        assert_eq!(hi, 44);
    }

    #[test]
    fn gather_transposed_to_c_order() {
        let a = Array::from_vec(arange(6), &[2, 3]).unwrap();
        let t = a.transpose();
        let gathered = t.to_contiguous(Order::C);
        let elems: Vec<i32> = bytemuck::pod_collect_to_vec(&gathered);
        assert_eq!(elems, vec![0, 3, 1, 4, 2, 5]);
        // gathering a C-contiguous view back in F order round-trips
        let f = t.to_contiguous(Order::F);
        let elems: Vec<i32> = bytemuck::pod_collect_to_vec(&f);
        assert_eq!(elems, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn size_one_dims_do_not_break_contiguity() {
        let a = Array::from_vec(arange(4), &[1, 4]).unwrap();
        assert!(a.is_c_contiguous());
        let t = a.transpose();
        assert!(t.is_c_contiguous());
        assert!(t.is_f_contiguous());
    }

    #[test]
    fn scalar_array() {
        let a = Array::from_vec(vec![7i32], &[]).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a.nbytes(), 4);
        assert_eq!(a.get::<i32>(&[]), 7);
        assert_eq!(a.byte_bounds(), (0, 4));
    }

    #[test]
    fn empty_array() {
        let a = Array::from_vec(Vec::<i32>::new(), &[0, 3]).unwrap();
        assert!(a.is_empty());
        assert!(a.is_c_contiguous());
        assert_eq!(a.byte_bounds(), (0, 0));
        assert!(a.to_contiguous(Order::C).is_empty());
    }

    #[test]
    fn shape_data_mismatch_is_rejected() {
        assert!(Array::from_vec(arange(5), &[2, 3]).is_err());
        let bytes = vec![0u8; 7];
        assert!(Array::from_bytes(bytes, <i32 as Element>::DTYPE, &[2]).is_err());
    }

    #[test]
    fn f_order_from_vec() {
        // column-major data: columns of [[0, 2, 4], [1, 3, 5]]
        let a = Array::from_vec_with_order(arange(6), &[2, 3], Order::F).unwrap();
        assert!(a.is_f_contiguous());
        assert_eq!(a.get::<i32>(&[0, 0]), 0);
        assert_eq!(a.get::<i32>(&[1, 0]), 1);
        assert_eq!(a.get::<i32>(&[0, 1]), 2);
        assert_eq!(a.to_vec::<i32>(), vec![0, 2, 4, 1, 3, 5]);
    }
}

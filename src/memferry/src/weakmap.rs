use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use bincode::{enc::Encoder, error::EncodeError};
use ndview::{Array, Buffer, DType, Shape, Strides};

/// Identity of one array view: the backing allocation plus the window
/// geometry. Two handles over the same allocation with the same geometry
/// are the same logical array; equal contents in distinct allocations are
/// not.
#[derive(Clone, PartialEq, Eq, Hash)]
struct ViewKey {
    base: usize,
    offset: usize,
    dtype: DType,
    shape: Shape,
    strides: Strides,
}

impl ViewKey {
    fn of(a: &Array) -> Self {
        Self {
            base: Arc::as_ptr(a.buffer()) as usize,
            offset: a.offset(),
            dtype: a.dtype(),
            shape: Shape::from_slice(a.shape()),
            strides: Strides::from_slice(a.strides()),
        }
    }
}

/// Map from live array views to values, keyed by identity.
///
/// Array views cannot be value-hashed (hashing element data would collide
/// with indexing semantics and cost a full pass per lookup), so entries key
/// on the allocation address and hold a weak reference to weed out reused
/// addresses: a dead or mismatching reference is a miss, and dead entries
/// are swept once the map grows past a watermark.
pub struct WeakArrayKeyMap<V> {
    data: HashMap<ViewKey, (Weak<Buffer>, V)>,
    purge_watermark: usize,
}

impl<V: Clone> WeakArrayKeyMap<V> {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            purge_watermark: 8,
        }
    }

    pub fn get(&mut self, a: &Array) -> Option<V> {
        let key = ViewKey::of(a);
        let (weak, value) = self.data.get(&key)?;
        match weak.upgrade() {
            Some(live) if Arc::ptr_eq(&live, a.buffer()) => Some(value.clone()),
            // the allocation died and its address was reused by another
            // buffer: a miss, and the stale entry goes
            _ => {
                self.data.remove(&key);
                None
            }
        }
    }

    pub fn set(&mut self, a: &Array, value: V) {
        if self.data.len() >= self.purge_watermark {
            self.data.retain(|_, (weak, _)| weak.strong_count() > 0);
            self.purge_watermark = (self.data.len() * 2).max(8);
        }
        self.data
            .insert(ViewKey::of(a), (Arc::downgrade(a.buffer()), value));
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<V: Clone> Default for WeakArrayKeyMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The map tracks liveness of allocations in this process only; shipping it
/// to another process would carry dangling identities.
impl<V> bincode::Encode for WeakArrayKeyMap<V> {
    fn encode<E: Encoder>(&self, _encoder: &mut E) -> Result<(), EncodeError> {
        Err(EncodeError::Other(
            "WeakArrayKeyMap is not transferable across processes",
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arr(n: usize) -> Array {
        Array::from_vec((0..n as i64).collect(), &[n]).unwrap()
    }

    #[test]
    fn get_after_set() {
        let mut map = WeakArrayKeyMap::new();
        let a = arr(4);
        map.set(&a, "a".to_owned());
        assert_eq!(map.get(&a).as_deref(), Some("a"));
    }

    #[test]
    fn clones_share_identity() {
        let mut map = WeakArrayKeyMap::new();
        let a = arr(4);
        let b = a.clone();
        map.set(&a, 1u32);
        assert_eq!(map.get(&b), Some(1));
    }

    #[test]
    fn equal_contents_are_distinct_keys() {
        let mut map = WeakArrayKeyMap::new();
        let a = arr(4);
        let b = arr(4);
        map.set(&a, 1u32);
        assert_eq!(map.get(&b), None);
        map.set(&b, 2);
        assert_eq!(map.get(&a), Some(1));
        assert_eq!(map.get(&b), Some(2));
    }

    #[test]
    fn different_views_of_one_buffer_are_distinct_keys() {
        let mut map = WeakArrayKeyMap::new();
        let a = arr(8);
        let s = a.slice(0, 2, 6);
        map.set(&a, 1u32);
        assert_eq!(map.get(&s), None);
    }

    #[test]
    fn dead_entries_miss() {
        let mut map = WeakArrayKeyMap::new();
        let a = arr(4);
        map.set(&a, 1u32);
        drop(a);
        // an identical-looking array can only hit if the stored weak ref
        // still points at its allocation
        let b = arr(4);
        assert_eq!(map.get(&b), None);
    }

    #[test]
    fn sweep_keeps_live_entries() {
        let mut map = WeakArrayKeyMap::new();
        let keep = arr(2);
        map.set(&keep, 0u32);
        for i in 0..32 {
            let tmp = arr(3);
            map.set(&tmp, i);
        }
        assert!(map.len() < 32, "dead entries were never swept");
        assert_eq!(map.get(&keep), Some(0));
    }

    #[test]
    fn refuses_serialization() {
        let mut map = WeakArrayKeyMap::new();
        map.set(&arr(2), 1u32);
        let err = bincode::encode_to_vec(&map, bincode::config::standard());
        assert!(err.is_err());
    }
}

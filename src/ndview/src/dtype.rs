use std::fmt;

use bincode::{Decode, Encode};

/// Element categories the transport understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Kind {
    Int,
    Uint,
    Float,
    /// Elements that own handles (boxed values, pointers). These can travel
    /// inline but must never be memory-mapped.
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// Element type tag: category, item size in bytes, byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct DType {
    pub kind: Kind,
    pub size: u8,
    pub order: ByteOrder,
}

impl DType {
    pub const fn new(kind: Kind, size: u8) -> Self {
        Self {
            kind,
            size,
            order: ByteOrder::native(),
        }
    }

    pub fn itemsize(&self) -> usize {
        self.size as usize
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.kind, Kind::Opaque)
    }

    /// Canonical printable tag, e.g. `<i4`, `>f8`, `|O8`.
    pub fn tag(&self) -> String {
        let order = match (self.kind, self.order) {
            (Kind::Opaque, _) => '|',
            (_, ByteOrder::Little) => '<',
            (_, ByteOrder::Big) => '>',
        };
        let kind = match self.kind {
            Kind::Int => 'i',
            Kind::Uint => 'u',
            Kind::Float => 'f',
            Kind::Opaque => 'O',
        };
        format!("{}{}{}", order, kind, self.size)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Scalars that can live in an array buffer without owning anything.
pub trait Element: bytemuck::Pod {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $kind:expr),* $(,)?) => {$(
        impl Element for $ty {
            const DTYPE: DType = DType::new($kind, std::mem::size_of::<$ty>() as u8);
        }
    )*};
}

impl_element! {
    i8 => Kind::Int,
    i16 => Kind::Int,
    i32 => Kind::Int,
    i64 => Kind::Int,
    u8 => Kind::Uint,
    u16 => Kind::Uint,
    u32 => Kind::Uint,
    u64 => Kind::Uint,
    f32 => Kind::Float,
    f64 => Kind::Float,
}

//! Binary struct/union wire codec.
//!
//! Wire layout: little-endian, 8-byte aligned throughout. Every struct,
//! array, and union payload begins with an 8-byte [`DataHeader`] carrying a
//! byte size and an element-count-or-version word. Pointers are signed
//! 64-bit offsets relative to the pointer field's own position; offset 0
//! encodes null. Handles are 4-byte indices into the message's side handle
//! list, with -1 for null. Booleans pack 8 per byte, LSB-first.
//!
//! Encoding is append-only and depth-first: writing a nested value records a
//! relative pointer to the current end of buffer and recurses a sub-encoder
//! rooted there. Decoding enforces strictly increasing, aligned memory and
//! handle claims through a [`Validator`], which is what makes a crafted
//! message unable to point backward into already-consumed memory or forward
//! past the buffer end.

mod decoder;
mod encoder;
mod validator;

pub use decoder::Decoder;
pub use encoder::{Encoder, MessageBuilder};
pub use validator::Validator;

/// Alignment of every claimed memory block.
pub const ALIGNMENT: usize = 8;

/// Size of the `(size, elements_or_version)` header prefixing each block.
pub const DATA_HEADER_SIZE: usize = 8;

/// Size of an encoded relative pointer.
pub const POINTER_SIZE: usize = 8;

/// Size of an inline union slot: 4-byte size, 4-byte tag, 8-byte payload.
pub const UNION_SIZE: usize = 16;

/// Size of an encoded handle index.
pub const HANDLE_SIZE: usize = 4;

/// Size of an encoded interface: handle index plus interface version.
pub const INTERFACE_SIZE: usize = 8;

pub(crate) fn align_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Header prefixing every struct, array, and union on the wire.
///
/// For structs `elements_or_version` is the struct version; for arrays it is
/// the element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub size: u32,
    pub elements_or_version: u32,
}

/// One entry in a struct type's table of known `(version, size)` pairs.
///
/// Tables are listed in ascending version order; the last entry is the
/// newest version the type knows how to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructVersion {
    pub version: u32,
    pub size: u32,
}

pub(crate) fn newest_version(versions: &[StructVersion]) -> StructVersion {
    versions.last().copied().unwrap_or(StructVersion {
        version: 0,
        size: DATA_HEADER_SIZE as u32,
    })
}

/// A value type with a fixed wire layout and a self-describing header.
///
/// Implementations are written in the generated-code shape: `encode` writes
/// fields at their fixed offsets (field 0 lives at offset 8, after the
/// header), `decode` first validates the header against [`Self::VERSIONS`]
/// and then reads the fields that header version carries.
pub trait StructType: Sized {
    /// Known `(version, size)` pairs in ascending version order.
    const VERSIONS: &'static [StructVersion];

    fn encode(&self, encoder: &mut Encoder<'_>) -> Result<(), SerializationError>;

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DeserializationError>;
}

/// A tagged value occupying a fixed 16-byte inline slot.
///
/// The slot holds a 4-byte size (0 encodes null, 16 otherwise), a 4-byte
/// discriminant, and 8 bytes of payload or pointer. The size word is written
/// and checked by the encoder/decoder; implementations handle the
/// discriminant at `offset + 4` and the payload at `offset + 8`.
pub trait UnionType: Sized {
    fn encode(&self, encoder: &mut Encoder<'_>, offset: usize)
    -> Result<(), SerializationError>;

    fn decode(decoder: &mut Decoder<'_>, offset: usize) -> Result<Self, DeserializationError>;
}

/// Fixed-width little-endian scalar.
pub trait Scalar: Copy {
    const WIDTH: usize;

    fn write_le(self, out: &mut [u8]);
    fn read_le(src: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {
        $(impl Scalar for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn write_le(self, out: &mut [u8]) {
                out[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(src: &[u8]) -> Self {
                let mut bytes = [0u8; std::mem::size_of::<$t>()];
                bytes.copy_from_slice(&src[..Self::WIDTH]);
                <$t>::from_le_bytes(bytes)
            }
        })*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Caller misuse at an encode site. Raised before any bytes for the
/// offending field are written.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SerializationError {
    #[error("null written to a non-nullable field")]
    UnexpectedNull,

    #[error("invalid handle written to a non-nullable handle field")]
    InvalidHandle,

    #[error("fixed-length array expected {expected} elements, got {actual}")]
    FixedLengthMismatch { expected: u32, actual: u32 },
}

/// Malformed, truncated, misaligned, or out-of-order payload.
///
/// Always fatal for the message being decoded; the caller tears down or
/// rejects, never retries.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeserializationError {
    #[error("read of {len} bytes at offset {offset} exceeds message size {message_len}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        message_len: usize,
    },

    #[error("memory claim at offset {offset} is not 8-byte aligned")]
    MisalignedClaim { offset: usize },

    #[error("memory claim at offset {offset} overlaps previously claimed memory")]
    OutOfOrderClaim { offset: usize },

    #[error("pointer at offset {offset} resolves outside the message")]
    IllegalPointer { offset: usize },

    #[error("handle index {index} out of range for {count} attached handles")]
    HandleOutOfRange { index: u32, count: usize },

    #[error("handle index {index} claimed out of order")]
    HandleOutOfOrder { index: u32 },

    #[error("struct header (size {size}, version {version}) matches no known version")]
    BadStructHeader { size: u32, version: u32 },

    #[error("array header size {size} too small for {count} elements")]
    BadArrayHeader { size: u32, count: u32 },

    #[error("array expected {expected} elements, got {actual}")]
    UnexpectedArrayLength { expected: u32, actual: u32 },

    #[error("union slot has size {size}, expected 0 or 16")]
    BadUnionSize { size: u32 },

    #[error("unknown union discriminant {tag}")]
    UnknownUnionTag { tag: u32 },

    #[error("null value for a non-nullable field at offset {offset}")]
    UnexpectedNull { offset: usize },

    #[error("message header flags {flags:#x} inconsistent with header version {version}")]
    InvalidMessageHeader { flags: u32, version: u32 },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

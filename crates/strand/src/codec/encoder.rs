use crate::message::Message;
use crate::pipe::{Handle, InterfaceHandle};

use super::{
    DATA_HEADER_SIZE, POINTER_SIZE, Scalar, SerializationError, StructType, UNION_SIZE, UnionType,
    align_up, newest_version,
};

/// Append-only, self-growing encode buffer plus side handle list.
///
/// A message is produced by claiming the header block, then the root payload
/// struct, then `finish()`. All nested values are reached through
/// [`Encoder`] views handed out per claimed block.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    data: Vec<u8>,
    handles: Vec<Handle>,
    extent: usize,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `size` bytes at the logical end of the buffer, growing the
    /// backing storage (doubling) as needed. Returns the 8-aligned base of
    /// the claimed block.
    fn claim(&mut self, size: usize) -> usize {
        let base = self.extent;
        let new_extent = align_up(base + size);
        if new_extent > self.data.len() {
            let new_len = new_extent.max(self.data.len() * 2);
            self.data.resize(new_len, 0);
        }
        self.extent = new_extent;
        base
    }

    fn put<T: Scalar>(&mut self, at: usize, value: T) {
        value.write_le(&mut self.data[at..]);
    }

    /// Claim a block and write its data header. The returned encoder is
    /// rooted at the block, so field offsets start at 8.
    pub fn append_block(&mut self, size: u32, elements_or_version: u32) -> Encoder<'_> {
        let base = self.claim(size as usize);
        self.put::<u32>(base, size);
        self.put::<u32>(base + 4, elements_or_version);
        Encoder {
            builder: self,
            base,
        }
    }

    /// Append a struct at the current end of buffer, encoded at its newest
    /// known version.
    pub fn append_struct<T: StructType>(&mut self, value: &T) -> Result<(), SerializationError> {
        let newest = newest_version(T::VERSIONS);
        let mut encoder = self.append_block(newest.size, newest.version);
        value.encode(&mut encoder)
    }

    /// Consume the builder into an immutable single-use [`Message`].
    pub fn finish(mut self) -> Message {
        self.data.truncate(self.extent);
        Message::new(self.data, self.handles)
    }
}

/// Write view over one claimed struct/array/union block.
///
/// Offsets are relative to the block base; a struct's first field lives at
/// offset 8, after its header. Writing a nested value records a relative
/// pointer to the current end of buffer and recurses a sub-encoder rooted at
/// the new block, producing the depth-first forward-only layout the decoder
/// validates against.
#[derive(Debug)]
pub struct Encoder<'b> {
    builder: &'b mut MessageBuilder,
    base: usize,
}

impl Encoder<'_> {
    /// Write a fixed-width scalar at `offset`.
    pub fn write<T: Scalar>(&mut self, offset: usize, value: T) {
        self.builder.put(self.base + offset, value);
    }

    /// Write one bit-packed boolean at `offset`, bit `bit` (LSB-first).
    pub fn write_bool(&mut self, offset: usize, bit: u8, value: bool) {
        let at = self.base + offset;
        if value {
            self.builder.data[at] |= 1 << bit;
        } else {
            self.builder.data[at] &= !(1 << bit);
        }
    }

    /// Claim a new block at the end of the buffer, write its header, and
    /// record a relative pointer to it at `offset`.
    fn append_pointed_block(
        &mut self,
        offset: usize,
        size: u32,
        elements_or_version: u32,
    ) -> usize {
        let field = self.base + offset;
        let target = self.builder.claim(size as usize);
        self.builder.put::<u64>(field, (target - field) as u64);
        self.builder.put::<u32>(target, size);
        self.builder.put::<u32>(target + 4, elements_or_version);
        target
    }

    fn null_pointer(&mut self, offset: usize, nullable: bool) -> Result<(), SerializationError> {
        if !nullable {
            return Err(SerializationError::UnexpectedNull);
        }
        self.write::<u64>(offset, 0);
        Ok(())
    }

    fn check_length(
        actual: usize,
        expected: Option<u32>,
    ) -> Result<u32, SerializationError> {
        let actual = actual as u32;
        match expected {
            Some(expected) if expected != actual => {
                Err(SerializationError::FixedLengthMismatch { expected, actual })
            }
            _ => Ok(actual),
        }
    }

    /// Write a nested struct behind a pointer at `offset`.
    pub fn write_struct<T: StructType>(
        &mut self,
        offset: usize,
        value: Option<&T>,
        nullable: bool,
    ) -> Result<(), SerializationError> {
        let Some(value) = value else {
            return self.null_pointer(offset, nullable);
        };
        let newest = newest_version(T::VERSIONS);
        let target = self.append_pointed_block(offset, newest.size, newest.version);
        let mut sub = Encoder {
            builder: self.builder,
            base: target,
        };
        value.encode(&mut sub)
    }

    /// Write a UTF-8 string as a `u8` array behind a pointer at `offset`.
    pub fn write_string(
        &mut self,
        offset: usize,
        value: Option<&str>,
        nullable: bool,
    ) -> Result<(), SerializationError> {
        self.write_scalar_array(offset, value.map(str::as_bytes), nullable, None)
    }

    /// Write a scalar array behind a pointer at `offset`.
    pub fn write_scalar_array<T: Scalar>(
        &mut self,
        offset: usize,
        value: Option<&[T]>,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<(), SerializationError> {
        let Some(value) = value else {
            return self.null_pointer(offset, nullable);
        };
        let count = Self::check_length(value.len(), expected_length)?;
        let size = (DATA_HEADER_SIZE + value.len() * T::WIDTH) as u32;
        let target = self.append_pointed_block(offset, size, count);
        for (i, element) in value.iter().enumerate() {
            self.builder
                .put(target + DATA_HEADER_SIZE + i * T::WIDTH, *element);
        }
        Ok(())
    }

    /// Write a bit-packed boolean array behind a pointer at `offset`.
    pub fn write_bool_array(
        &mut self,
        offset: usize,
        value: Option<&[bool]>,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<(), SerializationError> {
        let Some(value) = value else {
            return self.null_pointer(offset, nullable);
        };
        let count = Self::check_length(value.len(), expected_length)?;
        let size = (DATA_HEADER_SIZE + value.len().div_ceil(8)) as u32;
        let target = self.append_pointed_block(offset, size, count);
        for (i, element) in value.iter().enumerate() {
            if *element {
                self.builder.data[target + DATA_HEADER_SIZE + i / 8] |= 1 << (i % 8);
            }
        }
        Ok(())
    }

    /// Write an array of structs (encoded as an array of pointers) behind a
    /// pointer at `offset`.
    pub fn write_struct_array<T: StructType>(
        &mut self,
        offset: usize,
        value: Option<&[T]>,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<(), SerializationError> {
        let Some(value) = value else {
            return self.null_pointer(offset, nullable);
        };
        let count = Self::check_length(value.len(), expected_length)?;
        let size = (DATA_HEADER_SIZE + value.len() * POINTER_SIZE) as u32;
        let target = self.append_pointed_block(offset, size, count);
        for (i, element) in value.iter().enumerate() {
            let mut sub = Encoder {
                builder: self.builder,
                base: target,
            };
            sub.write_struct(DATA_HEADER_SIZE + i * POINTER_SIZE, Some(element), false)?;
        }
        Ok(())
    }

    /// Write an array of strings behind a pointer at `offset`.
    pub fn write_string_array(
        &mut self,
        offset: usize,
        value: Option<&[String]>,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<(), SerializationError> {
        let Some(value) = value else {
            return self.null_pointer(offset, nullable);
        };
        let count = Self::check_length(value.len(), expected_length)?;
        let size = (DATA_HEADER_SIZE + value.len() * POINTER_SIZE) as u32;
        let target = self.append_pointed_block(offset, size, count);
        for (i, element) in value.iter().enumerate() {
            let mut sub = Encoder {
                builder: self.builder,
                base: target,
            };
            sub.write_string(DATA_HEADER_SIZE + i * POINTER_SIZE, Some(element), false)?;
        }
        Ok(())
    }

    /// Transfer a handle into the message and write its index at `offset`.
    pub fn write_handle(
        &mut self,
        offset: usize,
        handle: Option<Handle>,
        nullable: bool,
    ) -> Result<(), SerializationError> {
        match handle {
            Some(handle) if handle.is_valid() => {
                let index = self.builder.handles.len() as i32;
                self.builder.handles.push(handle);
                self.write::<i32>(offset, index);
                Ok(())
            }
            _ if nullable => {
                self.write::<i32>(offset, -1);
                Ok(())
            }
            _ => Err(SerializationError::InvalidHandle),
        }
    }

    /// Write an embedded interface: handle index plus interface version.
    pub fn write_interface(
        &mut self,
        offset: usize,
        value: Option<InterfaceHandle>,
        nullable: bool,
    ) -> Result<(), SerializationError> {
        match value {
            Some(value) => {
                self.write_handle(offset, Some(value.handle), nullable)?;
                self.write::<u32>(offset + 4, value.version);
                Ok(())
            }
            None => {
                self.write_handle(offset, None, nullable)?;
                self.write::<u32>(offset + 4, 0);
                Ok(())
            }
        }
    }

    /// Write an array of handles behind a pointer at `offset`.
    pub fn write_handle_array(
        &mut self,
        offset: usize,
        value: Option<Vec<Handle>>,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<(), SerializationError> {
        let Some(value) = value else {
            return self.null_pointer(offset, nullable);
        };
        let count = Self::check_length(value.len(), expected_length)?;
        let size = (DATA_HEADER_SIZE + value.len() * super::HANDLE_SIZE) as u32;
        let target = self.append_pointed_block(offset, size, count);
        for (i, handle) in value.into_iter().enumerate() {
            let mut sub = Encoder {
                builder: self.builder,
                base: target,
            };
            sub.write_handle(DATA_HEADER_SIZE + i * super::HANDLE_SIZE, Some(handle), false)?;
        }
        Ok(())
    }

    /// Write a union into its fixed 16-byte inline slot at `offset`.
    pub fn write_union<U: UnionType>(
        &mut self,
        offset: usize,
        value: Option<&U>,
        nullable: bool,
    ) -> Result<(), SerializationError> {
        match value {
            Some(value) => {
                self.write::<u32>(offset, UNION_SIZE as u32);
                value.encode(self, offset)
            }
            // A zeroed slot (size 0) encodes the null union.
            None if nullable => Ok(()),
            None => Err(SerializationError::UnexpectedNull),
        }
    }
}

use crate::pipe::{Handle, InterfaceHandle};

use super::{
    DATA_HEADER_SIZE, DataHeader, DeserializationError, HANDLE_SIZE, POINTER_SIZE, Scalar,
    StructType, StructVersion, UNION_SIZE, UnionType, Validator,
};

/// Bounds- and order-validating read view over one claimed block.
///
/// All decoders for one message share a [`Validator`] and the message's
/// handle list; resolving a pointer recurses a sub-decoder whose claims go
/// through the same validator, so any backward, overlapping, or misaligned
/// reference fails regardless of nesting depth.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    handles: &'a mut Vec<Handle>,
    validator: &'a mut Validator,
    base: usize,
}

impl<'a> Decoder<'a> {
    pub fn root(
        data: &'a [u8],
        handles: &'a mut Vec<Handle>,
        validator: &'a mut Validator,
    ) -> Self {
        Self {
            data,
            handles,
            validator,
            base: 0,
        }
    }

    fn sub(&mut self, base: usize) -> Decoder<'_> {
        Decoder {
            data: self.data,
            handles: &mut *self.handles,
            validator: &mut *self.validator,
            base,
        }
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&[u8], DeserializationError> {
        let at = self.base + offset;
        let end = at.saturating_add(len);
        if end > self.data.len() {
            return Err(DeserializationError::OutOfBounds {
                offset: at,
                len,
                message_len: self.data.len(),
            });
        }
        Ok(&self.data[at..end])
    }

    /// Read a fixed-width scalar at `offset`.
    pub fn read<T: Scalar>(&self, offset: usize) -> Result<T, DeserializationError> {
        Ok(T::read_le(self.slice(offset, T::WIDTH)?))
    }

    /// Read one bit-packed boolean at `offset`, bit `bit`.
    pub fn read_bool(&self, offset: usize, bit: u8) -> Result<bool, DeserializationError> {
        Ok(self.read::<u8>(offset)? >> bit & 1 == 1)
    }

    /// Claim and validate a struct header against the type's known
    /// `(version, size)` table.
    ///
    /// A version at or below the newest known version must have exactly the
    /// size recorded for the nearest known version at or below it; a newer
    /// version must be at least as large as the newest known size. This is
    /// what lets older decoders tolerate newer, extended payloads and vice
    /// versa.
    pub fn read_struct_header(
        &mut self,
        versions: &[StructVersion],
    ) -> Result<DataHeader, DeserializationError> {
        let base = self.base;
        self.validator.claim_memory(base, base + DATA_HEADER_SIZE)?;
        let size = self.read::<u32>(0)?;
        let version = self.read::<u32>(4)?;
        if (size as usize) < DATA_HEADER_SIZE {
            return Err(DeserializationError::BadStructHeader { size, version });
        }
        self.validator
            .claim_memory(base + DATA_HEADER_SIZE, base + size as usize)?;
        if let Some(newest) = versions.last() {
            if version <= newest.version {
                match versions.iter().rev().find(|v| v.version <= version) {
                    Some(known) if known.size == size => {}
                    _ => return Err(DeserializationError::BadStructHeader { size, version }),
                }
            } else if size < newest.size {
                return Err(DeserializationError::BadStructHeader { size, version });
            }
        }
        Ok(DataHeader {
            size,
            elements_or_version: version,
        })
    }

    /// Claim and validate an array header; returns the element count.
    pub fn read_array_header(
        &mut self,
        element_bits: u64,
        expected_length: Option<u32>,
    ) -> Result<u32, DeserializationError> {
        let base = self.base;
        self.validator.claim_memory(base, base + DATA_HEADER_SIZE)?;
        let size = self.read::<u32>(0)?;
        let count = self.read::<u32>(4)?;
        let needed = DATA_HEADER_SIZE as u64 + (count as u64 * element_bits).div_ceil(8);
        if (size as u64) < needed {
            return Err(DeserializationError::BadArrayHeader { size, count });
        }
        self.validator
            .claim_memory(base + DATA_HEADER_SIZE, base + size as usize)?;
        match expected_length {
            Some(expected) if expected != count => {
                Err(DeserializationError::UnexpectedArrayLength {
                    expected,
                    actual: count,
                })
            }
            _ => Ok(count),
        }
    }

    /// Resolve the relative pointer at `offset` to an absolute position.
    /// Returns `None` for the null pointer.
    pub fn read_pointer(&self, offset: usize) -> Result<Option<usize>, DeserializationError> {
        let rel = self.read::<i64>(offset)?;
        if rel == 0 {
            return Ok(None);
        }
        let field = self.base + offset;
        let abs = (field as i64).checked_add(rel);
        match abs {
            Some(abs) if abs >= 0 && abs as usize <= self.data.len() => Ok(Some(abs as usize)),
            _ => Err(DeserializationError::IllegalPointer { offset: field }),
        }
    }

    fn decode_null<T>(
        &self,
        offset: usize,
        nullable: bool,
    ) -> Result<Option<T>, DeserializationError> {
        if nullable {
            Ok(None)
        } else {
            Err(DeserializationError::UnexpectedNull {
                offset: self.base + offset,
            })
        }
    }

    /// Decode a nested struct behind the pointer at `offset`.
    pub fn read_struct<T: StructType>(
        &mut self,
        offset: usize,
        nullable: bool,
    ) -> Result<Option<T>, DeserializationError> {
        let Some(target) = self.read_pointer(offset)? else {
            return self.decode_null(offset, nullable);
        };
        let mut sub = self.sub(target);
        Ok(Some(T::decode(&mut sub)?))
    }

    /// Decode a UTF-8 string behind the pointer at `offset`.
    pub fn read_string(
        &mut self,
        offset: usize,
        nullable: bool,
    ) -> Result<Option<String>, DeserializationError> {
        match self.read_scalar_array::<u8>(offset, nullable, None)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| DeserializationError::InvalidUtf8),
            None => Ok(None),
        }
    }

    /// Decode a scalar array behind the pointer at `offset`.
    pub fn read_scalar_array<T: Scalar>(
        &mut self,
        offset: usize,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<Option<Vec<T>>, DeserializationError> {
        let Some(target) = self.read_pointer(offset)? else {
            return self.decode_null(offset, nullable);
        };
        let mut sub = self.sub(target);
        let count = sub.read_array_header(T::WIDTH as u64 * 8, expected_length)?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            out.push(sub.read::<T>(DATA_HEADER_SIZE + i * T::WIDTH)?);
        }
        Ok(Some(out))
    }

    /// Decode a bit-packed boolean array behind the pointer at `offset`.
    pub fn read_bool_array(
        &mut self,
        offset: usize,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<Option<Vec<bool>>, DeserializationError> {
        let Some(target) = self.read_pointer(offset)? else {
            return self.decode_null(offset, nullable);
        };
        let mut sub = self.sub(target);
        let count = sub.read_array_header(1, expected_length)?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            out.push(sub.read_bool(DATA_HEADER_SIZE + i / 8, (i % 8) as u8)?);
        }
        Ok(Some(out))
    }

    /// Decode an array of structs behind the pointer at `offset`.
    pub fn read_struct_array<T: StructType>(
        &mut self,
        offset: usize,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<Option<Vec<T>>, DeserializationError> {
        let Some(target) = self.read_pointer(offset)? else {
            return self.decode_null(offset, nullable);
        };
        let mut sub = self.sub(target);
        let count = sub.read_array_header(POINTER_SIZE as u64 * 8, expected_length)?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            match sub.read_struct::<T>(DATA_HEADER_SIZE + i * POINTER_SIZE, false)? {
                Some(element) => out.push(element),
                None => unreachable!("non-nullable element decode returned null"),
            }
        }
        Ok(Some(out))
    }

    /// Decode an array of strings behind the pointer at `offset`.
    pub fn read_string_array(
        &mut self,
        offset: usize,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<Option<Vec<String>>, DeserializationError> {
        let Some(target) = self.read_pointer(offset)? else {
            return self.decode_null(offset, nullable);
        };
        let mut sub = self.sub(target);
        let count = sub.read_array_header(POINTER_SIZE as u64 * 8, expected_length)?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            match sub.read_string(DATA_HEADER_SIZE + i * POINTER_SIZE, false)? {
                Some(element) => out.push(element),
                None => unreachable!("non-nullable element decode returned null"),
            }
        }
        Ok(Some(out))
    }

    /// Claim the handle index at `offset` and take ownership of the handle.
    pub fn read_handle(
        &mut self,
        offset: usize,
        nullable: bool,
    ) -> Result<Option<Handle>, DeserializationError> {
        let index = self.read::<i32>(offset)?;
        if index == -1 {
            return self.decode_null(offset, nullable);
        }
        let index = index as u32;
        self.validator.claim_handle(index)?;
        Ok(Some(std::mem::take(&mut self.handles[index as usize])))
    }

    /// Decode an embedded interface: handle index plus interface version.
    pub fn read_interface(
        &mut self,
        offset: usize,
        nullable: bool,
    ) -> Result<Option<InterfaceHandle>, DeserializationError> {
        let Some(handle) = self.read_handle(offset, nullable)? else {
            return Ok(None);
        };
        let version = self.read::<u32>(offset + 4)?;
        Ok(Some(InterfaceHandle { handle, version }))
    }

    /// Decode an array of handles behind the pointer at `offset`.
    pub fn read_handle_array(
        &mut self,
        offset: usize,
        nullable: bool,
        expected_length: Option<u32>,
    ) -> Result<Option<Vec<Handle>>, DeserializationError> {
        let Some(target) = self.read_pointer(offset)? else {
            return self.decode_null(offset, nullable);
        };
        let mut sub = self.sub(target);
        let count = sub.read_array_header(HANDLE_SIZE as u64 * 8, expected_length)?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            match sub.read_handle(DATA_HEADER_SIZE + i * HANDLE_SIZE, false)? {
                Some(handle) => out.push(handle),
                None => unreachable!("non-nullable element decode returned null"),
            }
        }
        Ok(Some(out))
    }

    /// Decode a union from its fixed 16-byte inline slot at `offset`.
    pub fn read_union<U: UnionType>(
        &mut self,
        offset: usize,
        nullable: bool,
    ) -> Result<Option<U>, DeserializationError> {
        let size = self.read::<u32>(offset)?;
        if size == 0 {
            return self.decode_null(offset, nullable);
        }
        if size != UNION_SIZE as u32 {
            return Err(DeserializationError::BadUnionSize { size });
        }
        Ok(Some(U::decode(self, offset)?))
    }
}

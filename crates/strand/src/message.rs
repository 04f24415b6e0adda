//! Raw messages and the framing header layered over them.
//!
//! A [`Message`] is an immutable byte buffer plus an ordered handle list,
//! consumed exactly once by a write or a decode. A [`ServiceMessage`]
//! interprets the same bytes as a parsed [`MessageHeader`] (call type,
//! flags, optional request id) followed by the payload struct.

use crate::codec::{
    Decoder, DeserializationError, MessageBuilder, SerializationError, StructType, StructVersion,
    Validator,
};
use crate::pipe::Handle;

/// The call expects a response carrying the same request id.
pub const MESSAGE_EXPECTS_RESPONSE: u32 = 1 << 0;

/// The message is a response to an earlier call.
pub const MESSAGE_IS_RESPONSE: u32 = 1 << 1;

/// Header version 0: no request id, 16 bytes.
const HEADER_SIMPLE: StructVersion = StructVersion {
    version: 0,
    size: 16,
};

/// Header version 1: with request id, 24 bytes.
const HEADER_WITH_REQUEST_ID: StructVersion = StructVersion {
    version: 1,
    size: 24,
};

const HEADER_VERSIONS: &[StructVersion] = &[HEADER_SIMPLE, HEADER_WITH_REQUEST_ID];

const TYPE_OFFSET: usize = 8;
const FLAGS_OFFSET: usize = 12;
const REQUEST_ID_OFFSET: usize = 16;

/// Byte payload plus ordered handle list. Single-use: a message is either
/// written to a pipe or decoded, at most once.
#[derive(Debug, Default)]
pub struct Message {
    pub data: Vec<u8>,
    pub handles: Vec<Handle>,
}

impl Message {
    pub fn new(data: Vec<u8>, handles: Vec<Handle>) -> Self {
        Self { data, handles }
    }

    /// Decode the message as a single root struct, consuming it.
    pub fn decode_struct<T: StructType>(self) -> Result<T, DeserializationError> {
        let Self { data, mut handles } = self;
        let mut validator = Validator::new(data.len(), handles.len());
        let mut decoder = Decoder::root(&data, &mut handles, &mut validator);
        T::decode(&mut decoder)
    }
}

/// Parsed framing header.
///
/// `request_id` is meaningful only when one of the response-related flags is
/// set; the wire shape (16 or 24 bytes) is selected by those flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: u32,
    pub flags: u32,
    pub request_id: u64,
}

impl MessageHeader {
    /// One-way call header.
    pub fn simple(msg_type: u32) -> Self {
        Self {
            msg_type,
            flags: 0,
            request_id: 0,
        }
    }

    /// Two-way call header. The request id starts at 0 and is stamped by
    /// the router when the call is accepted.
    pub fn expecting_response(msg_type: u32) -> Self {
        Self {
            msg_type,
            flags: MESSAGE_EXPECTS_RESPONSE,
            request_id: 0,
        }
    }

    /// Response header for the given request id.
    pub fn response(msg_type: u32, request_id: u64) -> Self {
        Self {
            msg_type,
            flags: MESSAGE_IS_RESPONSE,
            request_id,
        }
    }

    pub fn expects_response(&self) -> bool {
        self.flags & MESSAGE_EXPECTS_RESPONSE != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & MESSAGE_IS_RESPONSE != 0
    }

    fn has_request_id(&self) -> bool {
        self.flags & (MESSAGE_EXPECTS_RESPONSE | MESSAGE_IS_RESPONSE) != 0
    }

    fn shape(&self) -> StructVersion {
        if self.has_request_id() {
            HEADER_WITH_REQUEST_ID
        } else {
            HEADER_SIMPLE
        }
    }

    /// Size in bytes of this header's wire shape.
    pub fn size(&self) -> usize {
        self.shape().size as usize
    }

    fn encode(&self, builder: &mut MessageBuilder) {
        let shape = self.shape();
        let mut encoder = builder.append_block(shape.size, shape.version);
        encoder.write::<u32>(TYPE_OFFSET, self.msg_type);
        encoder.write::<u32>(FLAGS_OFFSET, self.flags);
        if self.has_request_id() {
            encoder.write::<u64>(REQUEST_ID_OFFSET, self.request_id);
        }
    }

    /// Returns the parsed header and its size on the wire, which for a
    /// newer-versioned header can exceed this version's own shapes.
    fn decode(decoder: &mut Decoder<'_>) -> Result<(Self, usize), DeserializationError> {
        let header = decoder.read_struct_header(HEADER_VERSIONS)?;
        let msg_type = decoder.read::<u32>(TYPE_OFFSET)?;
        let flags = decoder.read::<u32>(FLAGS_OFFSET)?;
        let request_id = if header.elements_or_version >= HEADER_WITH_REQUEST_ID.version {
            decoder.read::<u64>(REQUEST_ID_OFFSET)?
        } else {
            0
        };
        // Response flags require the shape that carries a request id.
        if flags & (MESSAGE_EXPECTS_RESPONSE | MESSAGE_IS_RESPONSE) != 0
            && header.elements_or_version < HEADER_WITH_REQUEST_ID.version
        {
            return Err(DeserializationError::InvalidMessageHeader {
                flags,
                version: header.elements_or_version,
            });
        }
        Ok((
            Self {
                msg_type,
                flags,
                request_id,
            },
            header.size as usize,
        ))
    }
}

/// Encode a complete message: framing header followed by the payload
/// struct, contiguous in one buffer.
pub fn build_message<T: StructType>(
    header: &MessageHeader,
    payload: &T,
) -> Result<Message, SerializationError> {
    let mut builder = MessageBuilder::new();
    header.encode(&mut builder);
    builder.append_struct(payload)?;
    Ok(builder.finish())
}

/// A message whose header has been parsed and validated.
#[derive(Debug)]
pub struct ServiceMessage {
    pub header: MessageHeader,
    /// Size of the header as actually encoded; the payload starts here.
    header_size: usize,
    message: Message,
}

impl ServiceMessage {
    /// Parse and validate the framing header. Fails on truncated or
    /// malformed headers; the payload is validated later, by
    /// [`ServiceMessage::decode_payload`].
    pub fn parse(message: Message) -> Result<Self, DeserializationError> {
        let mut validator = Validator::new(message.data.len(), 0);
        let mut no_handles = Vec::new();
        let mut decoder = Decoder::root(&message.data, &mut no_handles, &mut validator);
        let (header, header_size) = MessageHeader::decode(&mut decoder)?;
        Ok(Self {
            header,
            header_size,
            message,
        })
    }

    /// Stamp a request id into the already-encoded header bytes. Only legal
    /// for the wire shape that carries one.
    pub fn set_request_id(&mut self, request_id: u64) {
        debug_assert!(self.header.has_request_id());
        self.header.request_id = request_id;
        self.message.data[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 8]
            .copy_from_slice(&request_id.to_le_bytes());
    }

    /// Decode the payload struct following the header, consuming the
    /// message. The payload region gets its own validator.
    pub fn decode_payload<T: StructType>(self) -> Result<T, DeserializationError> {
        let offset = self.header_size;
        let Message { data, mut handles } = self.message;
        if data.len() < offset {
            return Err(DeserializationError::OutOfBounds {
                offset: 0,
                len: offset,
                message_len: data.len(),
            });
        }
        let payload = &data[offset..];
        let mut validator = Validator::new(payload.len(), handles.len());
        let mut decoder = Decoder::root(payload, &mut handles, &mut validator);
        T::decode(&mut decoder)
    }

    /// Give back the raw message, e.g. to forward it unchanged.
    pub fn into_message(self) -> Message {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;

    #[derive(Debug, PartialEq)]
    struct Ping {
        seq: u64,
    }

    impl StructType for Ping {
        const VERSIONS: &'static [StructVersion] = &[StructVersion {
            version: 0,
            size: 16,
        }];

        fn encode(&self, encoder: &mut Encoder<'_>) -> Result<(), SerializationError> {
            encoder.write::<u64>(8, self.seq);
            Ok(())
        }

        fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DeserializationError> {
            decoder.read_struct_header(Self::VERSIONS)?;
            Ok(Self {
                seq: decoder.read::<u64>(8)?,
            })
        }
    }

    #[test]
    fn simple_header_is_16_bytes() {
        let message = build_message(&MessageHeader::simple(3), &Ping { seq: 9 }).unwrap();
        assert_eq!(&message.data[0..4], &16u32.to_le_bytes());
        assert_eq!(&message.data[4..8], &0u32.to_le_bytes());
        let parsed = ServiceMessage::parse(message).unwrap();
        assert_eq!(parsed.header, MessageHeader::simple(3));
        assert_eq!(parsed.decode_payload::<Ping>().unwrap(), Ping { seq: 9 });
    }

    #[test]
    fn request_header_is_24_bytes() {
        let message =
            build_message(&MessageHeader::expecting_response(7), &Ping { seq: 1 }).unwrap();
        assert_eq!(&message.data[0..4], &24u32.to_le_bytes());
        assert_eq!(&message.data[4..8], &1u32.to_le_bytes());
        let parsed = ServiceMessage::parse(message).unwrap();
        assert!(parsed.header.expects_response());
        assert_eq!(parsed.header.request_id, 0);
    }

    #[test]
    fn request_id_stamp_rewrites_header_bytes() {
        let message =
            build_message(&MessageHeader::expecting_response(7), &Ping { seq: 1 }).unwrap();
        let mut parsed = ServiceMessage::parse(message).unwrap();
        parsed.set_request_id(0xDEAD_BEEF);
        let reparsed = ServiceMessage::parse(parsed.into_message()).unwrap();
        assert_eq!(reparsed.header.request_id, 0xDEAD_BEEF);
        assert_eq!(reparsed.decode_payload::<Ping>().unwrap(), Ping { seq: 1 });
    }

    #[test]
    fn response_header_roundtrips() {
        let message =
            build_message(&MessageHeader::response(7, 42), &Ping { seq: 2 }).unwrap();
        let parsed = ServiceMessage::parse(message).unwrap();
        assert!(parsed.header.is_response());
        assert_eq!(parsed.header.request_id, 42);
    }

    #[test]
    fn response_flag_in_simple_shape_rejected() {
        let mut message = build_message(&MessageHeader::simple(7), &Ping { seq: 2 }).unwrap();
        // Force the is-response flag into a 16-byte header.
        message.data[FLAGS_OFFSET..FLAGS_OFFSET + 4]
            .copy_from_slice(&MESSAGE_IS_RESPONSE.to_le_bytes());
        let err = ServiceMessage::parse(message).unwrap_err();
        assert_eq!(
            err,
            DeserializationError::InvalidMessageHeader {
                flags: MESSAGE_IS_RESPONSE,
                version: 0
            }
        );
    }

    #[test]
    fn truncated_header_rejected() {
        let err = ServiceMessage::parse(Message::new(vec![0u8; 4], Vec::new())).unwrap_err();
        assert!(matches!(err, DeserializationError::OutOfBounds { .. }));
    }

    #[test]
    fn future_header_version_tolerated() {
        // A 32-byte version-2 header from a newer peer still parses; the
        // fields this version knows are read, the tail is skipped.
        let mut message =
            build_message(&MessageHeader::response(7, 42), &Ping { seq: 2 }).unwrap();
        let mut extended = vec![0u8; message.data.len() + 8];
        extended[..24].copy_from_slice(&message.data[..24]);
        extended[0..4].copy_from_slice(&32u32.to_le_bytes());
        extended[4..8].copy_from_slice(&2u32.to_le_bytes());
        extended[32..].copy_from_slice(&message.data[24..]);
        message.data = extended;
        let parsed = ServiceMessage::parse(message).unwrap();
        assert_eq!(parsed.header.msg_type, 7);
        assert_eq!(parsed.header.request_id, 42);
        // The payload is found after the larger header, not at offset 24.
        assert_eq!(parsed.decode_payload::<Ping>().unwrap(), Ping { seq: 2 });
    }
}

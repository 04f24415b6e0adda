//! Framed transport for carrying messages over byte streams.
//!
//! Uses LengthDelimitedCodec for framing. Works over any
//! AsyncRead/AsyncWrite (pipes, sockets, etc), bridging a remote byte
//! stream to a local in-process pipe endpoint. Handles are an in-process
//! capability and cannot cross a byte stream.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::message::Message;
use crate::pipe::{Handle, TransportError};

/// Failure of a stream transport pump.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("messages carrying handles cannot cross a byte stream")]
    HandlesNotSupported,

    #[error("handle is invalid")]
    InvalidHandle,
}

/// Codec that frames handle-less messages with a 4-byte length prefix.
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(Message::new(bytes.to_vec(), Vec::new()))),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if !item.handles.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                StreamError::HandlesNotSupported.to_string(),
            ));
        }
        tracing::trace!(frame_size_bytes = item.data.len(), "encoding frame");
        self.inner.encode(Bytes::from(item.data), dst)
    }
}

/// Pump messages in both directions between a byte stream and a local pipe
/// endpoint until either side closes. Returns `Ok` on an orderly close
/// from either end.
pub async fn run_stream_transport<S>(io: S, handle: Handle) -> Result<(), StreamError>
where
    S: AsyncRead + AsyncWrite,
{
    let mut pipe = handle.into_pipe().ok_or(StreamError::InvalidHandle)?;
    let (read_half, write_half) = tokio::io::split(io);
    let mut incoming = FramedRead::new(read_half, MessageCodec::new());
    let mut outgoing = FramedWrite::new(write_half, MessageCodec::new());

    loop {
        tokio::select! {
            message = pipe.readable() => match message {
                Ok(message) if !message.handles.is_empty() => {
                    return Err(StreamError::HandlesNotSupported);
                }
                Ok(message) => outgoing.send(message).await?,
                // The local endpoint went away; an orderly end of the pump.
                Err(TransportError::PeerClosed) => break,
                Err(error) => return Err(error.into()),
            },
            frame = incoming.next() => match frame {
                Some(Ok(message)) => pipe.write(message)?,
                Some(Err(error)) => return Err(error.into()),
                // Remote EOF.
                None => break,
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::message_pipe;

    #[test]
    fn codec_roundtrip() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Message::new(vec![1, 2, 3, 4], Vec::new()), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.data, vec![1, 2, 3, 4]);
        assert!(decoded.handles.is_empty());
    }

    #[test]
    fn codec_waits_for_a_complete_frame() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Message::new(vec![9; 16], Vec::new()), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap().data, vec![9; 16]);
    }

    #[test]
    fn messages_with_handles_are_rejected() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        let (handle, _peer) = message_pipe();
        let err = codec
            .encode(Message::new(Vec::new(), vec![handle]), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn pumps_messages_across_a_duplex_stream() {
        let (stream_a, stream_b) = tokio::io::duplex(4096);
        let (app_a, wire_a) = message_pipe();
        let (app_b, wire_b) = message_pipe();
        let pump_a = tokio::spawn(run_stream_transport(stream_a, wire_a));
        let pump_b = tokio::spawn(run_stream_transport(stream_b, wire_b));

        let mut pipe_a = app_a.into_pipe().unwrap();
        let mut pipe_b = app_b.into_pipe().unwrap();

        pipe_a.write(Message::new(vec![42; 8], Vec::new())).unwrap();
        assert_eq!(pipe_b.readable().await.unwrap().data, vec![42; 8]);

        pipe_b.write(Message::new(vec![7], Vec::new())).unwrap();
        assert_eq!(pipe_a.readable().await.unwrap().data, vec![7]);

        // Dropping both application endpoints winds the pumps down.
        drop(pipe_a);
        drop(pipe_b);
        pump_a.await.unwrap().unwrap();
        pump_b.await.unwrap().unwrap();
    }
}

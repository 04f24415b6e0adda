//! In-process message pipe endpoints and transferable handles.
//!
//! The OS-level pipe primitive is supplied from outside this crate as an
//! opaque capability; this module provides the in-process implementation:
//! a pair of unbounded tokio channels carrying whole [`Message`] values, so
//! FIFO order and message boundaries are preserved by construction.

use std::fmt;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::message::Message;

/// Failure surfaced by the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer endpoint closed")]
    PeerClosed,

    #[error("endpoint already closed")]
    Closed,
}

/// Create a connected pair of message pipe endpoints.
pub fn message_pipe() -> (Handle, Handle) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    (
        Handle::from_pipe(MessagePipe {
            tx: left_tx,
            rx: left_rx,
        }),
        Handle::from_pipe(MessagePipe {
            tx: right_tx,
            rx: right_rx,
        }),
    )
}

/// One end of a bidirectional message conduit.
#[derive(Debug)]
pub struct MessagePipe {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessagePipe {
    /// Direct, unbuffered write. Back-pressure is whatever the channel
    /// provides; there is no queue at this layer.
    pub fn write(&self, message: Message) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .map_err(|_| TransportError::PeerClosed)
    }

    /// Best-effort read. `Ok(None)` means "should wait".
    pub fn try_read(&mut self) -> Result<Option<Message>, TransportError> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::PeerClosed),
        }
    }

    /// Wait until the pipe is readable; resolves with the first available
    /// message. Cancel-safe: dropping the future loses nothing.
    pub async fn readable(&mut self) -> Result<Message, TransportError> {
        self.rx.recv().await.ok_or(TransportError::PeerClosed)
    }
}

/// An opaque, transferable capability with exactly one owner at a time.
///
/// Transferring (via [`Handle::take`] or by encoding it into a message)
/// invalidates the source; closing or dropping releases the resource, which
/// the peer observes as [`TransportError::PeerClosed`].
#[derive(Default)]
pub struct Handle {
    pipe: Option<MessagePipe>,
}

impl Handle {
    pub fn invalid() -> Self {
        Self::default()
    }

    pub(crate) fn from_pipe(pipe: MessagePipe) -> Self {
        Self { pipe: Some(pipe) }
    }

    pub fn is_valid(&self) -> bool {
        self.pipe.is_some()
    }

    /// Transfer ownership out, leaving this handle invalid.
    pub fn take(&mut self) -> Handle {
        Handle {
            pipe: self.pipe.take(),
        }
    }

    /// Release the underlying resource. Idempotent.
    pub fn close(&mut self) {
        self.pipe = None;
    }

    pub(crate) fn into_pipe(self) -> Option<MessagePipe> {
        self.pipe
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.write_str("Handle(valid)")
        } else {
            f.write_str("Handle(invalid)")
        }
    }
}

/// A handle bundled with the interface version the sender speaks, as
/// embedded in messages for interface-typed fields.
#[derive(Debug)]
pub struct InterfaceHandle {
    pub handle: Handle,
    pub version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(byte: u8) -> Message {
        Message::new(vec![byte], Vec::new())
    }

    #[tokio::test]
    async fn messages_arrive_in_fifo_order() {
        let (left, right) = message_pipe();
        let left = left.into_pipe().unwrap();
        let mut right = right.into_pipe().unwrap();

        for i in 0..4 {
            left.write(message(i)).unwrap();
        }
        for i in 0..4 {
            assert_eq!(right.readable().await.unwrap().data, vec![i]);
        }
    }

    #[tokio::test]
    async fn try_read_reports_should_wait_when_empty() {
        let (left, right) = message_pipe();
        let left = left.into_pipe().unwrap();
        let mut right = right.into_pipe().unwrap();

        assert_eq!(right.try_read().unwrap().map(|m| m.data), None);
        left.write(message(1)).unwrap();
        assert_eq!(right.try_read().unwrap().map(|m| m.data), Some(vec![1]));
    }

    #[tokio::test]
    async fn peer_close_surfaces_after_queued_messages() {
        let (left, right) = message_pipe();
        let left = left.into_pipe().unwrap();
        let mut right = right.into_pipe().unwrap();

        left.write(message(1)).unwrap();
        drop(left);

        assert!(right.try_read().unwrap().is_some());
        assert_eq!(right.try_read().unwrap_err(), TransportError::PeerClosed);
    }

    #[tokio::test]
    async fn write_to_closed_peer_fails() {
        let (left, right) = message_pipe();
        let left = left.into_pipe().unwrap();
        drop(right);

        assert_eq!(left.write(message(1)).unwrap_err(), TransportError::PeerClosed);
    }

    #[test]
    fn take_transfers_ownership() {
        let (mut left, _right) = message_pipe();
        let moved = left.take();
        assert!(!left.is_valid());
        assert!(moved.is_valid());
    }

    #[test]
    fn close_is_idempotent() {
        let (mut left, _right) = message_pipe();
        left.close();
        left.close();
        assert!(!left.is_valid());
    }
}

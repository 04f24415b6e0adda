//! Single-channel asynchronous I/O driver.
//!
//! A connector owns exactly one pipe endpoint. Reads are driven by one
//! asynchronous readability wait at a time; on wakeup every currently
//! available message is drained to a receiver, in arrival order, before the
//! wait is re-registered. Writes are direct and unbuffered; there is no
//! internal back-pressure queue.

use std::ops::ControlFlow;

use crate::error::BindingsError;
use crate::message::Message;
use crate::pipe::{Handle, MessagePipe, TransportError};

/// Callback target for drained messages.
///
/// `Break` asks the connector to stop dispatching and close (close mid-drain
/// is not an error); `Err` closes the connector and propagates.
pub trait MessageReceiver {
    fn accept(&mut self, message: Message) -> Result<ControlFlow<()>, BindingsError>;
}

/// Failure raised while draining.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("receiver rejected message: {0}")]
    Receiver(#[from] BindingsError),
}

/// Owns one pipe endpoint; open until closed, passed on, or hit by a
/// transport error.
#[derive(Debug)]
pub struct Connector {
    pipe: Option<MessagePipe>,
}

impl Connector {
    pub fn new(handle: Handle) -> Result<Self, BindingsError> {
        match handle.into_pipe() {
            Some(pipe) => Ok(Self { pipe: Some(pipe) }),
            None => Err(BindingsError::InvalidHandle),
        }
    }

    pub fn is_open(&self) -> bool {
        self.pipe.is_some()
    }

    /// Direct, unbuffered write.
    pub fn accept(&mut self, message: Message) -> Result<(), TransportError> {
        match self.pipe.as_ref() {
            Some(pipe) => pipe.write(message),
            None => Err(TransportError::Closed),
        }
    }

    /// The single registered readability wait. Dropping the returned future
    /// cancels the registration.
    pub async fn wait_for_readable(&mut self) -> Result<Message, TransportError> {
        match self.pipe.as_mut() {
            Some(pipe) => pipe.readable().await,
            None => Err(TransportError::Closed),
        }
    }

    /// Deliver `first`, then drain every message already queued on the
    /// pipe, in arrival order. Returns when the pipe reports should-wait
    /// (the caller re-registers the wait), when the receiver breaks, or on
    /// error.
    pub fn drain(
        &mut self,
        first: Message,
        receiver: &mut dyn MessageReceiver,
    ) -> Result<(), ConnectorError> {
        let mut next = Some(first);
        while let Some(message) = next.take() {
            match receiver.accept(message) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => {
                    tracing::debug!("receiver requested close mid-drain");
                    self.close();
                    return Ok(());
                }
                Err(error) => {
                    self.close();
                    return Err(ConnectorError::Receiver(error));
                }
            }
            let Some(pipe) = self.pipe.as_mut() else {
                return Ok(());
            };
            match pipe.try_read() {
                Ok(message) => next = message,
                Err(error) => {
                    self.close();
                    return Err(ConnectorError::Transport(error));
                }
            }
        }
        Ok(())
    }

    /// Cancel any outstanding wait and release the endpoint. Idempotent.
    pub fn close(&mut self) {
        if self.pipe.take().is_some() {
            tracing::debug!("connector closed");
        }
    }

    /// Cancel any outstanding wait and hand the endpoint back as a
    /// transferable handle. The connector is closed afterwards.
    pub fn pass_handle(&mut self) -> Handle {
        match self.pipe.take() {
            Some(pipe) => Handle::from_pipe(pipe),
            None => Handle::invalid(),
        }
    }
}

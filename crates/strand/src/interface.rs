//! Typed interface endpoints: [`Manager`], [`Proxy`], and [`Binding`].
//!
//! Generated bindings for an interface boil down to a manager constant
//! (service name plus newest version), a proxy wrapper whose methods call
//! [`Proxy::send`] / [`Proxy::call`] with the method's message type, and a
//! stub implementing [`IncomingReceiver`] that decodes requests and replies
//! through its [`Responder`]. The tests carry a complete hand-written
//! example of that shape.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::task::JoinHandle;

use crate::codec::StructType;
use crate::control;
use crate::error::BindingsError;
use crate::message::{MessageHeader, ServiceMessage, build_message};
use crate::pipe::Handle;
use crate::router::{IncomingReceiver, Responder, Router};

/// Per-interface metadata; one static instance per generated interface.
#[derive(Debug, Clone, Copy)]
pub struct Manager {
    pub service_name: &'static str,
    pub version: u32,
}

impl Manager {
    pub const fn new(service_name: &'static str, version: u32) -> Self {
        Self {
            service_name,
            version,
        }
    }

    /// Wire a stub to the receiving end of a channel and start its router.
    pub fn bind(
        &self,
        stub: Box<dyn IncomingReceiver>,
        handle: Handle,
    ) -> Result<Binding, BindingsError> {
        let (router, task) = Router::spawn(handle, stub, self.version, None)?;
        tracing::debug!(service = self.service_name, "interface bound");
        Ok(Binding { router, task })
    }

    /// Start a router for the calling end of a channel and hand back a
    /// proxy. Incoming requests on this endpoint are a peer bug and close
    /// the connection.
    pub fn attach_proxy(&self, handle: Handle) -> Result<Proxy, BindingsError> {
        let service_name = self.service_name;
        let (router, task) = Router::spawn(
            handle,
            Box::new(RejectCalls { service_name }),
            self.version,
            None,
        )?;
        Ok(Proxy {
            router,
            version: AtomicU32::new(0),
            service_name,
            task,
        })
    }
}

/// Receiver for proxy endpoints, which implement no requests.
struct RejectCalls {
    service_name: &'static str,
}

impl RejectCalls {
    fn reject(&self, msg_type: u32) -> BindingsError {
        tracing::error!(
            service = self.service_name,
            msg_type,
            "unexpected request on a proxy endpoint"
        );
        BindingsError::UnexpectedCall(msg_type)
    }
}

impl IncomingReceiver for RejectCalls {
    fn accept(&mut self, message: ServiceMessage) -> Result<(), BindingsError> {
        Err(self.reject(message.header.msg_type))
    }

    fn accept_with_responder(
        &mut self,
        message: ServiceMessage,
        _responder: Responder,
    ) -> Result<(), BindingsError> {
        Err(self.reject(message.header.msg_type))
    }
}

/// Service side of a bound interface.
#[derive(Debug)]
pub struct Binding {
    router: Router,
    task: JoinHandle<()>,
}

impl Binding {
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn close(&self) {
        self.router.close();
    }

    /// Wait for the binding's router task to finish.
    pub async fn closed(self) {
        let _ = self.task.await;
    }
}

/// Calling side of a bound interface. Dropping the proxy closes the
/// connection.
#[derive(Debug)]
pub struct Proxy {
    router: Router,
    /// Remote version as far as this proxy knows; 0 until negotiated.
    version: AtomicU32,
    service_name: &'static str,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

impl Proxy {
    /// One-way method invocation.
    pub fn send<Req: StructType>(&self, msg_type: u32, params: &Req) -> Result<(), BindingsError> {
        let message = build_message(&MessageHeader::simple(msg_type), params)?;
        self.router.accept(message)
    }

    /// Two-way method invocation: encode, send, await and decode the reply.
    /// A reply carrying a different message type is a peer bug.
    pub async fn call<Req: StructType, Resp: StructType>(
        &self,
        msg_type: u32,
        params: &Req,
    ) -> Result<Resp, BindingsError> {
        let message = build_message(&MessageHeader::expecting_response(msg_type), params)?;
        let response = ServiceMessage::parse(self.router.call(message).await?)?;
        if response.header.msg_type != msg_type {
            tracing::error!(
                service = self.service_name,
                want = msg_type,
                got = response.header.msg_type,
                "mismatched response type"
            );
            return Err(BindingsError::ResponseTypeMismatch {
                want: msg_type,
                got: response.header.msg_type,
            });
        }
        Ok(response.decode_payload()?)
    }

    /// Ask the remote endpoint for its version and remember the answer.
    pub async fn query_version(&self) -> Result<u32, BindingsError> {
        let version = control::query_version(&self.router).await?;
        self.version.store(version, Ordering::Relaxed);
        Ok(version)
    }

    /// Declare the minimum version this side needs. A peer that cannot
    /// satisfy it closes the connection; no acknowledgement is sent. A
    /// requirement already covered by the cached version is a no-op.
    pub fn require_version(&self, version: u32) -> Result<(), BindingsError> {
        if self.version.load(Ordering::Relaxed) >= version {
            return Ok(());
        }
        self.version.store(version, Ordering::Relaxed);
        self.router.accept(control::require_version_message(version)?)
    }

    /// Last version negotiated through [`Proxy::query_version`] or
    /// [`Proxy::require_version`]; 0 before either runs.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.router.close();
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.router.close();
    }
}

/// Encode a method result and send it through the responder. The message
/// type must repeat the call's; the request id is stamped by the router.
pub fn send_reply<T: StructType>(
    responder: Responder,
    msg_type: u32,
    payload: &T,
) -> Result<(), BindingsError> {
    let message = build_message(&MessageHeader::response(msg_type, 0), payload)?;
    responder.send(message)
}

//! strand: typed interface bindings over message pipes.
//!
//! A binary codec for versioned structs and unions, a validating decoder
//! for untrusted payloads, and a router that multiplexes request/response
//! interface calls over a single bidirectional message channel. Interfaces
//! follow the proxy/stub/manager shape; byte streams are bridged through
//! the `stream` adapter.

pub mod codec;
pub mod connector;
pub mod control;
pub mod executor;
pub mod interface;
pub mod message;
pub mod pipe;
pub mod router;
pub mod stream;

mod error;

pub use error::BindingsError;

pub use codec::{DeserializationError, SerializationError, StructType, StructVersion, UnionType};
pub use interface::{Binding, Manager, Proxy, send_reply};
pub use message::{Message, MessageHeader, ServiceMessage, build_message};
pub use pipe::{Handle, InterfaceHandle, TransportError, message_pipe};
pub use router::{IncomingReceiver, Responder, Router};

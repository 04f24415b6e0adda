//! Built-in version-negotiation messages.
//!
//! Every router answers these regardless of the interface bound on top of
//! it, so a caller can probe or enforce a remote version without the remote
//! interface having a method for it. The message ids sit at the top of the
//! ordinal space, out of reach of generated interfaces.

use std::ops::ControlFlow;

use crate::codec::{
    Decoder, DeserializationError, Encoder, SerializationError, StructType, StructVersion,
};
use crate::error::BindingsError;
use crate::message::{Message, MessageHeader, ServiceMessage, build_message};
use crate::router::{Responder, Router};

/// Two-way: asks the remote endpoint which interface version it implements.
pub const QUERY_VERSION_MESSAGE_ID: u32 = 0xFFFF_FFFE;

/// One-way: declares the minimum version the sender requires. An endpoint
/// that cannot satisfy it closes the connection.
pub const REQUIRE_VERSION_MESSAGE_ID: u32 = 0xFFFF_FFFF;

/// Empty request payload of a version query.
#[derive(Debug, Default, PartialEq)]
pub struct QueryVersionParams;

impl StructType for QueryVersionParams {
    const VERSIONS: &'static [StructVersion] = &[StructVersion {
        version: 0,
        size: 8,
    }];

    fn encode(&self, _encoder: &mut Encoder<'_>) -> Result<(), SerializationError> {
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DeserializationError> {
        decoder.read_struct_header(Self::VERSIONS)?;
        Ok(Self)
    }
}

/// Version reported back by a query.
#[derive(Debug, PartialEq)]
pub struct QueryVersionResult {
    pub version: u32,
}

impl StructType for QueryVersionResult {
    const VERSIONS: &'static [StructVersion] = &[StructVersion {
        version: 0,
        size: 16,
    }];

    fn encode(&self, encoder: &mut Encoder<'_>) -> Result<(), SerializationError> {
        encoder.write::<u32>(8, self.version);
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DeserializationError> {
        decoder.read_struct_header(Self::VERSIONS)?;
        Ok(Self {
            version: decoder.read::<u32>(8)?,
        })
    }
}

/// Minimum version demanded of the receiving endpoint.
#[derive(Debug, PartialEq)]
pub struct RequireVersionParams {
    pub version: u32,
}

impl StructType for RequireVersionParams {
    const VERSIONS: &'static [StructVersion] = &[StructVersion {
        version: 0,
        size: 16,
    }];

    fn encode(&self, encoder: &mut Encoder<'_>) -> Result<(), SerializationError> {
        encoder.write::<u32>(8, self.version);
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DeserializationError> {
        decoder.read_struct_header(Self::VERSIONS)?;
        Ok(Self {
            version: decoder.read::<u32>(8)?,
        })
    }
}

/// Ask the remote endpoint for its interface version.
pub async fn query_version(router: &Router) -> Result<u32, BindingsError> {
    let call = build_message(
        &MessageHeader::expecting_response(QUERY_VERSION_MESSAGE_ID),
        &QueryVersionParams,
    )?;
    let response = ServiceMessage::parse(router.call(call).await?)?;
    if response.header.msg_type != QUERY_VERSION_MESSAGE_ID {
        return Err(BindingsError::ResponseTypeMismatch {
            want: QUERY_VERSION_MESSAGE_ID,
            got: response.header.msg_type,
        });
    }
    Ok(response.decode_payload::<QueryVersionResult>()?.version)
}

/// Build the one-way message declaring a minimum required version.
pub fn require_version_message(version: u32) -> Result<Message, SerializationError> {
    build_message(
        &MessageHeader::simple(REQUIRE_VERSION_MESSAGE_ID),
        &RequireVersionParams { version },
    )
}

/// Router side: answer an incoming version query with our own version.
pub(crate) fn answer_query_version(
    responder: Responder,
    version: u32,
) -> Result<(), BindingsError> {
    let reply = build_message(
        &MessageHeader::response(QUERY_VERSION_MESSAGE_ID, 0),
        &QueryVersionResult { version },
    )?;
    responder.send(reply)
}

/// Router side: enforce an incoming version requirement. `Break` asks the
/// router to close the connection.
pub(crate) fn handle_require_version(
    message: ServiceMessage,
    version: u32,
) -> Result<ControlFlow<()>, BindingsError> {
    let required = message.decode_payload::<RequireVersionParams>()?.version;
    if required > version {
        tracing::warn!(
            required,
            implemented = version,
            "peer requires a newer interface version, closing"
        );
        Ok(ControlFlow::Break(()))
    } else {
        Ok(ControlFlow::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{TransportError, message_pipe};
    use crate::router::{IncomingReceiver, Router};

    struct RejectAll;

    impl IncomingReceiver for RejectAll {
        fn accept(&mut self, message: ServiceMessage) -> Result<(), BindingsError> {
            Err(BindingsError::UnexpectedCall(message.header.msg_type))
        }

        fn accept_with_responder(
            &mut self,
            message: ServiceMessage,
            _responder: Responder,
        ) -> Result<(), BindingsError> {
            Err(BindingsError::UnexpectedCall(message.header.msg_type))
        }
    }

    #[tokio::test]
    async fn query_is_answered_with_the_bound_version() {
        let (local, remote) = message_pipe();
        let (_router, _join) = Router::spawn(local, Box::new(RejectAll), 3, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        let mut call = ServiceMessage::parse(
            build_message(
                &MessageHeader::expecting_response(QUERY_VERSION_MESSAGE_ID),
                &QueryVersionParams,
            )
            .unwrap(),
        )
        .unwrap();
        call.set_request_id(11);
        peer.write(call.into_message()).unwrap();

        let reply = ServiceMessage::parse(peer.readable().await.unwrap()).unwrap();
        assert!(reply.header.is_response());
        assert_eq!(reply.header.request_id, 11);
        assert_eq!(reply.header.msg_type, QUERY_VERSION_MESSAGE_ID);
        assert_eq!(
            reply.decode_payload::<QueryVersionResult>().unwrap(),
            QueryVersionResult { version: 3 }
        );
    }

    #[tokio::test]
    async fn query_version_helper_reads_the_peer_reply() {
        let (local, remote) = message_pipe();
        let (router, _join) = Router::spawn(local, Box::new(RejectAll), 0, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        let query = tokio::spawn(async move { query_version(&router).await });

        let call = ServiceMessage::parse(peer.readable().await.unwrap()).unwrap();
        assert_eq!(call.header.msg_type, QUERY_VERSION_MESSAGE_ID);
        let request_id = call.header.request_id;
        let reply = build_message(
            &MessageHeader::response(QUERY_VERSION_MESSAGE_ID, request_id),
            &QueryVersionResult { version: 7 },
        )
        .unwrap();
        peer.write(reply).unwrap();

        assert_eq!(query.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn satisfiable_requirement_keeps_the_connection_open() {
        let (local, remote) = message_pipe();
        let (_router, _join) = Router::spawn(local, Box::new(RejectAll), 3, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        peer.write(require_version_message(2).unwrap()).unwrap();

        // The endpoint still answers queries afterwards.
        let mut call = ServiceMessage::parse(
            build_message(
                &MessageHeader::expecting_response(QUERY_VERSION_MESSAGE_ID),
                &QueryVersionParams,
            )
            .unwrap(),
        )
        .unwrap();
        call.set_request_id(1);
        peer.write(call.into_message()).unwrap();
        let reply = ServiceMessage::parse(peer.readable().await.unwrap()).unwrap();
        assert_eq!(
            reply.decode_payload::<QueryVersionResult>().unwrap().version,
            3
        );
    }

    #[tokio::test]
    async fn unsatisfiable_requirement_closes_the_connection() {
        let (local, remote) = message_pipe();
        let (_router, join) = Router::spawn(local, Box::new(RejectAll), 3, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        peer.write(require_version_message(5).unwrap()).unwrap();

        join.await.unwrap();
        assert_eq!(
            peer.readable().await.unwrap_err(),
            TransportError::PeerClosed
        );
    }
}

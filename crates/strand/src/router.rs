//! Request/response correlation and call dispatch on top of a [`Connector`].
//!
//! A router runs as one tokio task owning the connector, the responder
//! table, and the request-id counter; nothing else touches that state. A
//! cloneable [`Router`] handle feeds it commands over an unbounded channel,
//! which is also how replies written by stubs and callbacks posted from
//! other threads reach the owning task.

use std::collections::HashMap;
use std::ops::ControlFlow;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connector::{Connector, ConnectorError, MessageReceiver};
use crate::control;
use crate::error::BindingsError;
use crate::executor::Task;
use crate::message::{Message, ServiceMessage};
use crate::pipe::{Handle, TransportError};

/// Invoked once if the router is torn down by a transport error. Dropped
/// with the router task, never called on an orderly close.
pub type ErrorHandler = Box<dyn FnOnce(TransportError) + Send + 'static>;

/// Application-side target for incoming calls: a stub, or a rejecting
/// placeholder on plain proxy endpoints.
pub trait IncomingReceiver: Send + 'static {
    /// A one-way call.
    fn accept(&mut self, message: ServiceMessage) -> Result<(), BindingsError>;

    /// A two-way call. The reply goes back through `responder`; dropping it
    /// without replying closes the connection.
    fn accept_with_responder(
        &mut self,
        message: ServiceMessage,
        responder: Responder,
    ) -> Result<(), BindingsError>;
}

enum Command {
    Accept(Message),
    Call {
        message: Message,
        reply: oneshot::Sender<Result<Message, BindingsError>>,
    },
    Respond {
        request_id: u64,
        message: Message,
    },
    Schedule(Task),
    Close,
}

/// Handle to a router task.
#[derive(Debug, Clone)]
pub struct Router {
    commands: mpsc::UnboundedSender<Command>,
}

impl Router {
    /// Take ownership of a channel endpoint and start the owning task.
    ///
    /// `interface_version` is the version this side implements; it is what
    /// built-in version-negotiation control messages answer with.
    pub fn spawn(
        handle: Handle,
        receiver: Box<dyn IncomingReceiver>,
        interface_version: u32,
        on_error: Option<ErrorHandler>,
    ) -> Result<(Router, JoinHandle<()>), BindingsError> {
        let connector = Connector::new(handle)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = RouterTask {
            connector,
            state: RouterState {
                receiver,
                responders: HashMap::new(),
                next_request_id: 0,
                interface_version,
                commands: commands_tx.clone(),
            },
            commands: commands_rx,
            on_error,
        };
        let join = tokio::spawn(task.run());
        Ok((
            Router {
                commands: commands_tx,
            },
            join,
        ))
    }

    /// Send a one-way message.
    pub fn accept(&self, message: Message) -> Result<(), BindingsError> {
        self.commands
            .send(Command::Accept(message))
            .map_err(|_| BindingsError::RouterClosed)
    }

    /// Send a two-way call and wait for its response. The message must use
    /// the expecting-response header shape; the router assigns the request
    /// id and matches the reply back regardless of arrival order.
    pub async fn call(&self, message: Message) -> Result<Message, BindingsError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                message,
                reply: reply_tx,
            })
            .map_err(|_| BindingsError::RouterClosed)?;
        reply_rx
            .await
            .map_err(|_| BindingsError::Transport(TransportError::PeerClosed))?
    }

    /// Run a callback on the router's owning task, interleaved with
    /// message dispatch.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) -> Result<(), BindingsError> {
        self.commands
            .send(Command::Schedule(Box::new(task)))
            .map_err(|_| BindingsError::RouterClosed)
    }

    /// Orderly close: tears the connector down without invoking the error
    /// handler.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// One-shot reply channel for an incoming two-way call.
///
/// Holds the request id of the originating call; `send` stamps it into the
/// reply. Dropping a responder without replying deterministically closes
/// the router, since the peer would otherwise wait forever.
#[must_use = "dropping a responder without replying closes the connection"]
pub struct Responder {
    commands: Option<mpsc::UnboundedSender<Command>>,
    request_id: u64,
}

impl Responder {
    fn new(commands: mpsc::UnboundedSender<Command>, request_id: u64) -> Self {
        Self {
            commands: Some(commands),
            request_id,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Send the reply back through the originating router. `message` must
    /// use the response header shape; the request id is stamped here.
    pub fn send(mut self, message: Message) -> Result<(), BindingsError> {
        let commands = self.commands.take().ok_or(BindingsError::RouterClosed)?;
        commands
            .send(Command::Respond {
                request_id: self.request_id,
                message,
            })
            .map_err(|_| BindingsError::RouterClosed)
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            tracing::debug!(
                request_id = self.request_id,
                "responder dropped without a reply, closing router"
            );
            let _ = commands.send(Command::Close);
        }
    }
}

struct RouterTask {
    connector: Connector,
    state: RouterState,
    commands: mpsc::UnboundedReceiver<Command>,
    on_error: Option<ErrorHandler>,
}

struct RouterState {
    receiver: Box<dyn IncomingReceiver>,
    responders: HashMap<u64, oneshot::Sender<Result<Message, BindingsError>>>,
    next_request_id: u64,
    interface_version: u32,
    commands: mpsc::UnboundedSender<Command>,
}

impl RouterTask {
    async fn run(mut self) {
        let failure = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => break None,
                    Some(command) => match self.handle_command(command) {
                        ControlFlow::Continue(()) => {}
                        ControlFlow::Break(failure) => break failure,
                    },
                },
                readable = self.connector.wait_for_readable() => match readable {
                    Ok(first) => match self.connector.drain(first, &mut self.state) {
                        Ok(()) if self.connector.is_open() => {}
                        Ok(()) => break None,
                        Err(ConnectorError::Transport(error)) => break Some(error),
                        Err(ConnectorError::Receiver(error)) => {
                            tracing::warn!(error = %error, "closing router after dispatch failure");
                            break None;
                        }
                    },
                    Err(error) => break Some(error),
                },
            }
        };
        self.shutdown(failure);
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<Option<TransportError>> {
        match command {
            Command::Accept(message) => match self.connector.accept(message) {
                Ok(()) => ControlFlow::Continue(()),
                Err(error) => ControlFlow::Break(Some(error)),
            },
            Command::Call { message, reply } => self.handle_call(message, reply),
            Command::Respond {
                request_id,
                message,
            } => self.handle_respond(request_id, message),
            Command::Schedule(task) => {
                task();
                ControlFlow::Continue(())
            }
            Command::Close => ControlFlow::Break(None),
        }
    }

    fn handle_call(
        &mut self,
        message: Message,
        reply: oneshot::Sender<Result<Message, BindingsError>>,
    ) -> ControlFlow<Option<TransportError>> {
        let mut parsed = match ServiceMessage::parse(message) {
            Ok(parsed) => parsed,
            Err(error) => {
                let _ = reply.send(Err(error.into()));
                return ControlFlow::Continue(());
            }
        };
        if !parsed.header.expects_response() {
            let _ = reply.send(Err(BindingsError::NotACall));
            return ControlFlow::Continue(());
        }
        let request_id = self.state.allocate_request_id();
        if self.state.responders.contains_key(&request_id) {
            let _ = reply.send(Err(BindingsError::DuplicateRequestId(request_id)));
            return ControlFlow::Continue(());
        }
        parsed.set_request_id(request_id);
        tracing::trace!(
            request_id,
            msg_type = parsed.header.msg_type,
            "sending call"
        );
        match self.connector.accept(parsed.into_message()) {
            Ok(()) => {
                // Register only after a successful write; a failed call
                // must not leave a dangling table entry.
                self.state.responders.insert(request_id, reply);
                ControlFlow::Continue(())
            }
            Err(error) => {
                let _ = reply.send(Err(BindingsError::Transport(error)));
                ControlFlow::Break(Some(error))
            }
        }
    }

    fn handle_respond(
        &mut self,
        request_id: u64,
        message: Message,
    ) -> ControlFlow<Option<TransportError>> {
        let mut parsed = match ServiceMessage::parse(message) {
            Ok(parsed) if parsed.header.is_response() => parsed,
            Ok(parsed) => {
                tracing::error!(
                    msg_type = parsed.header.msg_type,
                    "reply does not use the response header shape"
                );
                return ControlFlow::Continue(());
            }
            Err(error) => {
                tracing::error!(error = %error, "malformed reply message");
                return ControlFlow::Continue(());
            }
        };
        parsed.set_request_id(request_id);
        match self.connector.accept(parsed.into_message()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(error) => ControlFlow::Break(Some(error)),
        }
    }

    fn shutdown(mut self, failure: Option<TransportError>) {
        self.connector.close();
        for (request_id, reply) in self.state.responders.drain() {
            tracing::debug!(request_id, "failing pending call at router shutdown");
            let _ = reply.send(Err(BindingsError::Transport(TransportError::PeerClosed)));
        }
        match failure {
            Some(error) => {
                tracing::warn!(error = %error, "router closed by transport error");
                if let Some(handler) = self.on_error.take() {
                    handler(error);
                }
            }
            None => tracing::debug!("router closed"),
        }
    }
}

impl RouterState {
    /// Next nonzero request id. Monotonic per router; `0` is reserved and
    /// skipped at wrap-around.
    fn allocate_request_id(&mut self) -> u64 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        if self.next_request_id == 0 {
            self.next_request_id = 1;
        }
        self.next_request_id
    }

    fn handle_incoming(&mut self, message: Message) -> Result<ControlFlow<()>, BindingsError> {
        let parsed = ServiceMessage::parse(message)?;
        match parsed.header.msg_type {
            control::QUERY_VERSION_MESSAGE_ID => {
                let responder =
                    Responder::new(self.commands.clone(), parsed.header.request_id);
                control::answer_query_version(responder, self.interface_version)?;
                Ok(ControlFlow::Continue(()))
            }
            control::REQUIRE_VERSION_MESSAGE_ID => {
                control::handle_require_version(parsed, self.interface_version)
            }
            _ if parsed.header.expects_response() => {
                let responder =
                    Responder::new(self.commands.clone(), parsed.header.request_id);
                self.receiver.accept_with_responder(parsed, responder)?;
                Ok(ControlFlow::Continue(()))
            }
            _ if parsed.header.is_response() => {
                match self.responders.remove(&parsed.header.request_id) {
                    Some(reply) => {
                        let _ = reply.send(Ok(parsed.into_message()));
                    }
                    // Lenient by design: an unmatched response is dropped,
                    // not treated as a protocol error.
                    None => tracing::debug!(
                        request_id = parsed.header.request_id,
                        "dropping response with no pending call"
                    ),
                }
                Ok(ControlFlow::Continue(()))
            }
            _ => {
                self.receiver.accept(parsed)?;
                Ok(ControlFlow::Continue(()))
            }
        }
    }
}

impl MessageReceiver for RouterState {
    fn accept(&mut self, message: Message) -> Result<ControlFlow<()>, BindingsError> {
        self.handle_incoming(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{
        Decoder, DeserializationError, Encoder, SerializationError, StructType, StructVersion,
    };
    use crate::message::{MessageHeader, build_message};
    use crate::pipe::message_pipe;

    #[derive(Debug, PartialEq)]
    struct Seq {
        seq: u64,
    }

    impl StructType for Seq {
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

    /// Forwards incoming one-way message types to a channel.
    struct ForwardTypes {
        tx: mpsc::UnboundedSender<u32>,
    }

    impl IncomingReceiver for ForwardTypes {
        fn accept(&mut self, message: ServiceMessage) -> Result<(), BindingsError> {
            self.tx
                .send(message.header.msg_type)
                .map_err(|_| BindingsError::RouterClosed)
        }

        fn accept_with_responder(
            &mut self,
            message: ServiceMessage,
            _responder: Responder,
        ) -> Result<(), BindingsError> {
            Err(BindingsError::UnexpectedCall(message.header.msg_type))
        }
    }

    /// Echoes `seq` back doubled.
    struct Doubler;

    impl IncomingReceiver for Doubler {
        fn accept(&mut self, message: ServiceMessage) -> Result<(), BindingsError> {
            Err(BindingsError::UnexpectedCall(message.header.msg_type))
        }

        fn accept_with_responder(
            &mut self,
            message: ServiceMessage,
            responder: Responder,
        ) -> Result<(), BindingsError> {
            let msg_type = message.header.msg_type;
            let request: Seq = message.decode_payload()?;
            let reply = build_message(
                &MessageHeader::response(msg_type, 0),
                &Seq {
                    seq: request.seq * 2,
                },
            )?;
            responder.send(reply)
        }
    }

    /// Drops the responder on the floor.
    struct DropResponder;

    impl IncomingReceiver for DropResponder {
        fn accept(&mut self, message: ServiceMessage) -> Result<(), BindingsError> {
            Err(BindingsError::UnexpectedCall(message.header.msg_type))
        }

        fn accept_with_responder(
            &mut self,
            _message: ServiceMessage,
            responder: Responder,
        ) -> Result<(), BindingsError> {
            drop(responder);
            Ok(())
        }
    }

    fn call_message(msg_type: u32, seq: u64) -> Message {
        build_message(&MessageHeader::expecting_response(msg_type), &Seq { seq }).unwrap()
    }

    #[tokio::test]
    async fn reversed_response_order_still_matches_callers() {
        let (local, remote) = message_pipe();
        let (router, _join) = Router::spawn(local, Box::new(RejectAll), 0, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        let router_a = router.clone();
        let call_a = tokio::spawn(async move { router_a.call(call_message(1, 10)).await });
        let router_b = router.clone();
        let call_b = tokio::spawn(async move { router_b.call(call_message(2, 20)).await });

        // Collect both outgoing calls, whatever order the tasks ran in.
        let mut pending = Vec::new();
        for _ in 0..2 {
            let parsed = ServiceMessage::parse(peer.readable().await.unwrap()).unwrap();
            assert!(parsed.header.expects_response());
            assert_ne!(parsed.header.request_id, 0);
            pending.push((parsed.header.msg_type, parsed.header.request_id));
        }
        let ids: Vec<u64> = pending.iter().map(|(_, id)| *id).collect();
        assert_ne!(ids[0], ids[1]);
        assert!(ids.iter().all(|id| *id >= 1 && *id <= 2));

        // Answer in reverse arrival order.
        for (msg_type, request_id) in pending.iter().rev() {
            let reply = build_message(
                &MessageHeader::response(*msg_type, *request_id),
                &Seq {
                    seq: *msg_type as u64 * 100,
                },
            )
            .unwrap();
            peer.write(reply).unwrap();
        }

        let reply_a = call_a.await.unwrap().unwrap();
        let reply_b = call_b.await.unwrap().unwrap();
        assert_eq!(
            ServiceMessage::parse(reply_a)
                .unwrap()
                .decode_payload::<Seq>()
                .unwrap()
                .seq,
            100
        );
        assert_eq!(
            ServiceMessage::parse(reply_b)
                .unwrap()
                .decode_payload::<Seq>()
                .unwrap()
                .seq,
            200
        );
    }

    #[tokio::test]
    async fn request_ids_are_strictly_increasing() {
        let (local, remote) = message_pipe();
        let (router, _join) = Router::spawn(local, Box::new(RejectAll), 0, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        let mut previous = 0;
        for i in 0..5 {
            let router = router.clone();
            let call = tokio::spawn(async move { router.call(call_message(9, i)).await });
            let parsed = ServiceMessage::parse(peer.readable().await.unwrap()).unwrap();
            assert!(parsed.header.request_id > previous);
            previous = parsed.header.request_id;

            let reply = build_message(
                &MessageHeader::response(9, parsed.header.request_id),
                &Seq { seq: i },
            )
            .unwrap();
            peer.write(reply).unwrap();
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped_not_fatal() {
        let (local, remote) = message_pipe();
        let (router, _join) = Router::spawn(local, Box::new(RejectAll), 0, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        let stray =
            build_message(&MessageHeader::response(9, 777), &Seq { seq: 0 }).unwrap();
        peer.write(stray).unwrap();

        // The router keeps working afterwards.
        let call_router = router.clone();
        let call = tokio::spawn(async move { call_router.call(call_message(1, 5)).await });
        let parsed = ServiceMessage::parse(peer.readable().await.unwrap()).unwrap();
        let reply = build_message(
            &MessageHeader::response(1, parsed.header.request_id),
            &Seq { seq: 6 },
        )
        .unwrap();
        peer.write(reply).unwrap();
        let response = call.await.unwrap().unwrap();
        assert_eq!(
            ServiceMessage::parse(response)
                .unwrap()
                .decode_payload::<Seq>()
                .unwrap()
                .seq,
            6
        );
    }

    #[tokio::test]
    async fn one_way_messages_reach_the_receiver_in_order() {
        let (local, remote) = message_pipe();
        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel();
        let (_router, _join) =
            Router::spawn(local, Box::new(ForwardTypes { tx: forward_tx }), 0, None).unwrap();
        let peer = remote.into_pipe().unwrap();

        for msg_type in [3, 4, 5] {
            let message =
                build_message(&MessageHeader::simple(msg_type), &Seq { seq: 0 }).unwrap();
            peer.write(message).unwrap();
        }
        for expected in [3, 4, 5] {
            assert_eq!(forward_rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn incoming_call_is_answered_through_the_responder() {
        let (local, remote) = message_pipe();
        let (_router, _join) = Router::spawn(local, Box::new(Doubler), 0, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        let mut call =
            ServiceMessage::parse(call_message(6, 21)).unwrap();
        call.set_request_id(55);
        peer.write(call.into_message()).unwrap();

        let reply = ServiceMessage::parse(peer.readable().await.unwrap()).unwrap();
        assert!(reply.header.is_response());
        assert_eq!(reply.header.request_id, 55);
        assert_eq!(reply.header.msg_type, 6);
        assert_eq!(reply.decode_payload::<Seq>().unwrap().seq, 42);
    }

    #[tokio::test]
    async fn dropped_responder_closes_the_connection() {
        let (local, remote) = message_pipe();
        let (_router, join) = Router::spawn(local, Box::new(DropResponder), 0, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        let mut call = ServiceMessage::parse(call_message(6, 1)).unwrap();
        call.set_request_id(1);
        peer.write(call.into_message()).unwrap();

        join.await.unwrap();
        assert_eq!(peer.readable().await.unwrap_err(), TransportError::PeerClosed);
    }

    #[tokio::test]
    async fn rejecting_receiver_closes_the_connection() {
        let (local, remote) = message_pipe();
        let (_router, join) = Router::spawn(local, Box::new(RejectAll), 0, None).unwrap();
        let mut peer = remote.into_pipe().unwrap();

        let message = build_message(&MessageHeader::simple(8), &Seq { seq: 0 }).unwrap();
        peer.write(message).unwrap();

        join.await.unwrap();
        assert_eq!(peer.readable().await.unwrap_err(), TransportError::PeerClosed);
    }

    #[tokio::test]
    async fn transport_error_invokes_error_handler_and_fails_pending_calls() {
        let (local, remote) = message_pipe();
        let (error_tx, error_rx) = oneshot::channel();
        let (router, _join) = Router::spawn(
            local,
            Box::new(RejectAll),
            0,
            Some(Box::new(move |error| {
                let _ = error_tx.send(error);
            })),
        )
        .unwrap();
        let mut peer = remote.into_pipe().unwrap();

        let call_router = router.clone();
        let call = tokio::spawn(async move { call_router.call(call_message(1, 1)).await });
        // Wait for the call to hit the wire, then sever the transport.
        let _ = peer.readable().await.unwrap();
        drop(peer);

        assert_eq!(error_rx.await.unwrap(), TransportError::PeerClosed);
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            BindingsError::Transport(TransportError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn scheduled_callbacks_run_on_the_router_task() {
        let (local, _remote) = message_pipe();
        let (router, _join) = Router::spawn(local, Box::new(RejectAll), 0, None).unwrap();

        let (done_tx, done_rx) = oneshot::channel();
        router
            .schedule(move || {
                let _ = done_tx.send(std::thread::current().id());
            })
            .unwrap();
        done_rx.await.unwrap();
    }

    #[tokio::test]
    async fn call_after_close_fails_with_router_closed() {
        let (local, _remote) = message_pipe();
        let (router, join) = Router::spawn(local, Box::new(RejectAll), 0, None).unwrap();
        router.close();
        join.await.unwrap();
        let err = router.call(call_message(1, 1)).await.unwrap_err();
        assert!(matches!(err, BindingsError::RouterClosed));
    }

    #[tokio::test]
    async fn one_way_message_with_call_api_is_rejected() {
        let (local, _remote) = message_pipe();
        let (router, _join) = Router::spawn(local, Box::new(RejectAll), 0, None).unwrap();
        let message = build_message(&MessageHeader::simple(1), &Seq { seq: 0 }).unwrap();
        let err = router.call(message).await.unwrap_err();
        assert!(matches!(err, BindingsError::NotACall));
    }
}

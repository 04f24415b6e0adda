//! Wires an echo service stub and proxy over an in-process message pipe
//! and exercises one-way calls, two-way calls, and version negotiation.
//!
//! Run with `RUST_LOG=debug` to watch the routers at work.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use strand::codec::{Decoder, DeserializationError, Encoder, SerializationError, StructVersion};
use strand::{
    BindingsError, IncomingReceiver, Manager, Responder, ServiceMessage, StructType, message_pipe,
    send_reply,
};

const ECHO: Manager = Manager::new("demo.Echo", 1);

const MSG_SET_PREFIX: u32 = 0;
const MSG_ECHO: u32 = 1;

struct Text {
    text: String,
}

impl StructType for Text {
    const VERSIONS: &'static [StructVersion] = &[StructVersion {
        version: 0,
        size: 16,
    }];

    fn encode(&self, encoder: &mut Encoder<'_>) -> Result<(), SerializationError> {
        encoder.write_string(8, Some(&self.text), false)
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DeserializationError> {
        decoder.read_struct_header(Self::VERSIONS)?;
        Ok(Self {
            text: decoder.read_string(8, false)?.unwrap_or_default(),
        })
    }
}

struct EchoStub {
    prefix: String,
}

impl IncomingReceiver for EchoStub {
    fn accept(&mut self, message: ServiceMessage) -> Result<(), BindingsError> {
        match message.header.msg_type {
            MSG_SET_PREFIX => {
                let params: Text = message.decode_payload()?;
                tracing::info!(prefix = %params.text, "prefix updated");
                self.prefix = params.text;
                Ok(())
            }
            other => Err(BindingsError::UnexpectedCall(other)),
        }
    }

    fn accept_with_responder(
        &mut self,
        message: ServiceMessage,
        responder: Responder,
    ) -> Result<(), BindingsError> {
        match message.header.msg_type {
            MSG_ECHO => {
                let params: Text = message.decode_payload()?;
                let text = format!("{}{}", self.prefix, params.text);
                send_reply(responder, MSG_ECHO, &Text { text })
            }
            other => Err(BindingsError::UnexpectedCall(other)),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .ok();

    let (client, server) = message_pipe();
    let binding = ECHO.bind(
        Box::new(EchoStub {
            prefix: String::new(),
        }),
        server,
    )?;
    let proxy = ECHO.attach_proxy(client)?;

    let version = proxy.query_version().await?;
    tracing::info!(version, "connected to echo service");

    proxy.send(
        MSG_SET_PREFIX,
        &Text {
            text: "> ".to_string(),
        },
    )?;

    for text in ["hello", "strand"] {
        let reply: Text = proxy
            .call(
                MSG_ECHO,
                &Text {
                    text: text.to_string(),
                },
            )
            .await?;
        tracing::info!(sent = text, got = %reply.text, "echo round trip");
    }

    proxy.close();
    binding.closed().await;
    Ok(())
}

//! Binding of an [`RpcHandler`] to one live transport
//!
//! The endpoint owns envelope (de)serialization. It holds nothing but the
//! handler and the transport, so a fresh endpoint is built for every new
//! connection while registrations stay on the shared handler.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{BridgeError, CallError, TransportError};
use crate::handler::{CallFuture, EnvelopeSink, Handled, RpcHandler};
use crate::protocol::Envelope;

/// A duplex channel that carries text frames
///
/// Implementations must not block. Socket writers usually sit behind a
/// channel drained by the task that owns the socket, see [`ChannelTransport`].
pub trait Transport: Send + Sync {
    /// Queue one text frame for delivery
    fn send_text(&self, text: String) -> Result<(), TransportError>;
}

/// Transport that queues frames on an unbounded channel
///
/// The receiving half belongs to the task that owns the real socket.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its frames arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}

/// One inbound frame as delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// Sink that encodes envelopes onto a transport
#[derive(Clone)]
pub struct TransportSink {
    transport: Arc<dyn Transport>,
}

impl TransportSink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl EnvelopeSink for TransportSink {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.transport.send_text(envelope.encode())
    }
}

/// A handler bound to one transport
#[derive(Clone)]
pub struct RpcEndpoint {
    handler: RpcHandler,
    sink: TransportSink,
    pre_args: Vec<Value>,
}

impl RpcEndpoint {
    /// Bind `handler` to `transport`
    pub fn new(handler: RpcHandler, transport: Arc<dyn Transport>) -> Self {
        Self {
            handler,
            sink: TransportSink::new(transport),
            pre_args: Vec::new(),
        }
    }

    /// Prepend `pre_args` to the arguments of every inbound request
    ///
    /// The host uses this to tell its handlers which connection a request
    /// came from.
    pub fn with_pre_args(mut self, pre_args: Vec<Value>) -> Self {
        self.pre_args = pre_args;
        self
    }

    /// The shared handler this endpoint dispatches to
    pub fn handler(&self) -> &RpcHandler {
        &self.handler
    }

    /// Register a method on the shared handler
    pub fn handle<F, Fut>(&self, name: impl Into<String>, func: F) -> Result<(), BridgeError>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handler.handle(name, func)
    }

    /// Remove a method from the shared handler
    pub fn unhandle(&self, name: &str) {
        self.handler.unhandle(name);
    }

    /// Call `name` on the remote side of this transport
    pub fn call(&self, name: &str, args: Vec<Value>) -> CallFuture {
        self.handler.call(name, &self.sink, args)
    }

    /// Call `name` and decode the result into `R`
    pub async fn call_as<R>(&self, name: &str, args: Vec<Value>) -> Result<R, CallError>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.handler.call_as(name, &self.sink, args).await
    }

    /// Process one inbound frame
    ///
    /// # Errors
    ///
    /// [`BridgeError::NonTextFrame`] for binary payloads and
    /// [`BridgeError::MalformedFrame`] for text that is not an envelope.
    /// Both are dropped without any reply. Errors from the handler are
    /// passed through.
    pub async fn receive(&self, payload: Payload) -> Result<Handled, BridgeError> {
        let text = match payload {
            Payload::Text(text) => text,
            Payload::Binary(_) => return Err(BridgeError::NonTextFrame),
        };
        let envelope = Envelope::decode(&text)?;
        self.handler
            .handle_message(envelope, &self.sink, self.pre_args.clone())
            .await
    }

    /// Process one inbound frame on its own task
    ///
    /// Requests run concurrently so a slow handler does not hold up
    /// responses behind it. Drops are logged at debug level.
    pub fn spawn_receive(&self, payload: Payload) -> JoinHandle<()> {
        let endpoint = self.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoint.receive(payload).await {
                debug!("inbound frame dropped: {}", e);
            }
        })
    }
}

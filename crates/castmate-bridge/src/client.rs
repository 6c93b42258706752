//! Reconnecting overlay client
//!
//! The client keeps one [`RpcHandler`] for its whole life. Each successful
//! connection gets a fresh endpoint bound to that handler and is attached to
//! the [`Link`]; the state bridge replays its acquisitions on every attach.

use std::sync::Arc;
use std::time::Duration;

use castmate_rpc::{
    BridgeError, CallPolicy, ChannelTransport, EnvelopeSink, Link, MethodNames, Payload,
    RpcEndpoint, RpcHandler, StateBridge, WidgetRouter,
};
use futures::{SinkExt, StreamExt};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Append the overlay id to a host WebSocket URL
pub fn overlay_url(base: &str, overlay: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{}{}overlay={}",
        base,
        separator,
        utf8_percent_encode(overlay, NON_ALPHANUMERIC)
    )
}

/// Client side of the bridge: one handler, one link, and the caches on top
#[derive(Clone)]
pub struct BridgeClient {
    rpc: RpcHandler,
    link: Link,
    state: StateBridge,
    widgets: WidgetRouter,
}

impl BridgeClient {
    pub fn new(methods: MethodNames, policy: CallPolicy) -> Result<Self, BridgeError> {
        let rpc = RpcHandler::with_policy(policy);
        let link = Link::new();
        let sink: Arc<dyn EnvelopeSink> = Arc::new(link.clone());
        let state = StateBridge::new(rpc.clone(), Arc::clone(&sink), methods.clone())?;
        let widgets = WidgetRouter::new(rpc.clone(), sink, methods)?;
        Ok(Self {
            rpc,
            link,
            state,
            widgets,
        })
    }

    pub fn state(&self) -> &StateBridge {
        &self.state
    }

    pub fn widgets(&self) -> &WidgetRouter {
        &self.widgets
    }

    /// Connect to `url` and keep reconnecting until cancelled
    pub async fn run(&self, url: &str, reconnect_delay: Duration, cancel: CancellationToken) {
        let follower = self.state.follow(&self.link);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(url) => match result {
                    Ok((socket, _)) => {
                        info!(url = %url, "connected to host");
                        self.serve(socket, &cancel).await;
                    }
                    Err(e) => warn!(url = %url, "connect failed: {}", e),
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        }

        follower.abort();
        info!("client stopped");
    }

    /// Pump one socket until it closes or the client is cancelled
    async fn serve(&self, mut socket: Socket, cancel: &CancellationToken) {
        let (transport, mut outbound) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let endpoint = RpcEndpoint::new(self.rpc.clone(), transport.clone());
        let generation = self.link.attach(transport);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = socket.close(None).await;
                    break;
                }

                Some(text) = outbound.recv() => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        info!("socket closed during send");
                        break;
                    }
                }

                msg = socket.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            endpoint.spawn_receive(Payload::Text(text.as_str().to_owned()));
                        }
                        Some(Ok(Message::Binary(data))) => {
                            endpoint.spawn_receive(Payload::Binary(data.to_vec()));
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("host closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        self.link.detach(generation);
    }
}

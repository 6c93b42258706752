//! castmate-rpc: JSON RPC and state subscriptions for the CastMate bridge
//!
//! This crate provides the envelope codec, the request/response correlator,
//! transport bindings, and the client-side caches (state and widgets) shared
//! by every CastMate bridge flavor.

pub mod endpoint;
pub mod error;
pub mod handler;
pub mod link;
pub mod methods;
pub mod protocol;
pub mod state;
pub mod widget;

pub use endpoint::{ChannelTransport, Payload, RpcEndpoint, Transport, TransportSink};
pub use error::{BridgeError, CallError, TransportError};
pub use handler::{CallFuture, CallPolicy, EnvelopeSink, Handled, RpcHandler, arg};
pub use link::{Link, LinkEvent};
pub use methods::{DASHBOARD_PREFIX, MethodNames, OVERLAY_PREFIX};
pub use protocol::{Envelope, ProtocolError, TOKEN_ALPHABET, TOKEN_LENGTH, generate_token};
pub use state::{StateBridge, StateChange};
pub use widget::{MessageHandle, WidgetRouter};

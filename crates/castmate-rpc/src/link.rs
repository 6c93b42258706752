//! Reconnecting transport slot
//!
//! A [`Link`] is the client side's view of "the current connection". The
//! connector attaches each new transport and detaches it when the socket
//! dies. Every attach bumps a generation counter and publishes
//! [`LinkEvent::Connected`], which subscribers use to rebuild remote state.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::endpoint::Transport;
use crate::error::TransportError;
use crate::handler::EnvelopeSink;
use crate::protocol::Envelope;

/// Capacity of the link event channel
pub const LINK_EVENT_CAPACITY: usize = 16;

/// Connection lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A new transport is live
    Connected { generation: u64 },
    /// The transport of this generation went away
    Disconnected { generation: u64 },
}

#[derive(Default)]
struct LinkState {
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
}

/// Swappable transport slot shared by everything that sends on the client
#[derive(Clone)]
pub struct Link {
    state: Arc<Mutex<LinkState>>,
    events: broadcast::Sender<LinkEvent>,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    /// Create a link with no transport attached
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(LINK_EVENT_CAPACITY);
        Self {
            state: Arc::default(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install `transport` as the live connection and return its generation
    pub fn attach(&self, transport: Arc<dyn Transport>) -> u64 {
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.transport = Some(transport);
            state.generation
        };
        info!(generation, "link connected");
        let _ = self.events.send(LinkEvent::Connected { generation });
        generation
    }

    /// Clear the transport of `generation`
    ///
    /// A stale generation is ignored so a slow teardown cannot detach the
    /// connection that replaced it.
    pub fn detach(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation || state.transport.is_none() {
                debug!(generation, "stale detach ignored");
                return;
            }
            state.transport = None;
        }
        info!(generation, "link disconnected");
        let _ = self.events.send(LinkEvent::Disconnected { generation });
    }

    /// Generation of the most recently attached transport
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Whether a transport is currently attached
    pub fn is_connected(&self) -> bool {
        self.lock().transport.is_some()
    }

    /// Receive future link events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

impl EnvelopeSink for Link {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.send_tracked(envelope).map(|_| ())
    }

    fn send_tracked(&self, envelope: &Envelope) -> Result<Option<u64>, TransportError> {
        let (transport, generation) = {
            let state = self.lock();
            (state.transport.clone(), state.generation)
        };
        match transport {
            Some(transport) => transport
                .send_text(envelope.encode())
                .map(|()| Some(generation)),
            None => Err(TransportError::NotConnected),
        }
    }
}

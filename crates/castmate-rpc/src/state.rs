//! Reference-counted remote state subscriptions
//!
//! Widgets acquire a `(namespace, key)` state to start receiving pushes and
//! free it when done. Only the first acquire and the last free reach the
//! remote side. The remote forgets every subscription when the connection
//! drops, so each new connection replays the live acquisitions once.
//!
//! Every subscription remembers the connection generation its acquire went
//! out on. A connection only replays entries stamped with an older
//! generation, and a reply to an acquire from a superseded generation is
//! ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::error::TransportError;
use crate::handler::{CallFuture, EnvelopeSink, RpcHandler, arg};
use crate::link::{Link, LinkEvent};
use crate::methods::MethodNames;
use crate::protocol::Envelope;

/// Capacity of the state change channel
pub const STATE_CHANGE_CAPACITY: usize = 256;

/// A cached state value changed
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub namespace: String,
    pub key: String,
    /// `None` once the state is released
    pub value: Option<Value>,
}

#[derive(Debug)]
struct Subscription {
    ref_count: usize,
    epoch: u64,
}

#[derive(Default)]
struct StateTable {
    values: HashMap<String, HashMap<String, Value>>,
    subscriptions: HashMap<(String, String), Subscription>,
    generation: u64,
}

/// Records the connection generation a request was written to
struct Tracked<'a> {
    sink: &'a dyn EnvelopeSink,
    generation: Mutex<Option<u64>>,
}

impl<'a> Tracked<'a> {
    fn new(sink: &'a dyn EnvelopeSink) -> Self {
        Self {
            sink,
            generation: Mutex::new(None),
        }
    }

    fn generation(&self) -> Option<u64> {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EnvelopeSink for Tracked<'_> {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let generation = self.sink.send_tracked(envelope)?;
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner) = generation;
        Ok(())
    }
}

#[derive(Clone)]
struct Shared {
    table: Arc<Mutex<StateTable>>,
    changes: broadcast::Sender<StateChange>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StateTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, namespace: &str, key: &str, value: Option<Value>) {
        let _ = self.changes.send(StateChange {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
        });
    }

    fn apply_update(&self, namespace: &str, key: &str, value: Value) {
        self.lock()
            .values
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        self.notify(namespace, key, Some(value));
    }

    fn apply_acquired(&self, namespace: &str, key: &str, epoch: u64, value: Value) {
        {
            let mut table = self.lock();
            let current = table
                .subscriptions
                .get(&(namespace.to_string(), key.to_string()))
                .map(|sub| sub.epoch);
            if current != Some(epoch) {
                debug!(namespace, key, epoch, "stale acquire reply ignored");
                return;
            }
            table
                .values
                .entry(namespace.to_string())
                .or_default()
                .insert(key.to_string(), value.clone());
        }
        self.notify(namespace, key, Some(value));
    }
}

/// Client-side cache of remote state values
#[derive(Clone)]
pub struct StateBridge {
    rpc: RpcHandler,
    sink: Arc<dyn EnvelopeSink>,
    methods: MethodNames,
    shared: Shared,
}

impl StateBridge {
    /// Create a bridge and register its state push handler on `rpc`
    ///
    /// # Errors
    ///
    /// Fails if the push method is already registered on `rpc`.
    pub fn new(
        rpc: RpcHandler,
        sink: Arc<dyn EnvelopeSink>,
        methods: MethodNames,
    ) -> Result<Self, BridgeError> {
        let (changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        let shared = Shared {
            table: Arc::default(),
            changes,
        };

        let push = shared.clone();
        rpc.handle(methods.state_update.clone(), move |args| {
            let push = push.clone();
            async move {
                let namespace: String = arg(&args, 0)?;
                let key: String = arg(&args, 1)?;
                let value = args.get(2).cloned().unwrap_or(Value::Null);
                push.apply_update(&namespace, &key, value);
                Ok(Value::Null)
            }
        })?;

        Ok(Self {
            rpc,
            sink,
            methods,
            shared,
        })
    }

    /// Start or join a subscription and return the cached value
    ///
    /// The first acquire of a key issues the remote acquire on a background
    /// task and returns `None`. Later acquires only bump the count.
    /// Must be called from within a tokio runtime.
    pub fn acquire_state(&self, namespace: &str, key: &str) -> Option<Value> {
        let (pending, epoch) = {
            let mut table = self.shared.lock();
            let id = (namespace.to_string(), key.to_string());
            if let Some(sub) = table.subscriptions.get_mut(&id) {
                sub.ref_count += 1;
                return table.values.get(namespace).and_then(|v| v.get(key)).cloned();
            }

            // Sent under the table lock so a concurrent replay sees the stamp
            let (pending, sent_on) = self.send_acquire(namespace, key);
            let epoch = sent_on.unwrap_or(table.generation);
            table.subscriptions.insert(id, Subscription { ref_count: 1, epoch });
            table.values.entry(namespace.to_string()).or_default();
            (pending, epoch)
        };

        debug!(namespace, key, epoch, "new state acquisition");
        self.await_acquire(namespace.to_string(), key.to_string(), epoch, pending);
        None
    }

    /// Drop one reference to a subscription
    ///
    /// The last reference removes the cached value and tells the remote
    /// side to stop pushing. That call is not awaited.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotAcquired`] if the key holds no subscription.
    pub fn free_state(&self, namespace: &str, key: &str) -> Result<(), BridgeError> {
        {
            let mut table = self.shared.lock();
            let id = (namespace.to_string(), key.to_string());
            let Some(sub) = table.subscriptions.get_mut(&id) else {
                warn!(namespace, key, "tried to release state that was never acquired");
                return Err(BridgeError::NotAcquired {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                });
            };

            sub.ref_count -= 1;
            if sub.ref_count > 0 {
                return Ok(());
            }

            table.subscriptions.remove(&id);
            if let Some(bucket) = table.values.get_mut(namespace) {
                bucket.remove(key);
            }
        }

        debug!(namespace, key, "state released");
        drop(self.rpc.call(
            &self.methods.free_state,
            self.sink.as_ref(),
            vec![json!(namespace), json!(key)],
        ));
        self.shared.notify(namespace, key, None);
        Ok(())
    }

    /// Cached value of a state, if one has arrived
    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.shared
            .lock()
            .values
            .get(namespace)
            .and_then(|bucket| bucket.get(key))
            .cloned()
    }

    /// Current reference count of a subscription (0 if absent)
    pub fn ref_count(&self, namespace: &str, key: &str) -> usize {
        self.shared
            .lock()
            .subscriptions
            .get(&(namespace.to_string(), key.to_string()))
            .map_or(0, |sub| sub.ref_count)
    }

    /// Receive every future value change
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.shared.changes.subscribe()
    }

    /// Replay live acquisitions for the connection of `generation`
    ///
    /// Only entries whose acquire went out on an older connection are
    /// re-issued; returns how many were. A generation at or below the last
    /// one replayed is a duplicate event and does nothing.
    pub fn on_connected(&self, generation: u64) -> usize {
        let replayed: Vec<(String, String, u64, CallFuture)> = {
            let mut table = self.shared.lock();
            if generation <= table.generation {
                debug!(generation, "duplicate connected event ignored");
                return 0;
            }
            table.generation = generation;

            let stale: Vec<(String, String)> = table
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.ref_count > 0 && sub.epoch < generation)
                .map(|(id, _)| id.clone())
                .collect();

            let mut replayed = Vec::with_capacity(stale.len());
            for id in stale {
                let (pending, sent_on) = self.send_acquire(&id.0, &id.1);
                let epoch = sent_on.unwrap_or(generation);
                if let Some(sub) = table.subscriptions.get_mut(&id) {
                    sub.epoch = epoch;
                }
                replayed.push((id.0, id.1, epoch, pending));
            }
            replayed
        };

        let count = replayed.len();
        debug!(generation, count, "replaying state acquisitions");
        for (namespace, key, epoch, pending) in replayed {
            self.await_acquire(namespace, key, epoch, pending);
        }
        count
    }

    /// Replay acquisitions whenever `link` connects
    pub fn follow(&self, link: &Link) -> JoinHandle<()> {
        let bridge = self.clone();
        let link = link.clone();
        let mut events = link.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::Connected { generation }) => {
                        bridge.on_connected(generation);
                    }
                    Ok(LinkEvent::Disconnected { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("state bridge lagged {} link events", n);
                        if link.is_connected() {
                            bridge.on_connected(link.generation());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Send an acquire and report which connection carried it
    fn send_acquire(&self, namespace: &str, key: &str) -> (CallFuture, Option<u64>) {
        let tracked = Tracked::new(self.sink.as_ref());
        let pending = self.rpc.call(
            &self.methods.acquire_state,
            &tracked,
            vec![json!(namespace), json!(key)],
        );
        (pending, tracked.generation())
    }

    fn await_acquire(&self, namespace: String, key: String, epoch: u64, pending: CallFuture) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            match pending.await {
                Ok(value) => shared.apply_acquired(&namespace, &key, epoch, value),
                Err(e) => debug!(%namespace, %key, "acquire did not complete: {}", e),
            }
        });
    }
}

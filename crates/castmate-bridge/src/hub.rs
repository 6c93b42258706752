//! Host-side bookkeeping for overlay connections
//!
//! Every socket is a connection of exactly one overlay. A connection may
//! acquire host states; each acquisition runs a push task that forwards
//! value changes as `stateUpdate` calls until the state is freed or the
//! socket goes away. Inbound requests carry the connection id as their
//! first argument.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use castmate_rpc::{
    BridgeError, CallPolicy, MethodNames, RpcEndpoint, RpcHandler, Transport, arg,
};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::HostState;

/// Identifies one open socket
pub type ConnectionId = u64;

type HostWidgetFuture = BoxFuture<'static, anyhow::Result<Value>>;

type HostWidgetFn = Arc<dyn Fn(String, String, Vec<Value>) -> HostWidgetFuture + Send + Sync>;

struct Connection {
    overlay: String,
    endpoint: RpcEndpoint,
    updaters: HashMap<(String, String), JoinHandle<()>>,
}

#[derive(Default)]
struct HubTable {
    connections: HashMap<ConnectionId, Connection>,
    overlays: HashMap<String, Vec<ConnectionId>>,
    configs: HashMap<String, Value>,
    widget_rpcs: HashMap<String, HostWidgetFn>,
}

/// Owns every overlay connection of the host
#[derive(Clone)]
pub struct HostHub {
    rpc: RpcHandler,
    state: HostState,
    methods: MethodNames,
    table: Arc<Mutex<HubTable>>,
    next_id: Arc<AtomicU64>,
}

/// Send a call whose outcome only matters for the log
fn notify(endpoint: &RpcEndpoint, name: &str, args: Vec<Value>) {
    let pending = endpoint.call(name, args);
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = pending.await {
            debug!(method = %name, "push not delivered: {}", e);
        }
    });
}

impl HostHub {
    /// Create a hub serving `state` and register its inbound methods
    pub fn new(
        state: HostState,
        methods: MethodNames,
        policy: CallPolicy,
    ) -> Result<Self, BridgeError> {
        let hub = Self {
            rpc: RpcHandler::with_policy(policy),
            state,
            methods,
            table: Arc::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        };

        let this = hub.clone();
        hub.rpc
            .handle(hub.methods.acquire_state.clone(), move |args| {
                let hub = this.clone();
                async move {
                    let conn: ConnectionId = arg(&args, 0)?;
                    let namespace: String = arg(&args, 1)?;
                    let key: String = arg(&args, 2)?;
                    hub.acquire_state(conn, &namespace, &key)
                }
            })?;

        let this = hub.clone();
        hub.rpc
            .handle(hub.methods.free_state.clone(), move |args| {
                let hub = this.clone();
                async move {
                    let conn: ConnectionId = arg(&args, 0)?;
                    let namespace: String = arg(&args, 1)?;
                    let key: String = arg(&args, 2)?;
                    hub.free_state(conn, &namespace, &key);
                    Ok(Value::Null)
                }
            })?;

        let this = hub.clone();
        hub.rpc
            .handle(hub.methods.widget_rpc.clone(), move |args| {
                let hub = this.clone();
                async move {
                    let conn: ConnectionId = arg(&args, 0)?;
                    let rpc_id: String = arg(&args, 1)?;
                    let from: String = arg(&args, 2)?;
                    let rest = args.into_iter().skip(3).collect();
                    hub.handle_widget_request(conn, &rpc_id, from, rest).await
                }
            })?;

        Ok(hub)
    }

    fn lock(&self) -> MutexGuard<'_, HubTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> &HostState {
        &self.state
    }

    /// Register a new socket of `overlay` and return its endpoint
    ///
    /// The socket is sent the overlay's current config right away.
    pub fn connect(
        &self,
        overlay: &str,
        transport: Arc<dyn Transport>,
    ) -> (ConnectionId, RpcEndpoint) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = RpcEndpoint::new(self.rpc.clone(), transport).with_pre_args(vec![json!(id)]);

        let config = {
            let mut table = self.lock();
            table.connections.insert(
                id,
                Connection {
                    overlay: overlay.to_string(),
                    endpoint: endpoint.clone(),
                    updaters: HashMap::new(),
                },
            );
            table.overlays.entry(overlay.to_string()).or_default().push(id);
            table.configs.get(overlay).cloned().unwrap_or(Value::Null)
        };

        info!(overlay = %overlay, conn = id, "overlay connected");
        notify(&endpoint, &self.methods.set_config, vec![config]);
        (id, endpoint)
    }

    /// Forget a socket and stop all of its push tasks
    pub fn disconnect(&self, id: ConnectionId) {
        let mut table = self.lock();
        let Some(conn) = table.connections.remove(&id) else {
            return;
        };
        for (_, task) in conn.updaters {
            task.abort();
        }
        if let Some(sockets) = table.overlays.get_mut(&conn.overlay) {
            sockets.retain(|s| *s != id);
            if sockets.is_empty() {
                table.overlays.remove(&conn.overlay);
            }
        }
        info!(overlay = %conn.overlay, conn = id, "overlay disconnected");
    }

    /// Start pushing `(namespace, key)` to a connection
    ///
    /// Returns the current value. Acquiring twice on one connection keeps
    /// the existing push task.
    pub fn acquire_state(
        &self,
        id: ConnectionId,
        namespace: &str,
        key: &str,
    ) -> anyhow::Result<Value> {
        let mut table = self.lock();
        let Some(conn) = table.connections.get_mut(&id) else {
            return Err(anyhow!("unknown connection {}", id));
        };

        let mut rx = self.state.watch(namespace, key);
        let current = rx.borrow_and_update().clone();

        let slot = (namespace.to_string(), key.to_string());
        if conn.updaters.contains_key(&slot) {
            return Ok(current);
        }

        let endpoint = conn.endpoint.clone();
        let method = self.methods.state_update.clone();
        let (ns, k) = slot.clone();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let value = rx.borrow_and_update().clone();
                notify(&endpoint, &method, vec![json!(ns), json!(k), value]);
            }
        });
        conn.updaters.insert(slot, task);
        debug!(conn = id, namespace, key, "state acquired");
        Ok(current)
    }

    /// Stop pushing `(namespace, key)` to a connection
    pub fn free_state(&self, id: ConnectionId, namespace: &str, key: &str) {
        let mut table = self.lock();
        let task = table
            .connections
            .get_mut(&id)
            .and_then(|conn| conn.updaters.remove(&(namespace.to_string(), key.to_string())));
        if let Some(task) = task {
            task.abort();
            debug!(conn = id, namespace, key, "state freed");
        }
    }

    /// Replace an overlay's config and push it to every open socket
    pub fn set_overlay_config(&self, overlay: &str, config: Value) {
        let endpoints = {
            let mut table = self.lock();
            table.configs.insert(overlay.to_string(), config.clone());
            Self::endpoints_of(&table, overlay)
        };
        for endpoint in &endpoints {
            notify(endpoint, &self.methods.set_config, vec![config.clone()]);
        }
    }

    fn endpoints_of(table: &HubTable, overlay: &str) -> Vec<RpcEndpoint> {
        table
            .overlays
            .get(overlay)
            .into_iter()
            .flatten()
            .filter_map(|id| table.connections.get(id))
            .map(|conn| conn.endpoint.clone())
            .collect()
    }

    /// Call a widget RPC on every socket of `overlay`
    ///
    /// Returns the results of the sockets that answered successfully.
    pub async fn call_widget(
        &self,
        overlay: &str,
        widget_id: &str,
        rpc_id: &str,
        args: Vec<Value>,
    ) -> Vec<Value> {
        let endpoints = Self::endpoints_of(&self.lock(), overlay);
        let mut call_args = vec![json!(widget_id), json!(rpc_id)];
        call_args.extend(args);

        let calls = endpoints
            .iter()
            .map(|endpoint| endpoint.call(&self.methods.widget_rpc, call_args.clone()));
        join_all(calls)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Send a broadcast to every connected socket; failures are ignored
    pub async fn broadcast(&self, message_id: &str, args: Vec<Value>) {
        let endpoints: Vec<RpcEndpoint> = self
            .lock()
            .connections
            .values()
            .map(|conn| conn.endpoint.clone())
            .collect();
        let mut call_args = vec![json!(message_id)];
        call_args.extend(args);

        let calls = endpoints
            .iter()
            .map(|endpoint| endpoint.call(&self.methods.broadcast, call_args.clone()));
        for result in join_all(calls).await {
            if let Err(e) = result {
                debug!(message = %message_id, "broadcast not delivered: {}", e);
            }
        }
    }

    /// Serve widget RPC `id` for calls coming from overlays
    ///
    /// `func` receives the calling overlay id, the calling widget id and the
    /// remaining arguments.
    pub fn handle_widget_rpc<F, Fut>(&self, id: &str, func: F) -> Result<(), BridgeError>
    where
        F: Fn(String, String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let mut table = self.lock();
        if table.widget_rpcs.contains_key(id) {
            return Err(BridgeError::DuplicateHandler(id.to_string()));
        }
        let func: HostWidgetFn =
            Arc::new(move |overlay, from, args| func(overlay, from, args).boxed());
        table.widget_rpcs.insert(id.to_string(), func);
        Ok(())
    }

    #[cfg(test)]
    pub fn unhandle_widget_rpc(&self, id: &str) {
        self.lock().widget_rpcs.remove(id);
    }

    async fn handle_widget_request(
        &self,
        conn: ConnectionId,
        id: &str,
        from: String,
        args: Vec<Value>,
    ) -> anyhow::Result<Value> {
        let (overlay, func) = {
            let table = self.lock();
            let overlay = table
                .connections
                .get(&conn)
                .map(|c| c.overlay.clone())
                .ok_or_else(|| anyhow!("unknown overlay"))?;
            let func = table.widget_rpcs.get(id).cloned();
            (overlay, func)
        };
        let Some(func) = func else {
            warn!(rpc = %id, "unbound widget RPC");
            return Err(anyhow!("unbound RPC {}", id));
        };
        func(overlay, from, args).await
    }

    /// Number of open sockets
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Number of open sockets of `overlay`
    #[cfg(test)]
    pub fn overlay_sockets(&self, overlay: &str) -> usize {
        self.lock().overlays.get(overlay).map_or(0, Vec::len)
    }

    /// Number of states being pushed to a connection
    #[cfg(test)]
    pub fn acquired_count(&self, id: ConnectionId) -> usize {
        self.lock()
            .connections
            .get(&id)
            .map_or(0, |conn| conn.updaters.len())
    }
}

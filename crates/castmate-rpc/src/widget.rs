//! Client-side widget surface: per-widget RPCs, broadcasts, and config
//!
//! Widget RPCs are keyed `"<widget>.<rpc>"`. Broadcast handlers are plain
//! callbacks grouped by message id; one failing handler does not stop the
//! others.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::handler::{CallFuture, EnvelopeSink, HandlerFuture, RpcHandler, arg};
use crate::methods::MethodNames;

type WidgetFn = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;
type MessageFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<()> + Send + Sync>;

/// Identifies one registered broadcast handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    id: String,
    seq: u64,
}

#[derive(Default)]
struct WidgetTable {
    rpcs: HashMap<String, WidgetFn>,
    messages: HashMap<String, Vec<(u64, MessageFn)>>,
    next_seq: u64,
}

fn slug(widget_id: &str, rpc_id: &str) -> String {
    format!("{widget_id}.{rpc_id}")
}

/// Routes widget traffic arriving over the bridge
#[derive(Clone)]
pub struct WidgetRouter {
    rpc: RpcHandler,
    sink: Arc<dyn EnvelopeSink>,
    methods: MethodNames,
    table: Arc<Mutex<WidgetTable>>,
    config: Arc<watch::Sender<Value>>,
}

impl WidgetRouter {
    /// Create a router and register its inbound methods on `rpc`
    pub fn new(
        rpc: RpcHandler,
        sink: Arc<dyn EnvelopeSink>,
        methods: MethodNames,
    ) -> Result<Self, BridgeError> {
        let router = Self {
            rpc,
            sink,
            methods,
            table: Arc::default(),
            config: Arc::new(watch::channel(Value::Null).0),
        };

        let config = Arc::clone(&router.config);
        router
            .rpc
            .handle(router.methods.set_config.clone(), move |args| {
                let config = Arc::clone(&config);
                async move {
                    let value = args.into_iter().next().unwrap_or(Value::Null);
                    info!("config set");
                    config.send_replace(value);
                    Ok(Value::Null)
                }
            })?;

        let table = Arc::clone(&router.table);
        router
            .rpc
            .handle(router.methods.widget_rpc.clone(), move |args| {
                let table = Arc::clone(&table);
                async move {
                    let widget_id: String = arg(&args, 0)?;
                    let rpc_id: String = arg(&args, 1)?;
                    let func = lock(&table).rpcs.get(&slug(&widget_id, &rpc_id)).cloned();
                    match func {
                        Some(func) => func(args.into_iter().skip(2).collect()).await,
                        None => {
                            debug!(widget = %widget_id, rpc = %rpc_id, "no widget RPC bound");
                            Ok(Value::Null)
                        }
                    }
                }
            })?;

        let table = Arc::clone(&router.table);
        router
            .rpc
            .handle(router.methods.broadcast.clone(), move |args| {
                let table = Arc::clone(&table);
                async move {
                    let message_id: String = arg(&args, 0)?;
                    let handlers: Vec<MessageFn> = lock(&table)
                        .messages
                        .get(&message_id)
                        .map(|list| list.iter().map(|(_, f)| Arc::clone(f)).collect())
                        .unwrap_or_default();
                    for handler in handlers {
                        if let Err(e) = handler(&args[1..]) {
                            warn!(message = %message_id, "broadcast handler failed: {}", e);
                        }
                    }
                    Ok(Value::Null)
                }
            })?;

        Ok(router)
    }

    /// Bind `func` as RPC `rpc_id` of widget `widget_id`
    ///
    /// # Errors
    ///
    /// [`BridgeError::DuplicateHandler`] if the pair is already bound.
    pub fn register_rpc<F, Fut>(
        &self,
        widget_id: &str,
        rpc_id: &str,
        func: F,
    ) -> Result<(), BridgeError>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let key = slug(widget_id, rpc_id);
        let mut table = lock(&self.table);
        if table.rpcs.contains_key(&key) {
            return Err(BridgeError::DuplicateHandler(key));
        }
        let func: WidgetFn = Arc::new(move |args| func(args).boxed());
        table.rpcs.insert(key, func);
        Ok(())
    }

    /// Unbind a widget RPC
    pub fn unregister_rpc(&self, widget_id: &str, rpc_id: &str) {
        lock(&self.table).rpcs.remove(&slug(widget_id, rpc_id));
    }

    /// Add a handler for broadcast `id`
    pub fn register_message<F>(&self, id: &str, func: F) -> MessageHandle
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let func: MessageFn = Arc::new(func);
        let mut table = lock(&self.table);
        table.next_seq += 1;
        let seq = table.next_seq;
        table
            .messages
            .entry(id.to_string())
            .or_default()
            .push((seq, func));
        MessageHandle {
            id: id.to_string(),
            seq,
        }
    }

    /// Remove a broadcast handler; no-op if already removed
    pub fn unregister_message(&self, handle: &MessageHandle) {
        let mut table = lock(&self.table);
        if let Some(list) = table.messages.get_mut(&handle.id) {
            list.retain(|(seq, _)| *seq != handle.seq);
            if list.is_empty() {
                table.messages.remove(&handle.id);
            }
        }
    }

    /// Watch the config most recently pushed by the host
    pub fn config(&self) -> watch::Receiver<Value> {
        self.config.subscribe()
    }

    /// Call host-side RPC `rpc_id` on behalf of widget `widget_id`
    pub fn call_rpc(&self, widget_id: &str, rpc_id: &str, args: Vec<Value>) -> CallFuture {
        let mut call_args = vec![json!(rpc_id), json!(widget_id)];
        call_args.extend(args);
        self.rpc
            .call(&self.methods.widget_rpc, self.sink.as_ref(), call_args)
    }
}

fn lock(table: &Mutex<WidgetTable>) -> MutexGuard<'_, WidgetTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

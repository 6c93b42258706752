//! Host-side state values
//!
//! Each `(namespace, key)` is a watch channel. Readers that subscribe before
//! a value is ever set see `null` until it is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::watch;

type Channels = HashMap<(String, String), watch::Sender<Value>>;

/// Shared table of live state values
#[derive(Clone, Default)]
pub struct HostState {
    channels: Arc<Mutex<Channels>>,
}

impl HostState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(channels: &mut Channels, namespace: &str, key: &str) -> watch::Sender<Value> {
        channels
            .entry((namespace.to_string(), key.to_string()))
            .or_insert_with(|| watch::channel(Value::Null).0)
            .clone()
    }

    /// Replace a value and wake its watchers
    pub fn set(&self, namespace: &str, key: &str, value: Value) {
        let sender = Self::sender(&mut self.lock(), namespace, key);
        sender.send_replace(value);
    }

    /// Current value, `null` if never set
    pub fn get(&self, namespace: &str, key: &str) -> Value {
        self.lock()
            .get(&(namespace.to_string(), key.to_string()))
            .map(|sender| sender.borrow().clone())
            .unwrap_or(Value::Null)
    }

    /// Follow a value, creating it as `null` if needed
    pub fn watch(&self, namespace: &str, key: &str) -> watch::Receiver<Value> {
        Self::sender(&mut self.lock(), namespace, key).subscribe()
    }
}

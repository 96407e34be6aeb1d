//! Listener registry shared by every client implementation.

use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// New block observed by a client. Payload is the block number.
pub const BLOCK_EVENT: &str = "block";
/// Network-wide new highest block. Emitted by endpoints, never by clients.
pub const LATEST_BLOCK_EVENT: &str = "latest-block";
/// Transport closed. Payload is an object with the endpoint `url`.
pub const CLOSE_EVENT: &str = "close";
/// Transport error. Payload is the error message.
pub const ERROR_EVENT: &str = "error";

/// Callback registered for an event.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

struct Registration {
    listener: Listener,
    once: bool,
}

/// Named-event listener registry.
///
/// Listeners run on the emitting task after the registry lock is released, so a listener
/// may register or remove listeners itself.
#[derive(Default)]
pub struct EventEmitter {
    listeners: RwLock<HashMap<String, Vec<Registration>>>,
}

impl EventEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, listener: Listener) {
        self.register(event, listener, false);
    }

    /// Registers a listener that is removed after its first invocation.
    pub fn once(&self, event: &str, listener: Listener) {
        self.register(event, listener, true);
    }

    fn register(&self, event: &str, listener: Listener, once: bool) {
        self.listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Registration { listener, once });
    }

    /// Removes `listener` from `event`, or every listener of `event` when `None`.
    /// Returns the number of listeners removed.
    pub fn off(&self, event: &str, listener: Option<&Listener>) -> usize {
        let mut listeners = self.listeners.write();
        let Some(registered) = listeners.get_mut(event) else {
            return 0;
        };

        let before = registered.len();
        match listener {
            Some(target) => registered.retain(|r| !Arc::ptr_eq(&r.listener, target)),
            None => registered.clear(),
        }
        let removed = before - registered.len();

        if registered.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Invokes every listener of `event`. Returns `true` if there was at least one.
    pub fn emit(&self, event: &str, payload: &Value) -> bool {
        let to_call: Vec<Listener> = {
            let mut listeners = self.listeners.write();
            let Some(registered) = listeners.get_mut(event) else {
                return false;
            };
            let to_call = registered.iter().map(|r| r.listener.clone()).collect();
            registered.retain(|r| !r.once);
            if registered.is_empty() {
                listeners.remove(event);
            }
            to_call
        };

        for listener in &to_call {
            listener(payload);
        }
        !to_call.is_empty()
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

//! The watch gate: one on/off switch for forwarding resource-change events.
//!
//! ```text
//!  event source ──on_add/on_update/on_delete──▶ EventHandlers ──(gate open?)──▶ Outbound
//!                                                    │ closed
//!                                                    ▼
//!                                                 dropped
//! ```
//!
//! Events that arrive while the gate is closed are discarded, not buffered;
//! reopening the gate does not replay them.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::protocol::{Code, Envelope, EventKind, Response, WatchEvent};
use crate::tunnel::Outbound;

/// Callback invoked by an event source with the changed object.
pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// The three callbacks an event source invokes for one resource kind.
#[derive(Clone)]
pub struct EventHandlers {
    pub on_add: EventCallback,
    pub on_update: EventCallback,
    pub on_delete: EventCallback,
}

impl EventHandlers {
    pub fn call(&self, event: EventKind, object: Value) {
        match event {
            EventKind::Add => (self.on_add)(object),
            EventKind::Update => (self.on_update)(object),
            EventKind::Delete => (self.on_delete)(object),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SetWatchParams {
    action: String,
}

/// Shared gate state plus the queue events are forwarded to.
///
/// Clones share the same flag, so every registered callback sees a toggle
/// made through any handle.
#[derive(Clone)]
pub struct WatchGate {
    enabled: Arc<Mutex<bool>>,
    outbound: Outbound,
}

impl WatchGate {
    /// A closed gate forwarding to `outbound`.
    pub fn new(outbound: Outbound) -> Self {
        Self {
            enabled: Arc::new(Mutex::new(false)),
            outbound,
        }
    }

    pub fn is_open(&self) -> bool {
        *self.enabled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `watch/get` handler: `{"action": "open" | "close"}`.
    pub fn set_watch(&self, params: &Value) -> Response {
        let params: SetWatchParams = crate::protocol::decode_params(params);
        let open = match params.action.as_str() {
            "" => return Response::error(Code::ParamsError, "Action param is blank"),
            "open" => true,
            "close" => false,
            _ => return Response::error(Code::ParamsError, "Action param is not valid"),
        };
        *self.enabled.lock().unwrap_or_else(PoisonError::into_inner) = open;
        info!(open, "Watch: gate toggled");
        Response::ok_with_message("Action watch resource success")
    }

    /// Callbacks for one resource kind, each tagged with `label`.
    pub fn handlers(&self, label: &str) -> EventHandlers {
        EventHandlers {
            on_add: self.callback(label, EventKind::Add),
            on_update: self.callback(label, EventKind::Update),
            on_delete: self.callback(label, EventKind::Delete),
        }
    }

    fn callback(&self, label: &str, event: EventKind) -> EventCallback {
        let gate = self.clone();
        let label = label.to_string();
        Arc::new(move |object: Value| gate.forward(&label, event, object))
    }

    fn forward(&self, label: &str, event: EventKind, object: Value) {
        // Hold the lock across the enqueue so a close that returns has
        // already stopped all later forwards.
        let enabled = self.enabled.lock().unwrap_or_else(PoisonError::into_inner);
        if !*enabled {
            return;
        }
        debug!(obj = label, ?event, "Watch: forwarding event");
        self.outbound.send(Envelope::watch(&WatchEvent {
            event,
            obj: label.to_string(),
            resource: object,
        }));
    }
}

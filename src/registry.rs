//! Command registry: resource kind → action name → handler.
//!
//! Built once at startup, then shared read-only behind an `Arc`. Looking up a
//! pair that was never registered is not an error here; the dispatcher turns
//! it into an `ActionError` result.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::protocol::Response;

/// Action names shared by the resource adapters.
pub mod actions {
    pub const LIST: &str = "list";
    pub const GET: &str = "get";
    pub const DELETE: &str = "delete";
    pub const UPDATE_YAML: &str = "update_yaml";
    pub const UPDATE_OBJ: &str = "update_obj";
    pub const EXEC: &str = "exec";
    pub const STDIN: &str = "stdin";
    pub const OPEN_LOG: &str = "openLog";
    pub const CLOSE_LOG: &str = "closeLog";
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A registered handler: opaque params in, one [`Response`] out. Handlers may
/// block on I/O and must not assume any particular calling task.
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, HashMap<String, Handler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `(resource, action)`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, resource: &str, action: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params: Value| -> HandlerFuture { Box::pin(handler(params)) });
        self.handlers
            .entry(resource.to_string())
            .or_default()
            .insert(action.to_string(), handler);
    }

    pub fn lookup(&self, resource: &str, action: &str) -> Option<Handler> {
        self.handlers.get(resource)?.get(action).cloned()
    }

    /// Registered resource kinds, sorted.
    pub fn resources(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Registered actions for `resource`, sorted. Empty if unknown.
    pub fn actions(&self, resource: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .handlers
            .get(resource)
            .map(|a| a.keys().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}

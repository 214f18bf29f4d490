//! Request dispatch with per-request fault isolation.
//!
//! Every decoded [`Request`] runs on its own task so a slow handler never
//! stalls the others; responses can therefore leave in a different order than
//! requests arrived. Whatever the handler does, exactly one `request` envelope
//! carrying the same `request_id` is queued:
//!
//! | outcome                         | `code`          |
//! |---------------------------------|-----------------|
//! | handler returned                | handler's code  |
//! | no handler for resource/action  | `ActionError`   |
//! | handler panicked                | `UnknownError`  |

use std::any::Any;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::protocol::{Code, Envelope, Request, Response};
use crate::registry::CommandRegistry;
use crate::tunnel::Outbound;

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    outbound: Outbound,
}

impl Dispatcher {
    pub fn new(registry: Arc<CommandRegistry>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }

    /// Route one request and produce its response. Never panics.
    pub async fn dispatch(&self, request: Request) -> Response {
        let Some(handler) = self.registry.lookup(&request.resource, &request.action) else {
            let msg = format!(
                "resource {} action {} not found",
                request.resource, request.action
            );
            error!(request_id = %request.request_id, "{msg}");
            return Response::error(Code::ActionError, msg);
        };

        // The handler runs as its own task so a panic unwinds into the
        // JoinError instead of this task.
        let params = request.params;
        match tokio::spawn(async move { handler(params).await }).await {
            Ok(response) => response,
            Err(e) if e.is_panic() => {
                let msg = panic_message(e.into_panic().as_ref());
                error!(
                    resource = %request.resource,
                    action = %request.action,
                    request_id = %request.request_id,
                    "Handler panicked: {msg}"
                );
                Response::error(Code::UnknownError, msg)
            }
            Err(e) => {
                error!(request_id = %request.request_id, "Handler task cancelled: {e}");
                Response::error(Code::UnknownError, e.to_string())
            }
        }
    }

    /// Dispatch on a new task and queue the correlated response.
    pub fn spawn(&self, request: Request) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            debug!(
                resource = %request.resource,
                action = %request.action,
                %request_id,
                "Dispatching request"
            );
            let response = this.dispatch(request).await;
            this.outbound.send(Envelope::response(request_id, &response));
        })
    }

    /// Consume decoded requests until the channel closes or `shutdown` fires.
    pub async fn run(self, mut requests: mpsc::Receiver<Request>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => {
                        self.spawn(request);
                    }
                    None => break,
                },
            }
        }
        info!("Dispatcher: stopped");
    }
}

/// Human-readable text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

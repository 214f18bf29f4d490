#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! kubetether library: the building blocks of the cluster agent.
//!
//! - `tunnel`: the single outbound WebSocket and the outbound queue
//! - `dispatch`: per-request tasks with panic isolation
//! - `registry`: (resource, action) handler table
//! - `resources`: list/get/delete/update adapters for every kind, pod sessions
//! - `sessions`: exec and log session registries
//! - `watch`: the gate that forwards cluster change events
//! - `cluster`: the cluster collaborator trait and its kubectl implementation
//! - `pty`: pseudo-terminal allocation for exec sessions
//! - `config`: configuration loading

pub mod agent;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod resources;
pub mod sessions;
pub mod tunnel;
pub mod watch;

pub use agent::Agent;
pub use config::Config;
pub use error::{Error, Result};

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # kubetether
//!
//! Cluster-side agent. It dials a control server over one WebSocket, answers
//! resource commands against the Kubernetes API, streams pod shells and logs,
//! and forwards change events while the server has watching enabled.
//!
//! ## Subcommands
//!
//! - `kubetether run` (default): connect and serve until SIGINT/SIGTERM
//! - `kubetether check-config`: load and print the effective configuration
//!
//! ## Architecture
//!
//! ```text
//! main.rs         : entry point, clap subcommands, logging, graceful shutdown
//! agent.rs        : wiring of the components below
//! config.rs       : TOML + env-var configuration
//! protocol.rs     : request/response/envelope wire types
//! tunnel/
//!   client.rs     : outbound WS, fixed-interval reconnect, reader and writer
//!   outbound.rs   : bounded drop-oldest queue feeding the writer
//! dispatch.rs     : one task per request, panic isolation
//! registry.rs     : (resource, action) → handler table
//! watch.rs        : watch gate and event forwarding
//! resources/
//!   mod.rs        : static table of resource kinds
//!   kind.rs       : list/get/delete/update_yaml/update_obj, conflict retry
//!   pod.rs        : exec/stdin/openLog/closeLog
//! sessions/
//!   mod.rs        : keyed session table with self-removing guards
//!   exec.rs       : interactive shell bridge
//!   logs.rs       : log follow bridge
//! cluster/
//!   mod.rs        : ClusterClient / EventSource traits
//!   kubectl.rs    : implementation driving the kubectl binary
//! pty.rs          : PTY allocation, spawn, resize
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kubetether::cluster::kubectl::Kubectl;
use kubetether::cluster::ClusterClient;
use kubetether::config::{Config, Overrides};
use kubetether::Agent;

/// Cluster-side agent for a remote Kubernetes control server.
#[derive(Parser)]
#[command(name = "kubetether", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    opts: ConfigArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the control server and serve requests (default).
    Run(ConfigArgs),
    /// Load the configuration, print it and exit.
    CheckConfig(ConfigArgs),
}

#[derive(Args, Clone, Default)]
struct ConfigArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Control server base URL, e.g. `wss://control.example.com`.
    #[arg(long)]
    server_url: Option<String>,
    /// Token sent in the `token` header of the upgrade request.
    #[arg(long)]
    token: Option<String>,
    /// kubeconfig passed to kubectl.
    #[arg(long)]
    kubeconfig: Option<String>,
}

impl ConfigArgs {
    fn load(self) -> kubetether::Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        config.apply_overrides(Overrides {
            server_url: self.server_url,
            token: self.token,
            kubeconfig: self.kubeconfig,
        });
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::CheckConfig(args)) => check_config(args),
        Some(Commands::Run(args)) => run_agent(args).await,
        None => run_agent(cli.opts).await,
    };

    if let Err(e) = result {
        eprintln!("kubetether: {e}");
        std::process::exit(1);
    }
}

fn check_config(args: ConfigArgs) -> kubetether::Result<()> {
    let mut config = args.load()?;
    if !config.server.token.is_empty() {
        config.server.token = "<redacted>".to_string();
    }
    println!("{config:#?}");
    println!("connect url: {}", config.server.connect_url());
    Ok(())
}

async fn run_agent(args: ConfigArgs) -> kubetether::Result<()> {
    let config = args.load()?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    install_panic_hook();

    info!("kubetether v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Control server: {}", config.server.connect_url());
    if config.server.token.is_empty() {
        warn!("No token configured: set KUBETETHER_TOKEN or update config");
    }

    let shutdown = CancellationToken::new();
    let kubectl = Kubectl::new(&config.kubernetes, shutdown.clone());
    let client: Arc<dyn ClusterClient> = Arc::new(kubectl.clone());
    let agent = Agent::new(&config, client, &kubectl);
    let stats = agent.stats();

    let mut state = agent.state();
    let state_task = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            info!(state = ?current, "Connection state changed");
        }
    });

    let signals = wait_for_signal(shutdown.clone())?;
    agent.run(shutdown).await;

    info!("Shutting down...");
    signals.abort();
    state_task.abort();
    info!(
        reconnects = stats.reconnects.load(Ordering::Relaxed),
        sent = stats.messages_sent.load(Ordering::Relaxed),
        received = stats.messages_received.load(Ordering::Relaxed),
        failed_sends = stats.failed_sends.load(Ordering::Relaxed),
        "Goodbye"
    );
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn wait_for_signal(shutdown: CancellationToken) -> kubetether::Result<tokio::task::JoinHandle<()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
        shutdown.cancel();
    }))
}

/// Handler panics are caught by the dispatcher; this records where they came
/// from before the payload is turned into a response.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!("panic: {info}\n{backtrace}");
    }));
}

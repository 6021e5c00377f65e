//! Cofe Relay Server
//!
//! Accepts chat prompts, forwards them to the workflow webhook, and hands the
//! answer back once the workflow calls `/api/n8n-callback`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use cofe_core::config::load_config;
use cofe_core::tracing_init::init_tracing;
use cofe_core::{Config, Correlator, DeliveryMode};
use cofe_relay::forwarder::{HttpWorkflowForwarder, UnconfiguredForwarder, WorkflowForwarder};
use cofe_relay::routes::{AppState, CALLBACK_PATH, build_router};

#[derive(Parser, Debug)]
#[command(name = "cofe-relay")]
#[command(version, about = "Cofe relay server - chat gateway for workflow webhooks")]
struct Args {
    /// Path to a JSON settings file, merged over the global one.
    #[arg(long, env = "COFE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Workflow webhook that receives `{ prompt, requestId }`.
    #[arg(long)]
    webhook_url: Option<String>,

    /// `long-poll` holds the submission open; `async-ack` returns the id at once.
    #[arg(long)]
    delivery_mode: Option<DeliveryMode>,

    /// Longest a submission or poll is held open, in seconds.
    #[arg(long)]
    await_timeout: Option<u64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.server.listen_addr = addr;
        }
        if let Some(url) = &self.webhook_url {
            config.workflow.webhook_url = Some(url.clone());
        }
        if let Some(mode) = self.delivery_mode {
            config.server.delivery_mode = mode;
        }
        if let Some(secs) = self.await_timeout {
            config.correlator.await_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine; the environment may already be populated.
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let level = &config.server.log_level;
    init_tracing(&format!("cofe_relay={level},cofe_core={level}"), args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.listen_addr,
        delivery_mode = %config.server.delivery_mode,
        "Starting cofe-relay"
    );

    let correlator = Arc::new(Correlator::new(config.correlator_config()));
    let sweeper = correlator.spawn_sweeper(config.sweep_interval());

    let forwarder: Arc<dyn WorkflowForwarder> = match &config.workflow.webhook_url {
        Some(url) => {
            info!(webhook_url = %url, "Forwarding prompts to workflow webhook");
            Arc::new(HttpWorkflowForwarder::new(url.clone(), config.forward_timeout())?)
        }
        None => {
            warn!("No workflow webhook configured; every prompt will fail to forward");
            Arc::new(UnconfiguredForwarder)
        }
    };

    let app = build_router(AppState {
        correlator: Arc::clone(&correlator),
        forwarder,
        delivery_mode: config.server.delivery_mode,
        await_timeout: config.await_timeout(),
    });

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        callback = CALLBACK_PATH,
        "Relay listening"
    );

    let shutdown_correlator = Arc::clone(&correlator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
            // Release held-open submissions so graceful shutdown does not wait on them.
            shutdown_correlator.shutdown().await;
        })
        .await?;

    sweeper.abort();
    info!("Relay stopped");
    Ok(())
}

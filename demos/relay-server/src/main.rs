//! Relay server binary.
//!
//! Run with: cargo run -p agent-relay-server -- --echo echo
//!
//! Browsers connect to `ws://HOST:PORT/ws`; handler processes connect to the
//! same endpoint with `?handler=true` and register their agent ids.

mod echo;

use std::sync::Arc;

use agent_relay_core::CancellationToken;
use agent_relay_transport::{RelayServer, RelayServerConfig, config::DEFAULT_PORT};
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::echo::EchoHandler;

#[derive(Debug, Parser)]
#[command(name = "agent-relay", version, about = "Relay between browser sessions and agent handlers")]
struct Args {
    /// Interface to bind.
    #[arg(long, env = "AGENT_RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind; 0 picks a free one.
    #[arg(short, long, env = "AGENT_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Fail runs whose handler stays silent for this many seconds.
    #[arg(long, env = "AGENT_RELAY_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Register an in-process echo handler under this agent id.
    #[arg(long, value_name = "AGENT_ID")]
    echo: Option<String>,
}

impl Args {
    fn server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            host: self.host.clone(),
            port: self.port,
            handler_idle_timeout_secs: self.idle_timeout,
            ..RelayServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let server = RelayServer::new(args.server_config());

    if let Some(agent_id) = &args.echo {
        server
            .register_handler(agent_id, Arc::new(EchoHandler::default()))
            .await;
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C");
        }
        on_signal.cancel();
    });

    server
        .serve(shutdown)
        .await
        .with_context(|| format!("relay on {} failed", args.server_config().bind_addr()))
}

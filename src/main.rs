//! conductord: the orchestrator daemon
//!
//! Exit codes: 0 clean shutdown, 2 configuration error, 3 bind error,
//! 1 anything else.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conductor::api::{AppState, HttpServer, ServerError};
use conductor::pipeline::Orchestrator;
use conductor::{config, BuiltinCatalog, OrchestratorError};

#[derive(Parser, Debug)]
#[command(name = "conductord", version, about = "Agent orchestration service")]
struct Args {
    /// Agents configuration file.
    #[arg(long, default_value = "config/agents.yaml")]
    agents: PathBuf,

    /// Rules and settings configuration file.
    #[arg(long, default_value = "config/rules.yaml")]
    rules: PathBuf,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the query-log directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Session-table sweep cadence.
const EVICTION_INTERVAL: Duration = Duration::from_secs(15 * 60);

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = std::env::var("CONDUCTOR_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let mut loaded = match config::load(&args.agents, &args.rules) {
        Ok(loaded) => loaded,
        Err(error) => {
            tracing::error!("configuration error: {}", error);
            return 2;
        }
    };
    if let Some(bind) = args.bind {
        loaded.settings.server.bind_address = bind;
    }
    if let Some(port) = args.port {
        loaded.settings.server.port = port;
    }
    if let Some(log_dir) = args.log_dir {
        loaded.settings.query_log.directory = log_dir;
    }

    let server_config = loaded.settings.server.clone();
    let drain_grace = loaded.settings.pipeline.drain_grace;

    let orchestrator = match Orchestrator::from_config(loaded, Arc::new(BuiltinCatalog::default()))
    {
        Ok(orchestrator) => Arc::new(orchestrator),
        Err(OrchestratorError::Config(error)) => {
            tracing::error!("configuration error: {}", error);
            return 2;
        }
        Err(error) => {
            tracing::error!("failed to start: {}", error);
            return 1;
        }
    };

    // Periodic session-table sweep.
    {
        let sessions = orchestrator.sessions().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = sessions.evict_idle();
                if evicted > 0 {
                    tracing::debug!("evicted {} idle session(s)", evicted);
                }
            }
        });
    }

    let state = Arc::new(AppState {
        orchestrator,
        agents_path: args.agents,
    });
    let server = HttpServer::new(server_config, state);

    match server.serve(drain_grace).await {
        Ok(()) => {
            tracing::info!("shutdown complete");
            0
        }
        Err(error @ ServerError::Bind { .. }) => {
            tracing::error!("{}", error);
            3
        }
        Err(error) => {
            tracing::error!("{}", error);
            1
        }
    }
}

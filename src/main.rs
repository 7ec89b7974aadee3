//! Binary bootstrap. Mirrors `database_service.py`'s `main()`: parse CLI
//! flags/env vars into a `Config`, build the service, subscribe, then wait
//! on a shutdown signal and tear down bus-then-database (spec §2 "Recovered
//! from original source", §9 "Background tasks").
//!
//! CLI entry points are out of scope per spec §1 beyond this minimal
//! bootstrap (spec §0) — no command dispatch, no plugin loading, lives here.

use clap::Parser;
use rosey_db_bus::config::Config;
use rosey_db_bus::service;

#[derive(Parser, Debug)]
#[command(name = "rosey-db-bus", about = "NATS-mediated data platform for chat-bot plugins")]
struct Cli {
    #[arg(long, env = "ROSEY_DB_PATH")]
    db_path: Option<String>,

    #[arg(long, env = "ROSEY_NATS_URL")]
    nats_url: Option<String>,

    #[arg(long, env = "ROSEY_PLUGIN_ROOT")]
    plugin_root: Option<String>,

    #[arg(long, env = "ROSEY_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// CLI flags override env vars which override defaults.
    fn into_config(self) -> Config {
        let mut config = Config::from_env();
        if let Some(v) = self.db_path {
            config.db_path = v;
        }
        if let Some(v) = self.nats_url {
            config.nats_url = v;
        }
        if let Some(v) = self.plugin_root {
            config.plugin_root = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.into_config();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!(db_path = %config.db_path, nats_url = %config.nats_url, "starting rosey-db-bus");

    let svc = service::build(&config).await?;
    svc.start().await?;

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");
    svc.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

mod config;
mod notify;
mod runner;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dblock_core::CancellationToken;
use dblock_sql::SqlLockStore;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use notify::{Notifier, SlackNotifier};
use runner::{Outcome, Runner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    config.validate()?;

    info!("Starting dblock");
    info!("  Lock: {}", config.lock_name);
    info!("  Lease: {}ms, tick: {}ms", config.lease_ms, config.tick_ms);
    if config.slack_webhook_url.is_some() {
        info!("  Lock loss notifications: slack");
    }

    let store = SqlLockStore::connect(&config.database_url, config.max_connections)
        .await
        .context("failed to open lock database")?;

    let notifier = config
        .slack_webhook_url
        .as_ref()
        .map(|url| Arc::new(SlackNotifier::new(url.clone())) as Arc<dyn Notifier>);

    let cancel = CancellationToken::new();
    spawn_shutdown_signal(cancel.clone());

    let runner = Runner::new(Arc::new(store), config.lock_config(), config.tick(), cancel)
        .with_notifier(notifier);
    let outcome = runner.run(&config.command).await?;

    match &outcome {
        Outcome::Skipped => info!("Another instance holds {}, nothing to do", config.lock_name),
        Outcome::Completed(code) => info!("Command exited with {}", code),
        Outcome::LockLost(err) => warn!("Command stopped after losing the lock: {}", err),
        Outcome::Cancelled => info!("Shutdown complete"),
    }
    std::process::exit(outcome.exit_code());
}

/// Cancel `cancel` on Ctrl+C or SIGTERM.
fn spawn_shutdown_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", err);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, initiating shutdown");
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(err) => {
                    warn!("Failed to install SIGTERM handler: {}", err);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        cancel.cancel();
    });
}

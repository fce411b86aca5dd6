use std::time::Duration;

use clap::Parser;
use dblock_core::LockConfig;

/// Configuration for the dblock runner.
#[derive(Parser, Debug, Clone)]
#[command(name = "dblock")]
#[command(about = "Run a command while holding a database lease lock")]
pub struct Config {
    /// Database URL: postgres://, mysql:// or sqlite://
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Lock name; also the name of the table backing the lock
    #[arg(long, env = "DBLOCK_NAME")]
    pub lock_name: String,

    /// Lease duration in milliseconds
    #[arg(long, default_value = "30000", env = "DBLOCK_LEASE_MS")]
    pub lease_ms: u64,

    /// How often to confirm the lock while the command runs
    #[arg(long, default_value = "1000", env = "DBLOCK_TICK_MS")]
    pub tick_ms: u64,

    /// Connection pool size
    #[arg(long, default_value = "2", env = "DBLOCK_MAX_CONNECTIONS")]
    pub max_connections: u32,

    /// Slack incoming webhook notified when the lock is lost
    #[arg(long, env = "SLACK_NOTIFICATION_URL")]
    pub slack_webhook_url: Option<String>,

    /// Command to run, with its arguments
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

impl Config {
    pub fn lock_config(&self) -> LockConfig {
        LockConfig::new(self.lock_name.clone(), Duration::from_millis(self.lease_ms))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Reject settings under which the lease would lapse between ticks.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.lock_config().validate()?;
        if self.tick_ms == 0 {
            anyhow::bail!("--tick-ms must be greater than zero");
        }
        if self.tick_ms >= self.lease_ms {
            anyhow::bail!(
                "--tick-ms ({}) must be shorter than --lease-ms ({})",
                self.tick_ms,
                self.lease_ms
            );
        }
        Ok(())
    }
}

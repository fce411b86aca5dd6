use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dblock_core::{CancellationToken, DbLock, LockConfig, LockError, LockStore};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::notify::Notifier;

/// How a run ended.
#[derive(Debug)]
pub enum Outcome {
    /// Another instance holds the lock; the command was not started.
    Skipped,
    /// The command exited on its own with this code.
    Completed(i32),
    /// The lock was lost mid-run and the command was killed.
    LockLost(LockError),
    /// Shutdown was requested; the command was killed and the lock released.
    Cancelled,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Skipped => 0,
            Outcome::Completed(code) => *code,
            Outcome::LockLost(_) => 1,
            Outcome::Cancelled => 130,
        }
    }
}

/// Runs one command under a lock, renewing it on a fixed tick.
pub struct Runner {
    store: Arc<dyn LockStore>,
    config: LockConfig,
    tick: Duration,
    cancel: CancellationToken,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Runner {
    pub fn new(
        store: Arc<dyn LockStore>,
        config: LockConfig,
        tick: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            tick,
            cancel,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn Notifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub async fn run(&self, command: &[String]) -> anyhow::Result<Outcome> {
        let (program, args) = command.split_first().context("no command given")?;

        let mut lock =
            DbLock::acquire(self.cancel.clone(), self.store.clone(), self.config.clone()).await;
        if let Err(err) = lock.hold().await {
            if err.is_refused() {
                info!(lock = %self.config.name, "Lock is held elsewhere, skipping run");
                return Ok(Outcome::Skipped);
            }
            if err.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            return Err(err).context("failed to acquire lock");
        }

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                release(&mut lock).await;
                return Err(err).with_context(|| format!("failed to start {program}"));
            }
        };
        info!(lock = %self.config.name, pid = child.id(), "Started {}", command.join(" "));

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.context("failed to wait for command")?;
                    info!(lock = %self.config.name, %status, "Command finished");
                    release(&mut lock).await;
                    return Ok(Outcome::Completed(status.code().unwrap_or(1)));
                }
                _ = self.cancel.cancelled() => {
                    return Ok(self.shutdown(&mut child, &mut lock).await);
                }
                _ = ticker.tick() => {
                    if self.cancel.is_cancelled() {
                        return Ok(self.shutdown(&mut child, &mut lock).await);
                    }
                    if let Err(err) = lock.hold().await {
                        if err.is_cancelled() {
                            stop(&mut child).await;
                            return Ok(Outcome::Cancelled);
                        }
                        warn!(lock = %self.config.name, error = %err, "Lost lock, stopping command");
                        stop(&mut child).await;
                        self.notify(&format!(
                            "dblock: lost lock {} while running `{}`: {}",
                            self.config.name,
                            command.join(" "),
                            err
                        ))
                        .await;
                        return Ok(Outcome::LockLost(err));
                    }
                }
            }
        }
    }

    /// Stop the command first, then let the handle observe the cancellation
    /// and release the lock.
    async fn shutdown(&self, child: &mut Child, lock: &mut DbLock) -> Outcome {
        info!(lock = %self.config.name, "Shutdown requested, stopping command");
        stop(child).await;
        // Always Err once cancelled; dropping the table happens inside
        let _ = lock.hold().await;
        Outcome::Cancelled
    }

    async fn notify(&self, text: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(err) = notifier.notify(text).await {
            warn!(error = %err, "Failed to send lock notification");
        }
    }
}

async fn stop(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!(error = %err, "Failed to kill command");
    }
}

async fn release(lock: &mut DbLock) {
    if let Err(err) = lock.release().await {
        warn!(lock = %lock.name(), error = %err, "Failed to release lock");
    }
}

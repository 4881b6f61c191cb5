//! SchedulerActor - Runs the connection scheduler on a fixed cadence

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, instrument, warn};

use crate::scheduler::{ConnectionScheduler, SchedulerStats};
use crate::util::Clock;

use super::messages::SchedulerCommand;

pub struct SchedulerActor {
    scheduler: ConnectionScheduler,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    command_rx: mpsc::Receiver<SchedulerCommand>,
}

impl SchedulerActor {
    pub fn new(
        scheduler: ConnectionScheduler,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
        command_rx: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        Self {
            scheduler,
            clock,
            tick_interval,
            command_rx,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!(
            "starting scheduler actor (every {:?}, enabled: {})",
            self.tick_interval,
            self.scheduler.policy().enabled
        );

        let mut ticker = interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // refreshes run detached, the tick does not wait for them
                    let _ = self.scheduler.tick(self.clock.now()).await;
                }

                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        warn!("command channel closed, shutting down");
                        break;
                    };
                    match cmd {
                        SchedulerCommand::TickNow { respond_to } => {
                            let report = self.scheduler.tick(self.clock.now()).await;
                            let ids = report.selected.into_iter().map(|(id, _)| id).collect();
                            let _ = respond_to.send(ids);
                        }
                        SchedulerCommand::GetStats { respond_to } => {
                            let _ = respond_to.send(self.scheduler.stats());
                        }
                        SchedulerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }
            }
        }

        debug!("scheduler actor stopped");
    }
}

/// Handle for controlling the SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn spawn(scheduler: ConnectionScheduler, clock: Arc<dyn Clock>, tick_interval: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = SchedulerActor::new(scheduler, clock, tick_interval, cmd_rx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    /// Tick immediately; returns the ids dispatched for refresh
    pub async fn tick_now(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::TickNow { respond_to: tx })
            .await
            .context("failed to send TickNow command")?;
        rx.await.context("failed to receive tick result")
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;
        rx.await.context("failed to receive stats")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}

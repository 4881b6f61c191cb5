//! SourceActor - Drives a poll source
//!
//! ## Message Flow
//!
//! ```text
//! poll(now) ─▶ Handled / Refilled ─▶ poll again right away
//!          └─▶ EnteredQuiet / Idle ─▶ wait poll_delay (or a command)
//!     ↑
//!     └─── Commands (GetStats, Shutdown)
//! ```
//!
//! Commands are only taken between poll steps, so a refill is never
//! interrupted halfway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::sleep;
use tracing::{debug, instrument, trace, warn};

use crate::sources::{BatchFetcher, ItemHandler, PollOutcome, PollSource, SourceStats};
use crate::util::Clock;

use super::messages::SourceCommand;

pub struct SourceActor<F, H> {
    source: PollSource<F, H>,
    clock: Arc<dyn Clock>,
    poll_delay: Duration,
    command_rx: mpsc::Receiver<SourceCommand>,
}

impl<F, H> SourceActor<F, H>
where
    F: BatchFetcher + 'static,
    H: ItemHandler + 'static,
{
    pub fn new(
        source: PollSource<F, H>,
        clock: Arc<dyn Clock>,
        poll_delay: Duration,
        command_rx: mpsc::Receiver<SourceCommand>,
    ) -> Self {
        Self {
            source,
            clock,
            poll_delay,
            command_rx,
        }
    }

    /// Returns the shutdown acknowledgement once the actor should stop
    fn handle_command(&mut self, cmd: SourceCommand) -> Option<oneshot::Sender<()>> {
        match cmd {
            SourceCommand::GetStats { respond_to } => {
                let _ = respond_to.send(self.source.stats());
                None
            }
            SourceCommand::Shutdown { respond_to } => {
                debug!("received shutdown command");
                Some(respond_to)
            }
        }
    }

    #[instrument(skip(self), fields(source = %self.source.name()))]
    pub async fn run(mut self) {
        debug!("starting source actor");
        let mut shutdown_ack = None;

        'run: loop {
            loop {
                match self.command_rx.try_recv() {
                    Ok(cmd) => {
                        if let Some(respond_to) = self.handle_command(cmd) {
                            shutdown_ack = Some(respond_to);
                            break 'run;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("command channel closed, shutting down");
                        break 'run;
                    }
                }
            }

            match self.source.poll(self.clock.now()).await {
                PollOutcome::Handled(disposition) => trace!("handled item: {disposition:?}"),
                PollOutcome::Refilled(count) => trace!("refilled {count} items"),
                PollOutcome::EnteredQuiet | PollOutcome::Idle => {
                    tokio::select! {
                        cmd = self.command_rx.recv() => match cmd {
                            Some(cmd) => {
                                if let Some(respond_to) = self.handle_command(cmd) {
                                    shutdown_ack = Some(respond_to);
                                    break 'run;
                                }
                            }
                            None => {
                                warn!("command channel closed, shutting down");
                                break 'run;
                            }
                        },
                        _ = sleep(self.poll_delay) => {}
                    }
                    continue;
                }
            }

            tokio::task::yield_now().await;
        }

        // releases the handler and with it the routes into the pipeline
        drop(self.source);
        if let Some(respond_to) = shutdown_ack {
            let _ = respond_to.send(());
        }
        debug!("source actor stopped");
    }
}

/// Handle for controlling a SourceActor
#[derive(Clone)]
pub struct SourceHandle {
    sender: mpsc::Sender<SourceCommand>,
    pub name: String,
}

impl SourceHandle {
    pub fn spawn<F, H>(source: PollSource<F, H>, clock: Arc<dyn Clock>, poll_delay: Duration) -> Self
    where
        F: BatchFetcher + 'static,
        H: ItemHandler + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let name = source.name().to_string();

        let actor = SourceActor::new(source, clock, poll_delay, cmd_rx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            name,
        }
    }

    pub async fn stats(&self) -> Result<SourceStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SourceCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;
        rx.await.context("failed to receive stats")
    }

    /// Stop the actor and wait until it released its source
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SourceCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;
        rx.await.context("source actor stopped without acknowledging")
    }
}

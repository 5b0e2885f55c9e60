//! CollectorActor - drives the `CollectorLoop` on a fixed interval
//!
//! ## Message Flow
//!
//! ```text
//! Starting → Polling → Sleeping ─(interval elapsed)→ Polling → ...
//!                          ↑  │
//!                          │  └─ Commands (PollNow, Status)
//!                          └──── CancellationToken → Stopping
//! ```
//!
//! Only one iteration runs at a time. Cancellation is honored at every suspension point:
//! an in-flight iteration is dropped, which rolls back any open database transaction.
//! The token file is only ever replaced by rename, so it is never left half-written.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::messages::{CollectorCommand, CollectorStatus};
use crate::ingest::{CollectorLoop, CycleReport, LoopState};
use crate::time::{Sleeper, TokioSleeper};

pub struct CollectorActor {
    collector: CollectorLoop,

    /// Pause between the end of one iteration and the start of the next
    interval: Duration,

    sleeper: Arc<dyn Sleeper>,
    command_rx: mpsc::Receiver<CollectorCommand>,
    state_tx: watch::Sender<LoopState>,
    cancel: CancellationToken,
    last_report: Option<CycleReport>,
}

impl CollectorActor {
    pub fn new(
        collector: CollectorLoop,
        interval: Duration,
        command_rx: mpsc::Receiver<CollectorCommand>,
        state_tx: watch::Sender<LoopState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            collector,
            interval,
            sleeper: Arc::new(TokioSleeper),
            command_rx,
            state_tx,
            cancel,
            last_report: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Run until cancelled or until every handle is gone
    #[instrument(skip(self), fields(interval = ?self.interval))]
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        self.set_state(LoopState::Starting);

        'run: {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'run,
                _ = self.collector.start() => {}
            }

            if self.iterate(&cancel).await.is_none() {
                break 'run;
            }

            loop {
                self.set_state(LoopState::Sleeping);
                let sleeper = self.sleeper.clone();
                let mut sleep = sleeper.sleep(self.interval);

                let respond_to = loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'run,

                        cmd = self.command_rx.recv() => match cmd {
                            Some(CollectorCommand::PollNow { respond_to }) => {
                                debug!("received PollNow command");
                                break Some(respond_to);
                            }
                            Some(CollectorCommand::Status { respond_to }) => {
                                let _ = respond_to.send(self.status());
                            }
                            None => {
                                warn!("command channel closed, shutting down");
                                break 'run;
                            }
                        },

                        _ = &mut sleep => break None,
                    }
                };

                match self.iterate(&cancel).await {
                    Some(report) => {
                        if let Some(respond_to) = respond_to {
                            let _ = respond_to.send(report);
                        }
                    }
                    None => break 'run,
                }
            }
        }

        self.set_state(LoopState::Stopping);
        self.collector.shutdown().await;
        info!(
            "collector stopped after {} iteration(s)",
            self.collector.iteration()
        );
    }

    /// One iteration, or `None` if cancelled before it finished
    async fn iterate(&mut self, cancel: &CancellationToken) -> Option<CycleReport> {
        self.set_state(LoopState::Polling);

        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            report = self.collector.run_iteration() => report,
        };

        self.last_report = Some(report.clone());
        Some(report)
    }

    fn set_state(&self, state: LoopState) {
        debug!("collector state: {}", state);
        self.state_tx.send_replace(state);
    }

    fn status(&self) -> CollectorStatus {
        CollectorStatus {
            state: *self.state_tx.borrow(),
            iteration: self.collector.iteration(),
            cursor: self.collector.cursor().since(),
            active_endpoint: self.collector.fetcher().endpoints().active(),
            token_expires_at: self.collector.tokens().current().map(|t| t.expires_at),
            last_report: self.last_report.clone(),
        }
    }
}

/// Handle for controlling a CollectorActor
///
/// Cheap to clone; every clone talks to the same actor.
#[derive(Clone)]
pub struct CollectorHandle {
    sender: mpsc::Sender<CollectorCommand>,
    state: watch::Receiver<LoopState>,
    cancel: CancellationToken,
}

impl CollectorHandle {
    /// Spawn the actor with the tokio timer and a fresh cancellation token
    pub fn spawn(collector: CollectorLoop, interval: Duration) -> Self {
        Self::spawn_with(
            collector,
            interval,
            Arc::new(TokioSleeper),
            CancellationToken::new(),
        )
    }

    pub fn spawn_with(
        collector: CollectorLoop,
        interval: Duration,
        sleeper: Arc<dyn Sleeper>,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(LoopState::Starting);

        let actor = CollectorActor::new(collector, interval, cmd_rx, state_tx, cancel.clone())
            .with_sleeper(sleeper);

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            state: state_rx,
            cancel,
        }
    }

    /// Trigger an immediate iteration and wait for its report
    pub async fn poll_now(&self) -> Result<CycleReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CollectorCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("collector stopped before the poll finished")
    }

    pub async fn status(&self) -> Result<CollectorStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CollectorCommand::Status { respond_to: tx })
            .await
            .context("failed to send Status command")?;

        rx.await.context("failed to receive status")
    }

    /// Current loop state, without waiting for the actor
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Wait until the loop reports `target`
    pub async fn wait_for_state(&self, target: LoopState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .context("collector stopped")?;
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the collector and wait for it to stop
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();

        let mut state = self.state.clone();
        while state.changed().await.is_ok() {}

        Ok(())
    }
}

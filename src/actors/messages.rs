//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to the actor via mpsc
//! 2. **Replies**: oneshot channels carry the answer back to the caller
//! 3. **State**: the coarse loop state is published on a watch channel so it can be read
//!    without waiting for the actor

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::ingest::{CycleReport, LoopState};
use crate::mcs::EndpointChoice;

/// Commands that can be sent to a CollectorActor
#[derive(Debug)]
pub enum CollectorCommand {
    /// Run an iteration right away instead of waiting for the interval to elapse
    ///
    /// Handled while the actor sleeps; the interval restarts afterwards.
    PollNow {
        respond_to: oneshot::Sender<CycleReport>,
    },

    /// Snapshot of the collector's progress
    Status {
        respond_to: oneshot::Sender<CollectorStatus>,
    },
}

/// Point-in-time view of a running collector
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorStatus {
    pub state: LoopState,

    /// Iterations run so far
    pub iteration: u64,

    /// Lower bound for the next alarm fetch
    pub cursor: Option<DateTime<Utc>>,

    pub active_endpoint: EndpointChoice,

    /// Expiry of the access token held in memory, if any
    pub token_expires_at: Option<DateTime<Utc>>,

    pub last_report: Option<CycleReport>,
}

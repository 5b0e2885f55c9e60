//! Actor wrapper around the collector loop
//!
//! The collector runs as an independent async task and is controlled through a cloneable
//! handle over a Tokio command channel.
//!
//! ## Architecture Overview
//!
//! ```text
//!   main ── spawns ──▶ CollectorActor ── owns ──▶ CollectorLoop
//!    │                      ▲   │                  ├─ TokenManager
//!    │ CollectorHandle      │   │ watch            ├─ AlarmFetcher
//!    └──── commands ────────┘   └──▶ LoopState     └─ AlarmStore
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: mpsc channel for control messages (poll now, status)
//! 2. **Request/Response**: oneshot channels for the replies
//! 3. **State**: watch channel publishing `LoopState`
//! 4. **Shutdown**: a `CancellationToken` shared with the process signal handler

pub mod collector;
pub mod messages;

pub use collector::{CollectorActor, CollectorHandle};
pub use messages::{CollectorCommand, CollectorStatus};

//! Storage backends for alarm persistence
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` allows swapping implementations
//! - **Async**: All operations are async for compatibility with the collector actor
//! - **Idempotent**: Alarms are upserted by `event_id`, so re-fetching is harmless
//!
//! ## Backends
//!
//! - **PostgreSQL**: Network database, the production target (`storage-postgres` feature)
//! - **SQLite**: Embedded database for single-host deployments and tests
//! - **In-Memory**: No persistence, for dry runs and tests
//!
//! `AlarmStore` sits in front of whichever backend is configured and owns the
//! connect/reconnect policy.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mcs_collector::config::StorageConfig;
//! use mcs_collector::storage::{AlarmStore, ConfigConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = ConfigConnector::new(
//!         StorageConfig::Sqlite { path: "./alarms.db".into() },
//!         Duration::from_secs(30),
//!     );
//!     let mut store = AlarmStore::new(Arc::new(connector));
//!     println!("{} alarms stored", store.count_alarms().await?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-postgres")]
pub mod postgres;
pub mod sqlite;
pub mod store;

pub use backend::{BackendConnector, HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use store::{AlarmStore, ConfigConnector};

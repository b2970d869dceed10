// src/lib.rs
// Public library surface for the daemon binary and integration tests.

pub mod classifier;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod digest;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod quota;
pub mod retry;
pub mod schedule;
pub mod state;
pub mod subscription;

// ---- Re-exports for a stable public API ----
pub use crate::coordinator::{RunCoordinator, RunReport};
pub use crate::daemon::{Daemon, DaemonConfig};
pub use crate::error::{PortError, RunError, StoreError};
pub use crate::state::WatermarkStore;
pub use crate::subscription::Subscription;

// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod collect;
pub mod config;
pub mod error;
pub mod metrics;

// ---- Re-exports for stable public API ----
pub use crate::collect::checkpoint::CheckpointStore;
pub use crate::collect::orchestrator::{CycleReport, Orchestrator, OrchestratorConfig};
pub use crate::collect::publish::Publisher;
pub use crate::collect::scheduler::{IntervalTrigger, Trigger};
pub use crate::collect::store::Store;
pub use crate::collect::types::{Channel, Collector, Item, RawItem, StoredItem, Timestamp};
pub use crate::collect::{run_channel_cycle, CycleOutcome, CycleState, CycleTimeouts};
pub use crate::config::AppConfig;

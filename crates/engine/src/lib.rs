//! `bulkrelay-engine` — session-scoped dispatch queues and paced workers.
//!
//! ## Design
//!
//! - One FIFO queue and at most one worker per session
//! - Workers pace dispatches to respect the gateway's abuse limits
//! - All queues and worker run-states snapshot to the persistence store
//!   and restore across restarts
//! - Failed dispatches are recorded on the item, never retried
//!
//! ## Components
//!
//! - `SessionQueue`: ordered items with status tracking
//! - `SessionWorker`: the paced drain loop for one session
//! - `Dispatcher`: the seam to the downstream gateway (HTTP by default)
//! - `QueueRegistry`: owns the session -> (queue, worker) mapping
//! - `CampaignManager`: persisted campaign metadata catalog

pub mod campaigns;
pub mod config;
pub mod dispatcher;
pub mod queue;
pub mod registry;
pub mod worker;

pub use campaigns::{CampaignManager, CampaignSummary};
pub use config::EngineConfig;
pub use dispatcher::{DispatchError, Dispatcher, HttpDispatcher};
pub use queue::SessionQueue;
pub use registry::{
    CampaignProgress, ItemOutcome, PersistedQueues, QueueDump, QueueRegistry, RegistryStats,
    SessionStatus,
};
pub use worker::SessionWorker;

//! `bulkrelay-core` — domain types for the dispatch queue engine.
//!
//! This crate contains **pure domain** primitives (no I/O, no runtime).

pub mod campaign;
pub mod error;
pub mod id;
pub mod job;
pub mod worker_state;

pub use campaign::{CampaignRecord, CampaignStatus};
pub use error::{DomainError, DomainResult};
pub use id::{CampaignId, ItemId, SessionId};
pub use job::{DispatchJob, ItemStatus, QueuedItem};
pub use worker_state::WorkerRunState;

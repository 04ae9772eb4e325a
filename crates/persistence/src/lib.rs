//! `bulkrelay-persistence` — durable JSON document storage.
//!
//! One JSON file per logical collection, written atomically, with
//! timestamped backups and debounced save scheduling.

pub mod store;

pub use store::{DiskStats, PersistenceStore, StoreError};

//! pulsedb-core: Core library for pulsedb
//!
//! This crate records electricity/gas/water meter pulses from a POSIX message
//! queue into a database without losing or duplicating a pulse across
//! crashes, restarts and store outages.
//!
//! # Architecture
//!
//! ```text
//! producer → main queue → Daemon ─ PulseBuffer ─ BackupLog → backup queue
//!                            │
//!                            └─ reconcile → StoreOp (retried) → PulseStore
//! ```
//!
//! # Modules
//!
//! - `event`: pulse events and the 16-byte queue record
//! - `queue`: event source and backup medium traits, in-memory queue
//! - `mqueue`: POSIX message queue transports (Linux)
//! - `buffer`: bounded buffer of unresolved events and restore normalization
//! - `backup`: durable mirror of the buffer on the backup queue
//! - `reconcile`: debounce and commit decisions
//! - `store`: idempotent pulse store interface and in-memory store
//! - `sqlite`: SQLite pulse store
//! - `retry`: exponential backoff for store calls
//! - `signals`: termination-signal deferral around state mutations
//! - `daemon`: the recorder loop
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! Unsafe code is denied. The one exception is installing the signal
//! handler in `signals`.

#![deny(unsafe_code)]

pub mod backup;
pub mod buffer;
pub mod config;
pub mod daemon;
pub mod error;
pub mod event;
pub mod logging;
#[cfg(target_os = "linux")]
pub mod mqueue;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod signals;
pub mod sqlite;
pub mod store;

pub use backup::BackupLog;
pub use buffer::{Admission, OpenState, PulseBuffer};
pub use config::Config;
pub use daemon::{Daemon, DaemonSettings, DaemonStats, Exit};
pub use error::{Error, Result};
pub use event::{Event, MeterId, PulseKind, Timestamp};
pub use queue::{BackupMedium, EventSource, MemoryQueue, Received};
pub use retry::RetryPolicy;
pub use signals::SignalGate;
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, PulseStore, StoreOp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}

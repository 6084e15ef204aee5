//! chainsync-storage — durable event-store backends for ChainSync.
//!
//! Backends:
//! - `chainsync_core::store::MemoryEventStore` — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use chainsync_core::store::MemoryEventStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventStore;

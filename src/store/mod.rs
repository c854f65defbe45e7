//! Local persistent key-value storage.
//!
//! Every other component persists through the [`KeyValueStore`] trait:
//! - [`SqliteStore`] is the durable on-device store
//! - [`MemoryStore`] keeps everything in process memory (tests, ephemeral sessions)

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::KeyValueStore;

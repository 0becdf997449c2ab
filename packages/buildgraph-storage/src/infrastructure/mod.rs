//! Infrastructure layer - Storage adapters
//!
//! - `fs`: per-operation metadata directories
//! - `memory`: process-local claim store
//! - `sqlite`: claim store shared through a database file

pub mod fs;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use fs::FsMetadataStore;
pub use memory::InMemoryClaimStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteClaimStore;

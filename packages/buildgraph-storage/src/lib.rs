//! buildgraph-storage - durable state for the operation engine
//!
//! Two concerns live here, each behind a port trait so the engine never
//! depends on a concrete backend:
//!
//! 1. **Operation metadata**: the last outcome of every operation (duration,
//!    log locations, cobuild identifiers) plus its captured log chunks, so a
//!    later run that restores the operation from cache can replay its output.
//! 2. **Cobuild claims**: a small keyed record per (context, operation) with a
//!    versioned compare-and-set, shared by every cooperating runner.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use buildgraph_storage::{FsMetadataStore, MetadataStore, OperationRef};
//!
//! let store = FsMetadataStore::new("/repo/common/temp/operation-metadata");
//! let stored = store.load(&OperationRef::new("web", "build")).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    ClaimOutcome, ClaimRecord, ClaimState, ClaimStore, CobuildMetadata, LogChunk, MetadataDraft,
    MetadataStore, OperationMetadata, OperationRef, StoredOperation, StreamKind, VersionedClaim,
};
pub use infrastructure::{FsMetadataStore, InMemoryClaimStore};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteClaimStore;

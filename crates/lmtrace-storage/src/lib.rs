//! Persistent storage for lmtrace traces.
//!
//! Provides the [`TraceStore`] trait defining the storage contract, the
//! [`SqliteStore`] backend (transactional relational store), and the
//! content-addressed [`BlobStore`] for oversized invocation payloads.
//!
//! # Architecture
//!
//! Writes are the only mutation entry points and each runs in a single
//! transaction; rows are append-only per the trace data model. Oversized
//! invocation contents are compressed and moved out-of-line to the blob
//! store, leaving only a reference in the relational row.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`traits`]: TraceStore trait definition
//! - [`schema`]: SQL schema constants and migration setup
//! - [`sqlite`]: SqliteStore implementation
//! - [`blob`]: content-addressed compressed blob store

pub mod blob;
pub mod error;
pub mod schema;
pub mod sqlite;
pub mod traits;

// Re-export key types for ergonomic use.
pub use blob::BlobStore;
pub use error::StorageError;
pub use sqlite::{SqliteStore, EXTERNALIZATION_THRESHOLD};
pub use traits::TraceStore;

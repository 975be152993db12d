//! Core data model for the lmtrace tracking engine.
//!
//! Defines the persisted entities of an LMP ("language model program")
//! trace: versioned definitions, invocations with their call-graph edges,
//! the large per-invocation payload, and the captured-variable value model.
//! Content identities are derived here so that every layer agrees on what
//! "the same definition" means.
//!
//! # Modules
//!
//! - [`id`]: newtype identifiers for definitions, invocations, and blobs
//! - [`model`]: the persisted entity structs and the captured-value union
//! - [`hash`]: deterministic blake3 content hashing
//! - [`error`]: CoreError enum

pub mod error;
pub mod hash;
pub mod id;
pub mod model;

pub use error::CoreError;
pub use id::{BlobId, InvocationId, LmpId};
pub use model::{
    CapturedState, CapturedValue, Invocation, InvocationContents, LmpDefinition, LmpKind,
    SourceLocation, Usage,
};

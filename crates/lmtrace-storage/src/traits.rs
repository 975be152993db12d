//! The [`TraceStore`] trait defining the storage contract for traces.
//!
//! Two kinds of operations:
//! - **Writes** (`write_definition`, `write_invocation`) are the only
//!   mutation entry points, both idempotent/append-only. Each runs in a
//!   single transaction. Callers serialize writes through a gate; the
//!   store itself stays single-writer.
//! - **Reads** take `&self`, open no transaction, and are not gated.
//!
//! The trait is synchronous (not async); the async engine wraps the store
//! behind its own gate.

use lmtrace_core::id::{InvocationId, LmpId};
use lmtrace_core::model::{Invocation, InvocationContents, LmpDefinition};

use crate::error::StorageError;

/// The storage contract for LMP definitions and invocation traces.
pub trait TraceStore {
    /// Persists a definition, assigning its version number.
    ///
    /// If the content identity already exists this is a no-op returning
    /// the existing row unchanged; version numbering is untouched.
    /// Otherwise the row is written at `1 + max(version_number)` for its
    /// name (read fresh, never cached) along with its `uses` edges, all in
    /// one transaction. Returns the row as stored plus whether this call
    /// inserted it.
    fn write_definition(
        &mut self,
        def: &LmpDefinition,
    ) -> Result<(LmpDefinition, bool), StorageError>;

    /// Persists an invocation and its contents in one transaction:
    /// invocation row, contents row (externalized above the size
    /// threshold), owning definition's counter increment, and consumption
    /// edges. Any failure rolls the whole transaction back.
    ///
    /// Idempotent on the invocation id: a retried write with an existing
    /// id writes nothing (no contents, no counter increment, no edges)
    /// and returns `false`.
    fn write_invocation(
        &mut self,
        inv: &Invocation,
        contents: &InvocationContents,
    ) -> Result<bool, StorageError>;

    /// Looks up a definition by content identity, including `uses` edges.
    fn get_definition(&self, id: &LmpId) -> Result<LmpDefinition, StorageError>;

    /// All versions recorded for a fully-qualified name, ascending.
    fn get_versions(&self, name: &str) -> Result<Vec<LmpDefinition>, StorageError>;

    /// Highest version number recorded for a name (0 if none).
    fn latest_version_number(&self, name: &str) -> Result<i64, StorageError>;

    /// Reads back an invocation and its contents, re-inlining blob
    /// payloads transparently when the contents were externalized.
    fn get_invocation(
        &self,
        id: &InvocationId,
    ) -> Result<(Invocation, InvocationContents), StorageError>;

    /// All invocations of a definition, ascending by creation time.
    fn invocations_for(&self, lmp_id: &LmpId) -> Result<Vec<Invocation>, StorageError>;
}

//! The injected definition-resolution collaborator.
//!
//! Locating an LMP's source text and line range is a static-analysis
//! concern outside this engine; the tracker invokes the resolver lazily
//! and memoizes per location.

use thiserror::Error;

use lmtrace_core::id::LmpId;
use lmtrace_core::model::{LmpKind, SourceLocation};

/// Resolution failed; the invocation proceeds untracked.
#[derive(Debug, Error)]
#[error("definition resolution failed: {0}")]
pub struct ResolveError(pub String);

/// What the resolver recovers about an LMP at a source location.
#[derive(Debug, Clone)]
pub struct ResolvedLmp {
    pub kind: LmpKind,
    /// Fully-qualified name.
    pub name: String,
    pub source: String,
    /// Source text of the definition's static dependencies.
    pub dependencies: String,
    /// Language tag of the source text.
    pub language: String,
    /// Declared API parameters.
    pub api_params: serde_json::Value,
    /// Content identities of definitions this one statically uses.
    pub uses: Vec<LmpId>,
    /// The definition's line range, fed to state capture.
    pub range: SourceLocation,
}

/// Resolves a source location to the LMP defined there.
pub trait DefinitionResolver: Send + Sync {
    fn resolve(&self, location: &SourceLocation) -> Result<ResolvedLmp, ResolveError>;
}

//! Engine error types.
//!
//! Only failures of the wrapped call itself surface here: the body
//! failing to produce a prompt, or the provider failing the model call.
//! Tracking-infrastructure errors (store unavailable, capture failure,
//! resolution failure) are swallowed at the tracking boundary with a log
//! line, and the corresponding feature degrades to absent.

use thiserror::Error;

use crate::provider::ProviderError;

/// Errors that propagate to the caller of a tracked invocation.
#[derive(Debug, Error)]
pub enum TrackError {
    /// The model call failed. Fatal to the wrapped call; any partial
    /// captured state is discarded.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The LMP body failed before producing a prompt.
    #[error("lmp body failed: {0}")]
    Body(String),
}

//! The lmtrace tracking engine.
//!
//! Versions LMP definitions by content identity, threads an invocation
//! context through nested async calls to build the call graph, captures
//! runtime variable state best-effort via an injected inspector, and
//! commits each invocation to the trace store as one transaction.
//!
//! Tracking never sits on the critical path: a caller's result is
//! identical whether or not tracking succeeds.
//!
//! # Modules
//!
//! - [`context`]: task-local invocation stack (`used_by` edges)
//! - [`capture`]: runtime state capture capability and inspector seam
//! - [`resolver`]: injected definition-resolution collaborator
//! - [`provider`]: injected model-provider collaborator
//! - [`tracker`]: the engine orchestrating one invocation end to end
//! - [`error`]: TrackError enum

pub mod capture;
pub mod context;
pub mod error;
pub mod provider;
pub mod resolver;
pub mod tracker;

pub use capture::{InspectorCapture, NoopCapture, RuntimeStateCapture};
pub use error::TrackError;
pub use provider::{Message, ModelProvider, PromptRequest, ProviderResponse};
pub use resolver::{DefinitionResolver, ResolvedLmp};
pub use tracker::{StoreUpdate, TrackedResponse, Tracker, TrackerConfig};

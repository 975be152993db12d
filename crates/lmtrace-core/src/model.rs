//! Persisted entity types for LMP definitions and invocations.
//!
//! `LmpDefinition` rows are append-only: created once per content identity,
//! never mutated. `Invocation` and `InvocationContents` rows are created
//! exactly once on completion. The captured-variable model is a tagged
//! union because runtime values have unknown, possibly non-serializable
//! shape.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{InvocationId, LmpId};

/// What kind of unit an LMP is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LmpKind {
    /// Produces a prompt for a language model call.
    Lm,
    /// A tool callable by a model.
    Tool,
    /// Produces multimodal content.
    Multimodal,
    /// Anything else tracked through the engine.
    Other,
}

/// A versioned LMP definition.
///
/// Identity is the content hash of source + dependencies + qualified name;
/// `version_number` is unique per `name` and strictly increasing from 1,
/// assigned only on first write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmpDefinition {
    pub lmp_id: LmpId,
    /// Fully-qualified name (module path + local name).
    pub name: String,
    pub source: String,
    /// Source text of everything the definition statically depends on.
    pub dependencies: String,
    /// Language tag of the source text (e.g. "python").
    pub language: String,
    pub kind: LmpKind,
    /// Declared API parameters of the definition.
    pub api_params: serde_json::Value,
    pub commit_message: String,
    pub version_number: i64,
    pub created_at: DateTime<Utc>,
    /// Content identities of other definitions this one statically uses.
    pub uses: Vec<LmpId>,
    /// Derived counter, incremented with each recorded invocation.
    pub num_invocations: i64,
}

/// One recorded execution of an LMP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub id: InvocationId,
    pub lmp_id: LmpId,
    pub latency_ms: f64,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    /// Reserved cache key over the captured runtime state.
    pub state_cache_key: String,
    pub created_at: DateTime<Utc>,
    /// The invocation that was open on the call stack when this one
    /// started, if any.
    pub used_by_id: Option<InvocationId>,
    /// Sibling invocations whose output this one read as input.
    pub consumes: Vec<InvocationId>,
}

/// The large payload for one invocation.
///
/// Exactly one row per invocation. When the combined serialized size of
/// the five payload fields exceeds the externalization threshold, the
/// whole payload moves to the blob store and `is_external` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationContents {
    pub params: serde_json::Value,
    pub results: serde_json::Value,
    /// The exact parameters sent to the model provider.
    pub invocation_api_params: serde_json::Value,
    pub global_vars: IndexMap<String, CapturedValue>,
    pub free_vars: IndexMap<String, CapturedValue>,
    pub is_external: bool,
}

impl InvocationContents {
    /// Combined serialized size of the payload fields, used for the
    /// externalization decision.
    pub fn serialized_len(&self) -> Result<usize, CoreError> {
        Ok(serde_json::to_vec(&self.params)?.len()
            + serde_json::to_vec(&self.results)?.len()
            + serde_json::to_vec(&self.invocation_api_params)?.len()
            + serde_json::to_vec(&self.global_vars)?.len()
            + serde_json::to_vec(&self.free_vars)?.len())
    }
}

/// A captured runtime variable value.
///
/// Runtime values have no guaranteed shape; anything that cannot be
/// represented is recorded as an [`CapturedValue::Opaque`] marker carrying
/// a type description instead of being dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum CapturedValue {
    Primitive(serde_json::Value),
    Map(IndexMap<String, CapturedValue>),
    List(Vec<CapturedValue>),
    Opaque(String),
}

/// The variables visible at the capture point of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedState {
    pub globals: IndexMap<String, CapturedValue>,
    pub frees: IndexMap<String, CapturedValue>,
}

impl CapturedState {
    pub fn is_empty(&self) -> bool {
        self.globals.is_empty() && self.frees.is_empty()
    }
}

/// Token usage reported by a model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/// Where an LMP's source lives: file plus inclusive line range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
}

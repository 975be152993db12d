//! The tracking engine: one invocation end to end.
//!
//! [`Tracker`] is constructed from an explicit [`TrackerConfig`] and
//! injected collaborators -- no process-global registry. It wraps the
//! store in `Arc<tokio::sync::Mutex<>>`: `rusqlite::Connection` is
//! `!Sync`, and the async Mutex doubles as the single-writer gate that
//! serializes write transactions. Definition identities and per-location
//! resolutions are memoized in `DashMap`s; version numbers are never
//! cached and always come fresh from the store.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use lmtrace_core::hash;
use lmtrace_core::id::{InvocationId, LmpId};
use lmtrace_core::model::{
    CapturedState, Invocation, InvocationContents, LmpDefinition, SourceLocation, Usage,
};
use lmtrace_storage::{BlobStore, SqliteStore, StorageError, TraceStore, EXTERNALIZATION_THRESHOLD};

use crate::capture::{CaptureWindow, NoopCapture, RuntimeStateCapture, DEFAULT_PAUSE_TIMEOUT};
use crate::context;
use crate::error::TrackError;
use crate::provider::{ModelProvider, PromptRequest};
use crate::resolver::{DefinitionResolver, ResolvedLmp};

/// Explicit engine configuration, constructed once and passed in.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// SQLite database file path.
    pub db_path: String,
    /// Root directory of the blob store.
    pub blob_root: PathBuf,
    /// Combined contents size above which payloads move to the blob store.
    pub externalization_threshold: usize,
    /// How long each capture window waits for its breakpoint to fire.
    pub capture_timeout: Duration,
}

impl TrackerConfig {
    pub fn new(db_path: impl Into<String>, blob_root: impl Into<PathBuf>) -> Self {
        TrackerConfig {
            db_path: db_path.into(),
            blob_root: blob_root.into(),
            externalization_threshold: EXTERNALIZATION_THRESHOLD,
            capture_timeout: DEFAULT_PAUSE_TIMEOUT,
        }
    }
}

/// A "store updated" signal for observers to invalidate cached views.
#[derive(Debug, Clone)]
pub enum StoreUpdate {
    DefinitionWritten(LmpId),
    InvocationWritten(InvocationId),
}

/// What a tracked call hands back to its caller.
///
/// The invocation id lets callers thread consumption edges into later
/// invocations that read this result.
#[derive(Debug, Clone)]
pub struct TrackedResponse {
    pub invocation_id: InvocationId,
    pub results: serde_json::Value,
    pub usage: Option<Usage>,
}

/// The tracking engine.
pub struct Tracker {
    store: Arc<Mutex<SqliteStore>>,
    resolver: Arc<dyn DefinitionResolver>,
    capture: Arc<dyn RuntimeStateCapture>,
    capture_timeout: Duration,
    definitions: DashMap<LmpId, Arc<LmpDefinition>>,
    resolutions: DashMap<SourceLocation, Arc<ResolvedLmp>>,
    updates: broadcast::Sender<StoreUpdate>,
}

impl Tracker {
    /// Opens the store described by `config` and builds the engine.
    pub fn new(
        config: &TrackerConfig,
        resolver: Arc<dyn DefinitionResolver>,
        capture: Arc<dyn RuntimeStateCapture>,
    ) -> Result<Self, StorageError> {
        let store = SqliteStore::open(&config.db_path, BlobStore::new(&config.blob_root))?
            .with_externalization_threshold(config.externalization_threshold);
        let mut tracker = Self::with_store(store, resolver, capture);
        tracker.capture_timeout = config.capture_timeout;
        Ok(tracker)
    }

    /// Builds the engine around an already-open store (for testing).
    pub fn with_store(
        store: SqliteStore,
        resolver: Arc<dyn DefinitionResolver>,
        capture: Arc<dyn RuntimeStateCapture>,
    ) -> Self {
        let (updates, _) = broadcast::channel(64);
        Tracker {
            store: Arc::new(Mutex::new(store)),
            resolver,
            capture,
            capture_timeout: DEFAULT_PAUSE_TIMEOUT,
            definitions: DashMap::new(),
            resolutions: DashMap::new(),
            updates,
        }
    }

    /// Subscribes to store-updated signals.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    /// Shared handle to the underlying store, for read access.
    pub fn store(&self) -> Arc<Mutex<SqliteStore>> {
        self.store.clone()
    }

    /// Runs one tracked invocation end to end.
    ///
    /// `body` produces the prompt; the engine performs the provider call.
    /// Body and provider errors propagate. Every tracking step --
    /// resolution, definition write, state capture, invocation write --
    /// degrades independently: user-visible behavior is identical whether
    /// or not tracking succeeds.
    pub async fn invoke<B, Fut>(
        &self,
        provider: &dyn ModelProvider,
        location: &SourceLocation,
        params: serde_json::Value,
        consumes: Vec<InvocationId>,
        body: B,
    ) -> Result<TrackedResponse, TrackError>
    where
        B: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<PromptRequest, TrackError>> + Send,
    {
        let resolved = self.resolution(location);
        let definition = match &resolved {
            Some(resolved) => self.ensure_definition(resolved).await,
            None => None,
        };

        let invocation_id = InvocationId::new();
        let used_by_id = context::current_invocation();
        let started = Instant::now();

        let capture_range = resolved
            .as_ref()
            .map(|r| r.range.clone())
            .unwrap_or_else(|| location.clone());

        let (body_outcome, state) = context::with_invocation(invocation_id.clone(), async {
            // Arming the window only pays off when the invocation will
            // actually be recorded.
            let window: Box<dyn CaptureWindow> = if definition.is_some() {
                self.capture.begin(&capture_range, self.capture_timeout).await
            } else {
                NoopCapture.begin(&capture_range, self.capture_timeout).await
            };
            let body_outcome = body().await;
            let state = window.finish().await;
            (body_outcome, state)
        })
        .await;

        let prompt = body_outcome?;
        let response = provider.call(&prompt).await?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        if let Some(definition) = definition {
            self.record_invocation(
                &definition,
                invocation_id.clone(),
                used_by_id,
                consumes,
                params,
                &prompt,
                &response.results,
                response.usage,
                state,
                latency_ms,
            )
            .await;
        }

        Ok(TrackedResponse {
            invocation_id,
            results: response.results,
            usage: response.usage,
        })
    }

    /// Lazily resolves and memoizes the LMP at a location.
    fn resolution(&self, location: &SourceLocation) -> Option<Arc<ResolvedLmp>> {
        if let Some(resolved) = self.resolutions.get(location) {
            return Some(resolved.clone());
        }
        match self.resolver.resolve(location) {
            Ok(resolved) => {
                let resolved = Arc::new(resolved);
                self.resolutions
                    .insert(location.clone(), resolved.clone());
                Some(resolved)
            }
            Err(e) => {
                tracing::warn!(error = %e, file = %location.file, "definition resolution failed; invocation goes untracked");
                None
            }
        }
    }

    /// Resolves-or-creates the definition row, memoized by content
    /// identity. Storage failure degrades to untracked.
    async fn ensure_definition(&self, resolved: &ResolvedLmp) -> Option<Arc<LmpDefinition>> {
        let lmp_id = LmpId::derive(&resolved.source, &resolved.dependencies, &resolved.name);
        if let Some(definition) = self.definitions.get(&lmp_id) {
            return Some(definition.clone());
        }

        let candidate = LmpDefinition {
            lmp_id: lmp_id.clone(),
            name: resolved.name.clone(),
            source: resolved.source.clone(),
            dependencies: resolved.dependencies.clone(),
            language: resolved.language.clone(),
            kind: resolved.kind,
            api_params: resolved.api_params.clone(),
            // Assigned by the store along with the version number.
            commit_message: String::new(),
            version_number: 0,
            created_at: Utc::now(),
            uses: resolved.uses.clone(),
            num_invocations: 0,
        };

        let written = {
            let mut store = self.store.lock().await;
            store.write_definition(&candidate)
        };

        match written {
            Ok((stored, inserted)) => {
                let stored = Arc::new(stored);
                self.definitions.insert(lmp_id.clone(), stored.clone());
                // Signal only durable writes; a no-op on a pre-existing
                // identity stays silent.
                if inserted {
                    let _ = self.updates.send(StoreUpdate::DefinitionWritten(lmp_id));
                }
                Some(stored)
            }
            Err(e) => {
                tracing::warn!(error = %e, lmp = %resolved.name, "definition write failed; invocation goes untracked");
                None
            }
        }
    }

    /// Commits one invocation. Failures log and continue -- the trace
    /// entry is lost but the caller's result is unaffected.
    #[allow(clippy::too_many_arguments)]
    async fn record_invocation(
        &self,
        definition: &LmpDefinition,
        id: InvocationId,
        used_by_id: Option<InvocationId>,
        consumes: Vec<InvocationId>,
        params: serde_json::Value,
        prompt: &PromptRequest,
        results: &serde_json::Value,
        usage: Option<Usage>,
        state: CapturedState,
        latency_ms: f64,
    ) {
        let state_cache_key = hash::state_cache_key(&state);
        let invocation_api_params = match serde_json::to_value(prompt) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "prompt request not serializable");
                serde_json::Value::Null
            }
        };

        let contents = InvocationContents {
            params,
            results: results.clone(),
            invocation_api_params,
            global_vars: state.globals,
            free_vars: state.frees,
            is_external: false,
        };

        let invocation = Invocation {
            id: id.clone(),
            lmp_id: definition.lmp_id.clone(),
            latency_ms,
            prompt_tokens: usage.map(|u| u.prompt_tokens),
            completion_tokens: usage.map(|u| u.completion_tokens),
            state_cache_key,
            created_at: Utc::now(),
            used_by_id,
            consumes,
        };

        let written = {
            let mut store = self.store.lock().await;
            store.write_invocation(&invocation, &contents)
        };

        match written {
            Ok(true) => {
                let _ = self.updates.send(StoreUpdate::InvocationWritten(id));
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(invocation = %invocation.id, error = %e, "invocation write failed; trace entry dropped");
            }
        }
    }
}

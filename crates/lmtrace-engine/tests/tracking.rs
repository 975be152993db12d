//! End-to-end tests for the tracking engine.
//!
//! Tests exercise the full stack: tracked invoke -> resolution ->
//! definition versioning -> context propagation -> capture -> provider ->
//! transactional persistence. Each test builds a fresh tracker over an
//! in-memory SQLite store with a unique temp blob directory, and fake
//! resolver/provider/inspector collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::json;
use tempfile::TempDir;

use lmtrace_core::id::LmpId;
use lmtrace_core::model::{CapturedState, CapturedValue, LmpKind, SourceLocation, Usage};
use lmtrace_engine::capture::{
    BreakCandidate, BreakKind, BreakpointId, CaptureError, CaptureWindow, InspectorCapture,
    InspectorSession, InspectorSessionFactory, NoopCapture, PauseEvent, RuntimeStateCapture,
    ScopeHandle, DEFAULT_PAUSE_TIMEOUT,
};
use lmtrace_engine::provider::{
    Message, ModelProvider, PromptRequest, ProviderError, ProviderResponse,
};
use lmtrace_engine::resolver::{DefinitionResolver, ResolveError, ResolvedLmp};
use lmtrace_engine::tracker::{StoreUpdate, Tracker, TrackerConfig};
use lmtrace_engine::TrackError;
use lmtrace_storage::{BlobStore, SqliteStore, TraceStore};

// ---------------------------------------------------------------------------
// Test collaborators
// ---------------------------------------------------------------------------

/// Resolver backed by a fixed location -> definition map.
#[derive(Default)]
struct MapResolver {
    entries: HashMap<SourceLocation, ResolvedLmp>,
}

impl MapResolver {
    fn with(mut self, location: SourceLocation, name: &str, source: &str) -> Self {
        self.entries.insert(
            location.clone(),
            ResolvedLmp {
                kind: LmpKind::Lm,
                name: name.to_string(),
                source: source.to_string(),
                dependencies: String::new(),
                language: "python".to_string(),
                api_params: json!({}),
                uses: Vec::new(),
                range: location,
            },
        );
        self
    }
}

impl DefinitionResolver for MapResolver {
    fn resolve(&self, location: &SourceLocation) -> Result<ResolvedLmp, ResolveError> {
        self.entries
            .get(location)
            .cloned()
            .ok_or_else(|| ResolveError(format!("no lmp at {}", location.file)))
    }
}

/// Provider echoing the last message back, with fixed usage.
struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    async fn call(&self, request: &PromptRequest) -> Result<ProviderResponse, ProviderError> {
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ProviderResponse {
            results: json!({"role": "assistant", "content": format!("echo: {last}")}),
            usage: Some(Usage {
                prompt_tokens: 7,
                completion_tokens: 3,
            }),
        })
    }
}

/// Provider that always fails the model call.
struct FailingProvider;

#[async_trait]
impl ModelProvider for FailingProvider {
    async fn call(&self, _request: &PromptRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Request("connection reset".to_string()))
    }
}

/// Inspector factory that refuses every session.
struct RefusingFactory;

#[async_trait]
impl InspectorSessionFactory for RefusingFactory {
    async fn open(&self) -> Result<Box<dyn InspectorSession>, CaptureError> {
        Err(CaptureError::Session("inspector unavailable".to_string()))
    }
}

/// Inspector factory whose sessions arm fine but never report a pause.
struct StallingFactory;

#[async_trait]
impl InspectorSessionFactory for StallingFactory {
    async fn open(&self) -> Result<Box<dyn InspectorSession>, CaptureError> {
        Ok(Box::new(StallingSession))
    }
}

struct StallingSession;

#[async_trait]
impl InspectorSession for StallingSession {
    async fn resolve_range(
        &mut self,
        declared: &SourceLocation,
    ) -> Result<SourceLocation, CaptureError> {
        Ok(declared.clone())
    }

    async fn possible_breakpoints(
        &mut self,
        _range: &SourceLocation,
    ) -> Result<Vec<BreakCandidate>, CaptureError> {
        Ok(vec![BreakCandidate {
            line: 12,
            column: 0,
            kind: BreakKind::Return,
        }])
    }

    async fn set_breakpoint(
        &mut self,
        _candidate: &BreakCandidate,
    ) -> Result<BreakpointId, CaptureError> {
        Ok(BreakpointId("bp-stalled".to_string()))
    }

    async fn remove_breakpoint(&mut self, _id: &BreakpointId) -> Result<(), CaptureError> {
        Ok(())
    }

    async fn next_pause(&mut self) -> Result<PauseEvent, CaptureError> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn resume(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    async fn scope_variables(
        &mut self,
        _scope: &ScopeHandle,
    ) -> Result<IndexMap<String, CapturedValue>, CaptureError> {
        unreachable!("never pauses")
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Capture capability yielding a preset state, bypassing the inspector.
struct PresetCapture(CapturedState);

#[async_trait]
impl RuntimeStateCapture for PresetCapture {
    async fn begin(
        &self,
        _range: &SourceLocation,
        _pause_timeout: Duration,
    ) -> Box<dyn CaptureWindow> {
        Box::new(PresetWindow(self.0.clone()))
    }
}

struct PresetWindow(CapturedState);

#[async_trait]
impl CaptureWindow for PresetWindow {
    async fn finish(self: Box<Self>) -> CapturedState {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn location(file: &str) -> SourceLocation {
    SourceLocation {
        file: file.to_string(),
        start_line: 8,
        end_line: 14,
    }
}

fn prompt(content: &str) -> PromptRequest {
    PromptRequest {
        model: "test-model".to_string(),
        messages: vec![Message {
            role: "user".to_string(),
            content: content.to_string(),
        }],
        api_params: json!({}),
    }
}

/// Builds a tracker over an in-memory store with the given collaborators.
fn tracker_with(
    resolver: MapResolver,
    capture: Arc<dyn RuntimeStateCapture>,
) -> (Arc<Tracker>, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let store =
        SqliteStore::in_memory(BlobStore::new(dir.path().join("blobs"))).expect("open store");
    let tracker = Tracker::with_store(store, Arc::new(resolver), capture);
    (Arc::new(tracker), dir)
}

fn hello_resolver() -> MapResolver {
    MapResolver::default().with(
        location("lmp/hello.py"),
        "lmp.hello",
        "def hello(name):\n    return f\"say hi to {name}\"",
    )
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_world_records_definition_and_invocation() {
    let (tracker, _dir) = tracker_with(hello_resolver(), Arc::new(NoopCapture));

    let response = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/hello.py"),
            json!(["world"]),
            vec![],
            || async { Ok(prompt("world")) },
        )
        .await
        .expect("tracked call");

    assert_eq!(
        response.results,
        json!({"role": "assistant", "content": "echo: world"})
    );

    let store = tracker.store();
    let store = store.lock().await;

    let versions = store.get_versions("lmp.hello").unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version_number, 1);
    assert_eq!(versions[0].commit_message, "Initial version");

    let (invocation, contents) = store.get_invocation(&response.invocation_id).unwrap();
    assert_eq!(invocation.lmp_id, versions[0].lmp_id);
    assert_eq!(contents.params, json!(["world"]));
    assert_ne!(contents.results, serde_json::Value::Null);
    assert_eq!(invocation.used_by_id, None);
    assert_eq!(invocation.prompt_tokens, Some(7));
    assert_eq!(invocation.completion_tokens, Some(3));
    assert!(invocation.latency_ms >= 0.0);
    assert_eq!(
        contents.invocation_api_params,
        serde_json::to_value(prompt("world")).unwrap()
    );
}

#[tokio::test]
async fn nested_call_records_used_by_edge() {
    let resolver = hello_resolver().with(
        location("lmp/parent.py"),
        "lmp.parent",
        "def parent(x):\n    return hello(x)",
    );
    let (tracker, _dir) = tracker_with(resolver, Arc::new(NoopCapture));

    let inner = tracker.clone();
    let parent_response = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/parent.py"),
            json!(["x"]),
            vec![],
            move || async move {
                inner
                    .invoke(
                        &EchoProvider,
                        &location("lmp/hello.py"),
                        json!(["x"]),
                        vec![],
                        || async { Ok(prompt("child")) },
                    )
                    .await?;
                Ok(prompt("parent"))
            },
        )
        .await
        .expect("tracked call");

    let store = tracker.store();
    let store = store.lock().await;

    assert_eq!(store.get_versions("lmp.parent").unwrap().len(), 1);
    assert_eq!(store.get_versions("lmp.hello").unwrap().len(), 1);

    let child_lmp = &store.get_versions("lmp.hello").unwrap()[0].lmp_id;
    let child_invocations = store.invocations_for(child_lmp).unwrap();
    assert_eq!(child_invocations.len(), 1);
    assert_eq!(
        child_invocations[0].used_by_id,
        Some(parent_response.invocation_id.clone())
    );

    let (parent_invocation, _) = store.get_invocation(&parent_response.invocation_id).unwrap();
    assert_eq!(parent_invocation.used_by_id, None);
}

#[tokio::test]
async fn repeat_invocations_share_one_definition() {
    let (tracker, _dir) = tracker_with(hello_resolver(), Arc::new(NoopCapture));

    for _ in 0..2 {
        tracker
            .invoke(
                &EchoProvider,
                &location("lmp/hello.py"),
                json!(["world"]),
                vec![],
                || async { Ok(prompt("world")) },
            )
            .await
            .expect("tracked call");
    }

    let store = tracker.store();
    let store = store.lock().await;
    let versions = store.get_versions("lmp.hello").unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(
        store.get_definition(&versions[0].lmp_id).unwrap().num_invocations,
        2
    );
}

#[tokio::test]
async fn concurrent_first_writes_get_gapless_versions() {
    // Five distinct sources sharing one qualified name, invoked
    // concurrently: versions must come out exactly 1..=5.
    let mut resolver = MapResolver::default();
    for n in 1..=5 {
        resolver = resolver.with(
            location(&format!("lmp/multi_v{n}.py")),
            "lmp.multi",
            &format!("def multi():  # revision {n}"),
        );
    }
    let (tracker, _dir) = tracker_with(resolver, Arc::new(NoopCapture));

    let mut handles = Vec::new();
    for n in 1..=5 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker
                .invoke(
                    &EchoProvider,
                    &location(&format!("lmp/multi_v{n}.py")),
                    json!([]),
                    vec![],
                    || async { Ok(prompt("multi")) },
                )
                .await
                .expect("tracked call");
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let store = tracker.store();
    let store = store.lock().await;
    let versions: Vec<i64> = store
        .get_versions("lmp.multi")
        .unwrap()
        .iter()
        .map(|d| d.version_number)
        .collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn capture_failure_degrades_to_empty_state() {
    let failing_capture = Arc::new(InspectorCapture::new(RefusingFactory));
    let (tracker, _dir) = tracker_with(hello_resolver(), failing_capture);

    let response = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/hello.py"),
            json!(["world"]),
            vec![],
            || async { Ok(prompt("world")) },
        )
        .await
        .expect("capture failure must not fail the call");

    // Identical result to a run with capture disabled.
    assert_eq!(
        response.results,
        json!({"role": "assistant", "content": "echo: world"})
    );

    let store = tracker.store();
    let store = store.lock().await;
    let (_, contents) = store.get_invocation(&response.invocation_id).unwrap();
    assert!(contents.global_vars.is_empty());
    assert!(contents.free_vars.is_empty());
}

#[tokio::test]
async fn captured_state_lands_in_contents() {
    let mut state = CapturedState::default();
    state
        .frees
        .insert("name".to_string(), CapturedValue::Primitive(json!("world")));
    let (tracker, _dir) = tracker_with(hello_resolver(), Arc::new(PresetCapture(state)));

    let response = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/hello.py"),
            json!(["world"]),
            vec![],
            || async { Ok(prompt("world")) },
        )
        .await
        .expect("tracked call");

    let store = tracker.store();
    let store = store.lock().await;
    let (invocation, contents) = store.get_invocation(&response.invocation_id).unwrap();
    assert_eq!(
        contents.free_vars.get("name"),
        Some(&CapturedValue::Primitive(json!("world")))
    );
    assert!(!invocation.state_cache_key.is_empty());
}

#[tokio::test]
async fn provider_failure_propagates_and_records_nothing() {
    let (tracker, _dir) = tracker_with(hello_resolver(), Arc::new(NoopCapture));

    let result = tracker
        .invoke(
            &FailingProvider,
            &location("lmp/hello.py"),
            json!(["world"]),
            vec![],
            || async { Ok(prompt("world")) },
        )
        .await;
    assert!(matches!(result, Err(TrackError::Provider(_))));

    let store = tracker.store();
    let store = store.lock().await;
    // The definition was resolved-or-created up front, but no invocation
    // row exists and its counter never moved.
    let versions = store.get_versions("lmp.hello").unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].num_invocations, 0);
    assert!(store.invocations_for(&versions[0].lmp_id).unwrap().is_empty());
}

#[tokio::test]
async fn unresolvable_location_runs_untracked() {
    let (tracker, _dir) = tracker_with(MapResolver::default(), Arc::new(NoopCapture));

    let response = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/unknown.py"),
            json!([]),
            vec![],
            || async { Ok(prompt("anyone home")) },
        )
        .await
        .expect("resolution failure must not fail the call");
    assert_eq!(
        response.results,
        json!({"role": "assistant", "content": "echo: anyone home"})
    );

    let store = tracker.store();
    let store = store.lock().await;
    assert!(store.get_versions("lmp.unknown").unwrap().is_empty());
}

#[tokio::test]
async fn consumption_edges_are_threaded_by_callers() {
    let (tracker, _dir) = tracker_with(hello_resolver(), Arc::new(NoopCapture));

    let first = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/hello.py"),
            json!(["world"]),
            vec![],
            || async { Ok(prompt("world")) },
        )
        .await
        .expect("tracked call");

    let second = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/hello.py"),
            json!([first.results.clone()]),
            vec![first.invocation_id.clone()],
            || async { Ok(prompt("again")) },
        )
        .await
        .expect("tracked call");

    let store = tracker.store();
    let store = store.lock().await;
    let (invocation, _) = store.get_invocation(&second.invocation_id).unwrap();
    assert_eq!(invocation.consumes, vec![first.invocation_id]);
}

#[tokio::test]
async fn store_updates_signal_after_each_durable_write() {
    let (tracker, _dir) = tracker_with(hello_resolver(), Arc::new(NoopCapture));
    let mut updates = tracker.subscribe();

    let response = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/hello.py"),
            json!(["world"]),
            vec![],
            || async { Ok(prompt("world")) },
        )
        .await
        .expect("tracked call");

    let expected_lmp = LmpId::derive(
        "def hello(name):\n    return f\"say hi to {name}\"",
        "",
        "lmp.hello",
    );
    match updates.try_recv().unwrap() {
        StoreUpdate::DefinitionWritten(lmp_id) => assert_eq!(lmp_id, expected_lmp),
        other => panic!("expected DefinitionWritten, got {other:?}"),
    }
    match updates.try_recv().unwrap() {
        StoreUpdate::InvocationWritten(id) => assert_eq!(id, response.invocation_id),
        other => panic!("expected InvocationWritten, got {other:?}"),
    }
}

#[tokio::test]
async fn three_level_chain_records_used_by_per_level() {
    let resolver = hello_resolver()
        .with(
            location("lmp/parent.py"),
            "lmp.parent",
            "def parent(x):\n    return hello(x)",
        )
        .with(
            location("lmp/root.py"),
            "lmp.root",
            "def root(x):\n    return parent(x)",
        );
    let (tracker, _dir) = tracker_with(resolver, Arc::new(NoopCapture));

    let mid = tracker.clone();
    let leaf = tracker.clone();
    let root_response = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/root.py"),
            json!(["x"]),
            vec![],
            move || async move {
                mid.invoke(
                    &EchoProvider,
                    &location("lmp/parent.py"),
                    json!(["x"]),
                    vec![],
                    move || async move {
                        leaf.invoke(
                            &EchoProvider,
                            &location("lmp/hello.py"),
                            json!(["x"]),
                            vec![],
                            || async { Ok(prompt("leaf")) },
                        )
                        .await?;
                        Ok(prompt("mid"))
                    },
                )
                .await?;
                Ok(prompt("root"))
            },
        )
        .await
        .expect("tracked call");

    let store = tracker.store();
    let store = store.lock().await;

    let mid_lmp = &store.get_versions("lmp.parent").unwrap()[0].lmp_id;
    let mid_invocations = store.invocations_for(mid_lmp).unwrap();
    assert_eq!(mid_invocations.len(), 1);
    assert_eq!(
        mid_invocations[0].used_by_id,
        Some(root_response.invocation_id.clone())
    );

    let leaf_lmp = &store.get_versions("lmp.hello").unwrap()[0].lmp_id;
    let leaf_invocations = store.invocations_for(leaf_lmp).unwrap();
    assert_eq!(leaf_invocations.len(), 1);
    assert_eq!(
        leaf_invocations[0].used_by_id,
        Some(mid_invocations[0].id.clone())
    );

    let (root_invocation, _) = store.get_invocation(&root_response.invocation_id).unwrap();
    assert_eq!(root_invocation.used_by_id, None);
}

#[tokio::test]
async fn configured_capture_timeout_bounds_the_wait() {
    let dir = TempDir::new().expect("temp dir");
    let mut config = TrackerConfig::new(
        dir.path().join("trace.db").display().to_string(),
        dir.path().join("blobs"),
    );
    config.capture_timeout = Duration::from_millis(50);
    let tracker = Tracker::new(
        &config,
        Arc::new(hello_resolver()),
        Arc::new(InspectorCapture::new(StallingFactory)),
    )
    .expect("open tracker");

    let started = Instant::now();
    let response = tracker
        .invoke(
            &EchoProvider,
            &location("lmp/hello.py"),
            json!(["world"]),
            vec![],
            || async { Ok(prompt("world")) },
        )
        .await
        .expect("a stalled capture must not fail the call");
    assert!(started.elapsed() < DEFAULT_PAUSE_TIMEOUT);

    let store = tracker.store();
    let store = store.lock().await;
    let (_, contents) = store.get_invocation(&response.invocation_id).unwrap();
    assert!(contents.global_vars.is_empty());
    assert!(contents.free_vars.is_empty());
}

#[tokio::test]
async fn definition_noop_rewrite_signals_nothing() {
    let dir = TempDir::new().expect("temp dir");
    let config = TrackerConfig::new(
        dir.path().join("trace.db").display().to_string(),
        dir.path().join("blobs"),
    );

    let first = Tracker::new(&config, Arc::new(hello_resolver()), Arc::new(NoopCapture))
        .expect("open tracker");
    first
        .invoke(
            &EchoProvider,
            &location("lmp/hello.py"),
            json!(["world"]),
            vec![],
            || async { Ok(prompt("world")) },
        )
        .await
        .expect("tracked call");
    drop(first);

    // A fresh tracker over the same database re-writes the definition as
    // a no-op; only the invocation write is durable and signaled.
    let second = Tracker::new(&config, Arc::new(hello_resolver()), Arc::new(NoopCapture))
        .expect("open tracker");
    let mut updates = second.subscribe();
    let response = second
        .invoke(
            &EchoProvider,
            &location("lmp/hello.py"),
            json!(["again"]),
            vec![],
            || async { Ok(prompt("again")) },
        )
        .await
        .expect("tracked call");

    match updates.try_recv().unwrap() {
        StoreUpdate::InvocationWritten(id) => assert_eq!(id, response.invocation_id),
        other => panic!("expected InvocationWritten, got {other:?}"),
    }
    assert!(updates.try_recv().is_err());

    let store = second.store();
    let store = store.lock().await;
    assert_eq!(store.get_versions("lmp.hello").unwrap().len(), 1);
}

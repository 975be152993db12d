//! Runtime state capture: snapshotting free and local variables while an
//! LMP body runs.
//!
//! Capture is strictly best-effort observability. Every step may fail
//! independently; failures log and degrade to an empty variable map, and
//! the wrapped body's result never depends on capture success.
//!
//! The debugger-protocol machinery is inherently specific to the host
//! execution environment, so it hides behind two seams: the
//! [`RuntimeStateCapture`] capability the tracker consumes, and the
//! [`InspectorSession`] capability an embedder injects to speak the host's
//! actual inspection protocol. [`NoopCapture`] keeps the rest of the
//! system functional (degraded) where no inspector exists.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use lmtrace_core::model::{CapturedState, CapturedValue, SourceLocation};

/// Default wait for the armed breakpoint to fire before the capture is
/// abandoned. A body that never reaches the instrumented location must
/// not hang its invocation.
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an abandoned watcher gets to tear its session down before it
/// is aborted outright.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Errors from the inspection machinery. These never propagate past the
/// capture boundary; they are logged and capture degrades to empty.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The inspector session reported a protocol or transport failure.
    #[error("inspector session error: {0}")]
    Session(String),

    /// No legal pause location exists inside the LMP's line range.
    #[error("no legal pause location in range")]
    NoPauseLocation,
}

/// How the host tags a legal pause location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakKind {
    Statement,
    Call,
    /// A function return point -- the best place to observe final state.
    Return,
}

/// A legal pause location reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakCandidate {
    pub line: u32,
    pub column: u32,
    pub kind: BreakKind,
}

/// Host-assigned breakpoint handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointId(pub String);

/// Scope classification in the paused frame's scope chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Closure,
    Local,
    Other,
}

/// A scope in the paused frame, resolvable to its variables.
#[derive(Debug, Clone)]
pub struct ScopeHandle {
    pub kind: ScopeKind,
    /// Host-side object reference for fetching properties.
    pub object_id: String,
}

/// A pause notification from the host.
#[derive(Debug, Clone)]
pub struct PauseEvent {
    /// Breakpoints this pause actually hit; empty for unrelated pauses.
    pub hit_breakpoints: Vec<BreakpointId>,
    /// Scope chain of the paused frame, innermost first.
    pub scopes: Vec<ScopeHandle>,
}

/// One debugger/inspection session against the running host.
///
/// Only one pause/resume handshake is safely in flight per session, so
/// each capture opens its own.
#[async_trait]
pub trait InspectorSession: Send {
    /// Maps a declared source range onto the actually-executing (possibly
    /// transformed) code via the host's debug-mapping information.
    async fn resolve_range(
        &mut self,
        declared: &SourceLocation,
    ) -> Result<SourceLocation, CaptureError>;

    /// Legal pause locations within the range, in source order.
    async fn possible_breakpoints(
        &mut self,
        range: &SourceLocation,
    ) -> Result<Vec<BreakCandidate>, CaptureError>;

    async fn set_breakpoint(
        &mut self,
        candidate: &BreakCandidate,
    ) -> Result<BreakpointId, CaptureError>;

    async fn remove_breakpoint(&mut self, id: &BreakpointId) -> Result<(), CaptureError>;

    /// The next pause event from the host. Pends until one arrives.
    async fn next_pause(&mut self) -> Result<PauseEvent, CaptureError>;

    async fn resume(&mut self) -> Result<(), CaptureError>;

    /// Fetches a scope's properties as a flat name -> value map.
    async fn scope_variables(
        &mut self,
        scope: &ScopeHandle,
    ) -> Result<IndexMap<String, CapturedValue>, CaptureError>;

    async fn close(&mut self) -> Result<(), CaptureError>;
}

/// Opens fresh [`InspectorSession`]s; one per capture.
#[async_trait]
pub trait InspectorSessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn InspectorSession>, CaptureError>;
}

/// The capture capability the tracker consumes.
#[async_trait]
pub trait RuntimeStateCapture: Send + Sync {
    /// Arms a capture window over `range`. The window observes the body
    /// while it runs; [`CaptureWindow::finish`] yields whatever state was
    /// captured, completing exactly once. `pause_timeout` bounds how long
    /// the window waits for its breakpoint to fire.
    async fn begin(
        &self,
        range: &SourceLocation,
        pause_timeout: Duration,
    ) -> Box<dyn CaptureWindow>;
}

/// An armed capture awaiting its breakpoint hit.
#[async_trait]
pub trait CaptureWindow: Send {
    /// Completes the window: captured state on a hit, empty state if the
    /// capture was abandoned for any reason. Tears the session down in
    /// all paths.
    async fn finish(self: Box<Self>) -> CapturedState;
}

/// Stub capability returning an empty map; the rest of the system must
/// function correctly (degraded) against it.
pub struct NoopCapture;

#[async_trait]
impl RuntimeStateCapture for NoopCapture {
    async fn begin(
        &self,
        _range: &SourceLocation,
        _pause_timeout: Duration,
    ) -> Box<dyn CaptureWindow> {
        Box::new(EmptyWindow)
    }
}

struct EmptyWindow;

#[async_trait]
impl CaptureWindow for EmptyWindow {
    async fn finish(self: Box<Self>) -> CapturedState {
        CapturedState::default()
    }
}

/// Picks the pause location best suited to observing final closure state.
///
/// Prefers the last return-tagged candidate. When the last candidate in
/// range is not return-tagged but its immediate predecessor is, the
/// predecessor wins: some hosts synthesize an end-of-function location
/// after the real return that crashes or hangs the process when paused on.
fn pick_pause_location(candidates: &[BreakCandidate]) -> Option<&BreakCandidate> {
    if candidates.is_empty() {
        return None;
    }
    let mut idx = candidates.len() - 1;
    if candidates[idx].kind != BreakKind::Return
        && idx > 0
        && candidates[idx - 1].kind == BreakKind::Return
    {
        idx -= 1;
    }
    if candidates[idx].kind != BreakKind::Return {
        if let Some(ret) = candidates.iter().rposition(|c| c.kind == BreakKind::Return) {
            idx = ret;
        }
    }
    Some(&candidates[idx])
}

/// Debugger-protocol-driven capture over an injected session transport.
pub struct InspectorCapture<F> {
    factory: F,
}

impl<F: InspectorSessionFactory> InspectorCapture<F> {
    pub fn new(factory: F) -> Self {
        InspectorCapture { factory }
    }

    async fn arm(
        &self,
        declared: &SourceLocation,
        pause_timeout: Duration,
    ) -> Result<ArmedWindow, CaptureError> {
        let mut session = self.factory.open().await?;

        let armed = async {
            let range = session.resolve_range(declared).await?;
            let candidates = session.possible_breakpoints(&range).await?;
            let chosen = pick_pause_location(&candidates)
                .ok_or(CaptureError::NoPauseLocation)?
                .clone();
            session.set_breakpoint(&chosen).await
        }
        .await;

        let breakpoint = match armed {
            Ok(breakpoint) => breakpoint,
            Err(e) => {
                // Session opened but never armed: close it before bailing.
                if let Err(close_err) = session.close().await {
                    tracing::warn!(error = %close_err, "failed to close inspector session");
                }
                return Err(e);
            }
        };

        let (state_tx, state_rx) = oneshot::channel();
        let (abandon_tx, abandon_rx) = oneshot::channel();
        let handle = tokio::spawn(observe(session, breakpoint, abandon_rx, state_tx));

        Ok(ArmedWindow {
            state_rx,
            abandon_tx,
            handle,
            pause_timeout,
        })
    }
}

#[async_trait]
impl<F: InspectorSessionFactory> RuntimeStateCapture for InspectorCapture<F> {
    async fn begin(
        &self,
        range: &SourceLocation,
        pause_timeout: Duration,
    ) -> Box<dyn CaptureWindow> {
        match self.arm(range, pause_timeout).await {
            Ok(window) => Box::new(window),
            Err(e) => {
                tracing::warn!(error = %e, file = %range.file, "state capture unavailable, continuing without it");
                Box::new(EmptyWindow)
            }
        }
    }
}

/// Watches pause events until the armed breakpoint fires, the session
/// fails, or the window is abandoned. Owns the session; tears it down
/// (breakpoint removed, host resumed, session closed) in every path, and
/// resolves the completion channel exactly once.
async fn observe(
    mut session: Box<dyn InspectorSession>,
    breakpoint: BreakpointId,
    mut abandon: oneshot::Receiver<()>,
    state_tx: oneshot::Sender<CapturedState>,
) {
    let mut state = CapturedState::default();
    loop {
        tokio::select! {
            _ = &mut abandon => break,
            event = session.next_pause() => match event {
                Ok(event) if event.hit_breakpoints.contains(&breakpoint) => {
                    for scope in &event.scopes {
                        // Non-variable scopes (with/block/catch) are
                        // skipped outright, never fetched.
                        let bucket = match scope.kind {
                            ScopeKind::Global => &mut state.globals,
                            ScopeKind::Closure | ScopeKind::Local => &mut state.frees,
                            ScopeKind::Other => continue,
                        };
                        match session.scope_variables(scope).await {
                            Ok(vars) => bucket.extend(vars),
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to read scope variables")
                            }
                        }
                    }
                    break;
                }
                // A pause unrelated to our breakpoint: resume and keep
                // waiting for ours.
                Ok(_) => {
                    if let Err(e) = session.resume().await {
                        tracing::warn!(error = %e, "failed to resume after unrelated pause");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "inspector session failed while awaiting pause");
                    break;
                }
            }
        }
    }

    if let Err(e) = session.remove_breakpoint(&breakpoint).await {
        tracing::warn!(error = %e, "failed to remove breakpoint");
    }
    if let Err(e) = session.resume().await {
        tracing::warn!(error = %e, "failed to resume host after capture");
    }
    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "failed to close inspector session");
    }

    let _ = state_tx.send(state);
}

struct ArmedWindow {
    state_rx: oneshot::Receiver<CapturedState>,
    abandon_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    pause_timeout: Duration,
}

#[async_trait]
impl CaptureWindow for ArmedWindow {
    async fn finish(self: Box<Self>) -> CapturedState {
        let ArmedWindow {
            mut state_rx,
            abandon_tx,
            handle,
            pause_timeout,
        } = *self;

        match tokio::time::timeout(pause_timeout, &mut state_rx).await {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => CapturedState::default(),
            Err(_) => {
                tracing::warn!("capture window timed out waiting for breakpoint hit");
                let _ = abandon_tx.send(());
                match tokio::time::timeout(TEARDOWN_GRACE, state_rx).await {
                    Ok(Ok(state)) => state,
                    _ => {
                        handle.abort();
                        CapturedState::default()
                    }
                }
            }
        }
    }
}

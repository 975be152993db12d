//! Asynchronously-propagated invocation context.
//!
//! A task-local stack of invocation frames threads the "currently open
//! invocation" through arbitrarily deep, possibly concurrent, nested
//! calls. Frames are immutable `Arc` links, so concurrent children each
//! extend their own chain without sharing mutable state; popping is
//! scope-based and therefore happens regardless of outcome, including
//! cancellation.

use std::future::Future;
use std::sync::Arc;

use lmtrace_core::id::InvocationId;

#[derive(Debug)]
struct Frame {
    id: InvocationId,
    parent: Option<Arc<Frame>>,
}

tokio::task_local! {
    static CURRENT: Option<Arc<Frame>>;
}

/// Runs `fut` with `id` as the innermost open invocation.
///
/// Everything `fut` transitively awaits sees `id` via
/// [`current_invocation`]; the frame pops when `fut` completes, whatever
/// the outcome.
pub async fn with_invocation<F: Future>(id: InvocationId, fut: F) -> F::Output {
    let frame = Arc::new(Frame {
        id,
        parent: current_frame(),
    });
    CURRENT.scope(Some(frame), fut).await
}

fn current_frame() -> Option<Arc<Frame>> {
    CURRENT.try_with(Clone::clone).ok().flatten()
}

/// The innermost open invocation, if any.
pub fn current_invocation() -> Option<InvocationId> {
    current_frame().map(|f| f.id.clone())
}

/// The invocation that opened the frame above the current one, if any.
pub fn parent_invocation() -> Option<InvocationId> {
    current_frame().and_then(|f| f.parent.as_ref().map(|p| p.id.clone()))
}

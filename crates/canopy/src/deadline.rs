//! Deadline and timeout contexts
//!
//! A deadline node is a cancelable node plus a one-shot timer task. The
//! timer cancels the node with [`ContextError::DeadlineExceeded`] unless the
//! node settles first; releasing the node aborts the timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cancel::{spawn_propagation, CancelHandle, CancelState};
use crate::context::{Context, ContextId, Kind};
use crate::error::ContextError;

/// Upper bound used when `now + timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Derive a child of `parent` that is canceled at `deadline`
///
/// A deadline that has already passed cancels the child before this
/// function returns.
///
/// # Panics
///
/// Must be called from within a tokio runtime.
pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelHandle) {
    let id = ContextId::new();
    let state = Arc::new(CancelState::new(id));
    let ctx = Context::derive(
        parent,
        id,
        Kind::Deadline {
            state: state.clone(),
            deadline,
        },
    );
    spawn_propagation(parent.clone(), state.clone());

    let handle = CancelHandle::new(state.clone());
    if deadline <= Instant::now() {
        debug!("Deadline for {} already passed", id);
        state.cancel(ContextError::DeadlineExceeded, None);
        return (ctx, handle);
    }

    let timer = arm_timer(state, deadline);
    (ctx, handle.with_timer(timer))
}

/// Derive a child of `parent` that is canceled after `timeout`
///
/// # Panics
///
/// Must be called from within a tokio runtime.
pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelHandle) {
    let now = Instant::now();
    let deadline = now
        .checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE);
    with_deadline(parent, deadline)
}

fn arm_timer(state: Arc<CancelState>, deadline: Instant) -> AbortHandle {
    let own_done = state.done();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if state.cancel(ContextError::DeadlineExceeded, None) {
                    debug!("Deadline exceeded for {}", state.id());
                }
            }
            // Settled by its parent or its handle: nothing left to time
            _ = own_done.wait() => {
                trace!("Timer for {} disarmed", state.id());
            }
        }
    })
    .abort_handle()
}

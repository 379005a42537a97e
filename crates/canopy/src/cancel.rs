//! Cancelable contexts
//!
//! Every cancelable node owns a [`CancelState`]: a done signal plus a
//! mutex-guarded terminal slot that is written at most once. Deriving a
//! node spawns one propagation task that waits on the parent's done signal
//! and the node's own, and copies the parent's reason down if the parent
//! settles first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::after::AfterFuncHandle;
use crate::context::{Context, ContextId, Kind};
use crate::error::{Cause, ContextError};
use crate::signal::{Done, Signal};

/// Settled state of a node: the reason and its cause
#[derive(Clone)]
pub(crate) struct Terminal {
    pub(crate) err: ContextError,
    pub(crate) cause: Cause,
}

pub(crate) struct CancelState {
    id: ContextId,
    signal: Signal,
    terminal: Mutex<Option<Terminal>>,
}

impl CancelState {
    pub(crate) fn new(id: ContextId) -> Self {
        Self {
            id,
            signal: Signal::new(),
            terminal: Mutex::new(None),
        }
    }

    /// Move the node from active to canceled. First writer wins.
    ///
    /// The terminal slot is written before the signal fires, so anyone
    /// released by `done()` observes the reason. Returns `true` if this call
    /// performed the transition.
    pub(crate) fn cancel(&self, err: ContextError, cause: Option<Cause>) -> bool {
        let mut slot = self.terminal.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }

        let cause = cause.unwrap_or_else(|| Arc::new(err) as Cause);
        *slot = Some(Terminal { err, cause });
        self.signal.fire();
        drop(slot);

        debug!("Canceled {}: {}", self.id, err);
        true
    }

    pub(crate) fn terminal(&self) -> Option<Terminal> {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn err(&self) -> Option<ContextError> {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|terminal| terminal.err)
    }

    pub(crate) fn done(&self) -> Done {
        self.signal.subscribe()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.signal.is_fired()
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }
}

static LIVE_PROPAGATION_TASKS: AtomicUsize = AtomicUsize::new(0);

/// Number of propagation tasks currently alive in this process
///
/// Every derived cancelable or deadline context owns one until it (or an
/// ancestor) is canceled.
pub fn live_propagation_tasks() -> usize {
    LIVE_PROPAGATION_TASKS.load(Ordering::Acquire)
}

/// Keeps the live-task counter in step with the task future's lifetime,
/// including futures dropped unpolled at runtime shutdown
struct TaskCount;

impl TaskCount {
    fn enter() -> Self {
        LIVE_PROPAGATION_TASKS.fetch_add(1, Ordering::AcqRel);
        Self
    }
}

impl Drop for TaskCount {
    fn drop(&mut self) {
        LIVE_PROPAGATION_TASKS.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Link `state` to its parent: cancel it with the parent's reason if the
/// parent settles first, exit quietly if the node settles first
pub(crate) fn spawn_propagation(parent: Context, state: Arc<CancelState>) {
    let count = TaskCount::enter();
    let parent_done = parent.done();
    let own_done = state.done();

    tokio::spawn(async move {
        let _count = count;

        tokio::select! {
            _ = parent_done.wait() => {
                if let Some(Terminal { err, cause }) = parent.terminal() {
                    if state.cancel(err, Some(cause)) {
                        debug!("Propagated {} from {} to {}", err, parent.id(), state.id());
                    }
                }
            }
            _ = own_done.wait() => {}
        }

        trace!("Propagation task for {} exited", state.id());
    });
}

/// Release function for a derived context
///
/// Cheap to clone; every clone cancels the same node. Canceling is
/// idempotent and never blocks.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
    timer: Option<AbortHandle>,
    watcher: Option<AfterFuncHandle>,
}

impl CancelHandle {
    pub(crate) fn new(state: Arc<CancelState>) -> Self {
        Self {
            state,
            timer: None,
            watcher: None,
        }
    }

    pub(crate) fn with_timer(mut self, timer: AbortHandle) -> Self {
        self.timer = Some(timer);
        self
    }

    pub(crate) fn with_watcher(mut self, watcher: AfterFuncHandle) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Cancel the context with [`ContextError::Canceled`]
    ///
    /// Also disarms the deadline timer, if any. A no-op once the context is
    /// settled.
    pub fn cancel(&self) {
        self.cancel_with(ContextError::Canceled, None);
    }

    pub(crate) fn cancel_with(&self, err: ContextError, cause: Option<Cause>) {
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        self.state.cancel(err, cause);
    }

    /// Id of the context this handle releases
    pub fn context_id(&self) -> ContextId {
        self.state.id()
    }

    /// Whether the context this handle releases has settled, by any path
    pub fn is_canceled(&self) -> bool {
        self.state.is_done()
    }

    /// Convert into a guard that cancels when dropped
    pub fn drop_guard(self) -> CancelGuard {
        CancelGuard {
            handle: self,
            armed: true,
        }
    }
}

/// Cancels its context when dropped, on every exit path
#[must_use = "dropping the guard cancels the context immediately"]
pub struct CancelGuard {
    handle: CancelHandle,
    armed: bool,
}

impl CancelGuard {
    /// Keep the context alive past the guard's scope
    pub fn disarm(mut self) -> CancelHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.handle.cancel();
        }
    }
}

/// Release function that records a caller-supplied cause
///
/// [`Context::err`] still reports [`ContextError::Canceled`];
/// [`Context::cause`] reports the supplied error.
#[derive(Clone)]
pub struct CancelCauseHandle {
    handle: CancelHandle,
}

impl CancelCauseHandle {
    /// Cancel with `cause` as the underlying reason
    pub fn cancel<E>(&self, cause: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cancel_cause(Some(Arc::new(cause)));
    }

    /// Cancel with an already shared cause; `None` records `Canceled`
    pub fn cancel_cause(&self, cause: Option<Cause>) {
        self.handle.cancel_with(ContextError::Canceled, cause);
    }

    pub fn into_handle(self) -> CancelHandle {
        self.handle
    }

    pub(crate) fn with_watcher(self, watcher: AfterFuncHandle) -> Self {
        Self {
            handle: self.handle.with_watcher(watcher),
        }
    }
}

/// Derive a cancelable child of `parent`
///
/// The child is canceled when the returned handle is invoked or when
/// `parent` is canceled, whichever happens first. Always release the
/// handle (or hold its [`CancelGuard`]) once the work is finished:
/// otherwise the propagation task stays parked until `parent` settles.
///
/// # Panics
///
/// Must be called from within a tokio runtime.
pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
    let id = ContextId::new();
    let state = Arc::new(CancelState::new(id));
    let ctx = Context::derive(parent, id, Kind::Cancel(state.clone()));
    spawn_propagation(parent.clone(), state.clone());
    (ctx, CancelHandle::new(state))
}

/// Like [`with_cancel`], but the handle can record an arbitrary cause
///
/// # Panics
///
/// Must be called from within a tokio runtime.
pub fn with_cancel_cause(parent: &Context) -> (Context, CancelCauseHandle) {
    let (ctx, handle) = with_cancel(parent);
    (ctx, CancelCauseHandle { handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("shutting down")]
    struct Shutdown;

    #[test]
    fn test_first_writer_wins() {
        let state = CancelState::new(ContextId::new());
        assert!(state.err().is_none());

        assert!(state.cancel(ContextError::DeadlineExceeded, None));
        assert!(!state.cancel(ContextError::Canceled, None));
        assert_eq!(state.err(), Some(ContextError::DeadlineExceeded));
        assert!(state.is_done());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (ctx, cancel) = with_cancel(&Context::background());
        assert_eq!(ctx.err(), None);
        assert!(!ctx.is_done());

        for _ in 0..5 {
            cancel.cancel();
        }
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
        assert!(ctx.is_done());
        assert!(cancel.is_canceled());

        cancel.cancel();
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_done_wakes_waiter() {
        let (ctx, cancel) = with_cancel(&Context::background());
        let done = ctx.done();
        let waiter = tokio::spawn(async move {
            done.wait().await;
            ctx.err()
        });

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("waiter task ok");
        assert_eq!(err, Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_select_on_temporary_done() {
        let (ctx, cancel) = with_cancel(&Context::background());
        assert_eq!(cancel.context_id(), ctx.id());

        let observed = tokio::select! {
            _ = ctx.done().wait() => true,
            _ = tokio::time::sleep(Duration::from_millis(10)) => false,
        };
        assert!(!observed);

        cancel.cancel();
        let observed = tokio::select! {
            _ = ctx.done().wait() => true,
            _ = tokio::time::sleep(Duration::from_secs(1)) => false,
        };
        assert!(observed);
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_guard_cancels_on_drop() {
        let (ctx, cancel) = with_cancel(&Context::background());
        {
            let _guard = cancel.drop_guard();
            assert!(!ctx.is_done());
        }
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_context_active() {
        let (ctx, cancel) = with_cancel(&Context::background());
        let handle = cancel.drop_guard().disarm();
        assert!(!ctx.is_done());

        handle.cancel();
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_cancel_cause_recorded() {
        let (ctx, cancel) = with_cancel_cause(&Context::background());
        cancel.cancel(Shutdown);

        assert_eq!(ctx.err(), Some(ContextError::Canceled));
        let cause = ctx.cause().expect("cause set");
        assert_eq!(cause.to_string(), "shutting down");
        assert!(cause.downcast_ref::<Shutdown>().is_some());
    }

    #[tokio::test]
    async fn test_cancel_without_cause_defaults_to_err() {
        let (ctx, cancel) = with_cancel_cause(&Context::background());
        cancel.cancel_cause(None);

        let cause = ctx.cause().expect("cause set");
        assert_eq!(
            cause.downcast_ref::<ContextError>(),
            Some(&ContextError::Canceled)
        );
    }

    #[tokio::test]
    async fn test_display_chain() {
        let (ctx, _cancel) = with_cancel(&Context::background());
        let ctx = ctx.with_value("k", 1_u8).unwrap();
        assert_eq!(ctx.to_string(), "Background.WithCancel.WithValue(\"k\")");
    }
}

//! Callbacks on cancellation and merged cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::AbortHandle;
use tracing::trace;

use crate::cancel::{with_cancel_cause, CancelHandle};
use crate::context::Context;

/// Handle to a callback registered with [`Context::after_func`]
#[derive(Clone)]
pub struct AfterFuncHandle {
    claimed: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl AfterFuncHandle {
    /// Prevent the callback from running
    ///
    /// Returns `true` if this call stopped it; `false` if the callback
    /// already started or was stopped earlier.
    pub fn stop(&self) -> bool {
        let stopped = !self.claimed.swap(true, Ordering::AcqRel);
        if let Some(task) = &self.task {
            task.abort();
        }
        stopped
    }
}

impl Context {
    /// Run `f` on its own task once this context is done
    ///
    /// `f` runs at most once. On a root context it never runs and no task
    /// is spawned.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime unless the context is a
    /// root (or only has value nodes above it).
    pub fn after_func<F>(&self, f: F) -> AfterFuncHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let claimed = Arc::new(AtomicBool::new(false));
        let done = self.done();
        if !done.can_fire() {
            return AfterFuncHandle {
                claimed,
                task: None,
            };
        }

        let flag = claimed.clone();
        let id = self.id();
        let task = tokio::spawn(async move {
            done.wait().await;
            if !flag.swap(true, Ordering::AcqRel) {
                trace!("Running after-func for {}", id);
                f();
            }
        })
        .abort_handle();

        AfterFuncHandle {
            claimed,
            task: Some(task),
        }
    }
}

/// Derive a child of `ctx` that is also canceled when `cancel_ctx` is done
///
/// The child keeps `ctx`'s values and deadline. If `cancel_ctx` settles
/// first, the child takes over its cause. Releasing the handle stops
/// watching `cancel_ctx` and cancels the child.
///
/// # Panics
///
/// Must be called from within a tokio runtime.
pub fn merge_cancel(ctx: &Context, cancel_ctx: &Context) -> (Context, CancelHandle) {
    let (merged, cancel) = with_cancel_cause(ctx);

    let watched = cancel_ctx.clone();
    let on_done = cancel.clone();
    let watcher = cancel_ctx.after_func(move || on_done.cancel_cause(watched.cause()));

    (merged, cancel.with_watcher(watcher).into_handle())
}

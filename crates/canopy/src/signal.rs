//! Broadcast-once done signal
//!
//! A [`Signal`] is owned by a cancelable node and fires at most once.
//! Observers hold [`Done`] handles, which can be cloned and awaited any
//! number of times; a handle taken after the signal fired resolves
//! immediately.

use std::future::Future;

use tokio::sync::watch;

/// Writer side of a done signal, owned by exactly one node
#[derive(Debug)]
pub(crate) struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub(crate) fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> Done {
        Done {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Wait-able handle that resolves once a context is canceled
///
/// Returned by [`Context::done`](crate::Context::done). The handle of a
/// root context never resolves.
#[derive(Debug, Clone, Default)]
pub struct Done {
    rx: Option<watch::Receiver<bool>>,
}

impl Done {
    /// A handle that never fires
    pub(crate) fn never() -> Self {
        Self { rx: None }
    }

    /// Whether the signal has already fired
    pub fn is_fired(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Whether this handle can ever fire (false for root contexts)
    pub fn can_fire(&self) -> bool {
        self.rx.is_some()
    }

    /// Wait until the signal fires
    ///
    /// The returned future owns its own receiver, so it can be built from a
    /// temporary (`ctx.done().wait()`) and dropped at any point.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let rx = self.rx.clone();

        async move {
            let Some(mut rx) = rx else {
                return std::future::pending().await;
            };

            let fired = rx.wait_for(|fired| *fired).await.is_ok();
            if !fired {
                // Writer dropped without firing: nothing can cancel this node anymore
                std::future::pending::<()>().await;
            }
        }
    }
}

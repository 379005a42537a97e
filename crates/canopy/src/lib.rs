//! # canopy
//!
//! Hierarchical cancellation, deadlines and request-scoped values for tokio.
//!
//! A [`Context`] is a node in a tree. Deriving a child with
//! [`with_cancel`], [`with_deadline`] or [`with_timeout`] returns the child
//! and a [`CancelHandle`]; canceling a node cancels its whole subtree and
//! nothing else. [`with_value`] attaches an immutable key/value pair that
//! descendants can look up.
//!
//! ## Guarantees
//!
//! - A node settles exactly once; the first reason written wins
//! - [`Context::err`] is set before [`Context::done`] fires
//! - Cancellation flows down the tree, lookups flow up, neither flows sideways
//! - The primitive is advisory: work in progress is never interrupted
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use canopy::{Context, ContextError};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> canopy::Result<()> {
//! let ctx = Context::background().with_value("request_id", 42_u64)?;
//! let (ctx, cancel) = ctx.with_timeout(Duration::from_secs(2));
//! let _guard = cancel.drop_guard();
//!
//! tokio::select! {
//!     _ = ctx.done().wait() => {
//!         assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
//!     }
//!     _ = tokio::time::sleep(Duration::from_millis(10)) => {
//!         assert_eq!(ctx.value::<u64>("request_id"), Some(&42));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod after;
mod cancel;
pub mod config;
mod context;
mod deadline;
mod error;
mod key;
mod signal;

pub use after::{merge_cancel, AfterFuncHandle};
pub use cancel::{
    live_propagation_tasks, with_cancel, with_cancel_cause, CancelCauseHandle, CancelGuard,
    CancelHandle,
};
pub use config::TimeoutConfig;
pub use context::{with_value, Context, ContextId};
pub use deadline::{with_deadline, with_timeout};
pub use error::{CanopyError, Cause, ContextError, Result};
pub use key::Key;
pub use signal::Done;

/// The top-level root context
pub fn background() -> Context {
    Context::background()
}

/// Placeholder root for call sites that have no context yet
pub fn todo() -> Context {
    Context::todo()
}

//! The context tree
//!
//! A [`Context`] is a cheap, cloneable handle to one immutable node. Nodes
//! only point at their parent, so cancellation state is found by walking
//! up to the nearest cancelable ancestor and value lookups walk up to the
//! nearest node holding a matching key.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use crate::cancel::{self, CancelCauseHandle, CancelHandle, CancelState, Terminal};
use crate::config::TimeoutConfig;
use crate::deadline;
use crate::error::{Cause, ContextError};
use crate::key::Key;
use crate::signal::Done;
use crate::Result;

/// Unique identifier of a context node, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", &self.0.to_string()[..8])
    }
}

/// Which root a chain hangs off. Both behave identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RootKind {
    Background,
    Todo,
}

pub(crate) enum Kind {
    Root(RootKind),
    Value {
        key: Key,
        value: Arc<dyn Any + Send + Sync>,
    },
    Cancel(Arc<CancelState>),
    Deadline {
        state: Arc<CancelState>,
        deadline: Instant,
    },
}

pub(crate) struct Node {
    id: ContextId,
    parent: Option<Context>,
    kind: Kind,
}

impl Drop for Node {
    // Unlink ancestors one at a time so dropping a deep chain uses constant stack
    fn drop(&mut self) {
        let mut parent = self.parent.take();
        while let Some(ctx) = parent {
            parent = Arc::into_inner(ctx.node).and_then(|mut node| node.parent.take());
        }
    }
}

/// Handle to a node in the cancellation and value tree
///
/// Cloning is cheap and every clone observes the same node.
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

static BACKGROUND: OnceLock<Context> = OnceLock::new();
static TODO: OnceLock<Context> = OnceLock::new();

impl Context {
    fn root(kind: RootKind) -> Self {
        Self {
            node: Arc::new(Node {
                id: ContextId::new(),
                parent: None,
                kind: Kind::Root(kind),
            }),
        }
    }

    /// The top-level root: never canceled, no deadline, no values
    pub fn background() -> Self {
        BACKGROUND
            .get_or_init(|| Self::root(RootKind::Background))
            .clone()
    }

    /// Placeholder root for code that has not yet been given a context
    pub fn todo() -> Self {
        TODO.get_or_init(|| Self::root(RootKind::Todo)).clone()
    }

    pub(crate) fn derive(parent: &Context, id: ContextId, kind: Kind) -> Self {
        let ctx = Self {
            node: Arc::new(Node {
                id,
                parent: Some(parent.clone()),
                kind,
            }),
        };
        trace!("Derived {} from {}", ctx.node.id, parent.node.id);
        ctx
    }

    pub fn id(&self) -> ContextId {
        self.node.id
    }

    pub fn parent(&self) -> Option<&Context> {
        self.node.parent.as_ref()
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        std::iter::successors(Some(self.node.as_ref()), |node| {
            node.parent.as_ref().map(|parent| parent.node.as_ref())
        })
    }

    /// Cancel state governing this context: its own, or its nearest ancestor's
    pub(crate) fn cancel_state(&self) -> Option<&Arc<CancelState>> {
        self.nodes().find_map(|node| match &node.kind {
            Kind::Cancel(state) | Kind::Deadline { state, .. } => Some(state),
            _ => None,
        })
    }

    pub(crate) fn terminal(&self) -> Option<Terminal> {
        self.cancel_state().and_then(|state| state.terminal())
    }

    /// Deadline of the nearest deadline node, if any
    ///
    /// A deadline node keeps reporting its deadline after it is canceled.
    pub fn deadline(&self) -> Option<Instant> {
        self.nodes().find_map(|node| match &node.kind {
            Kind::Deadline { deadline, .. } => Some(*deadline),
            _ => None,
        })
    }

    /// Signal that fires once this context is canceled
    pub fn done(&self) -> Done {
        self.cancel_state()
            .map_or_else(Done::never, |state| state.done())
    }

    /// Why this context was canceled, or `None` while it is active
    pub fn err(&self) -> Option<ContextError> {
        self.cancel_state().and_then(|state| state.err())
    }

    /// Underlying cause of cancellation, or `None` while active
    ///
    /// Equals the [`ContextError`] unless a cause was supplied through a
    /// [`CancelCauseHandle`] somewhere up the chain.
    pub fn cause(&self) -> Option<Cause> {
        self.terminal().map(|terminal| terminal.cause)
    }

    /// Shorthand for `self.done().is_fired()`
    pub fn is_done(&self) -> bool {
        self.cancel_state().is_some_and(|state| state.is_done())
    }

    /// Look up the value stored under `key` by the nearest matching ancestor
    pub fn value_any(
        &self,
        key: impl Into<Key>,
    ) -> Option<&(dyn Any + Send + Sync + 'static)> {
        let key = key.into();
        self.nodes().find_map(|node| match &node.kind {
            Kind::Value { key: k, value } if k.matches(&key) => Some(value.as_ref()),
            _ => None,
        })
    }

    /// Typed lookup: `None` when the key is missing or holds another type
    ///
    /// The nearest matching key shadows the rest of the chain even when its
    /// value has a different type. Keys match by type and value: `"id"` and
    /// `String::from("id")` are the same key, `1_u32` and `1_u64` are not.
    pub fn value<V: Any>(&self, key: impl Into<Key>) -> Option<&V> {
        self.value_any(key)
            .and_then(|value| value.downcast_ref::<V>())
    }

    /// Derive a child that stores one key/value pair
    pub fn with_value<V>(&self, key: impl Into<Key>, value: V) -> Result<Context>
    where
        V: Any + Send + Sync,
    {
        with_value(self, key, value)
    }

    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        cancel::with_cancel(self)
    }

    pub fn with_cancel_cause(&self) -> (Context, CancelCauseHandle) {
        cancel::with_cancel_cause(self)
    }

    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        deadline::with_deadline(self, deadline)
    }

    pub fn with_timeout(&self, timeout: std::time::Duration) -> (Context, CancelHandle) {
        deadline::with_timeout(self, timeout)
    }

    /// Derive a timeout context using the configured budget for `operation`
    pub fn with_configured_timeout(
        &self,
        config: &TimeoutConfig,
        operation: &str,
    ) -> (Context, CancelHandle) {
        deadline::with_timeout(self, config.timeout_for(operation))
    }
}

/// Derive a child context that stores one immutable key/value pair
///
/// Fails with [`CanopyError::InvalidKey`](crate::CanopyError::InvalidKey)
/// when the key is absent or does not compare equal to itself.
pub fn with_value<V>(parent: &Context, key: impl Into<Key>, value: V) -> Result<Context>
where
    V: Any + Send + Sync,
{
    let key = key.into();
    key.validate()?;

    Ok(Context::derive(
        parent,
        ContextId::new(),
        Kind::Value {
            key,
            value: Arc::new(value),
        },
    ))
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain: Vec<&Node> = self.nodes().collect();
        for (i, node) in chain.iter().rev().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match &node.kind {
                Kind::Root(RootKind::Background) => write!(f, "Background")?,
                Kind::Root(RootKind::Todo) => write!(f, "TODO")?,
                Kind::Value { key, .. } => write!(f, "WithValue({:?})", key)?,
                Kind::Cancel(_) => write!(f, "WithCancel")?,
                Kind::Deadline { deadline, .. } => write!(
                    f,
                    "WithDeadline({:?} remaining)",
                    deadline.saturating_duration_since(Instant::now())
                )?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.node.id)
            .field("chain", &self.to_string())
            .field("err", &self.err())
            .finish()
    }
}

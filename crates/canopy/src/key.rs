//! Lookup keys for value contexts

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::{CanopyError, Result};

trait DynKey: Any + Send + Sync + fmt::Debug {
    fn dyn_eq(&self, other: &dyn DynKey) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<T> DynKey for T
where
    T: PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn dyn_eq(&self, other: &dyn DynKey) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Key used to attach and look up values on a context chain
///
/// Two keys match when they hold the same concrete type and the values
/// compare equal, so a private marker type never collides with keys
/// defined elsewhere. String keys converted with `From`/`Into` are stored
/// as `String`, so a literal and an owned string address the same value;
/// [`Key::new`] keeps the exact type it is given.
///
/// ```
/// use canopy::Key;
///
/// #[derive(Debug, PartialEq)]
/// struct RequestId;
///
/// assert!(Key::new(RequestId).matches(&Key::new(RequestId)));
/// assert!(Key::from("id").matches(&Key::from(String::from("id"))));
/// assert!(!Key::new("id").matches(&Key::new(String::from("id"))));
/// ```
#[derive(Clone)]
pub struct Key {
    inner: Option<Arc<dyn DynKey>>,
}

impl Key {
    pub fn new<T>(key: T) -> Self
    where
        T: PartialEq + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            inner: Some(Arc::new(key)),
        }
    }

    /// The absent key. Never matches anything and is rejected by `with_value`.
    pub fn absent() -> Self {
        Self { inner: None }
    }

    pub fn is_absent(&self) -> bool {
        self.inner.is_none()
    }

    /// A key is comparable when it equals itself (`f64::NAN` does not)
    pub fn is_comparable(&self) -> bool {
        self.inner.as_ref().is_some_and(|key| key.dyn_eq(key.as_ref()))
    }

    /// Check whether two keys address the same value
    pub fn matches(&self, other: &Key) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => a.dyn_eq(b.as_ref()),
            _ => false,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_absent() {
            return Err(CanopyError::InvalidKey("key is absent".to_string()));
        }
        if !self.is_comparable() {
            return Err(CanopyError::InvalidKey(format!(
                "key is not comparable: {:?}",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(key) => fmt::Debug::fmt(key.as_ref(), f),
            None => write!(f, "<absent>"),
        }
    }
}

impl<T> From<Option<T>> for Key
where
    T: PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn from(key: Option<T>) -> Self {
        key.map_or_else(Self::absent, Self::new)
    }
}

macro_rules! impl_key_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Key {
                fn from(key: $ty) -> Self {
                    Self::new(key)
                }
            }
        )*
    };
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Self::new(key.to_string())
    }
}

impl From<&String> for Key {
    fn from(key: &String) -> Self {
        Self::new(key.clone())
    }
}

impl_key_from!(
    String,
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TraceKey(u8);

    #[test]
    fn test_same_type_same_value_matches() {
        assert!(Key::from("k").matches(&Key::from("k")));
        assert!(Key::new(TraceKey(1)).matches(&Key::new(TraceKey(1))));
        assert!(!Key::new(TraceKey(1)).matches(&Key::new(TraceKey(2))));
    }

    #[test]
    fn test_different_types_never_match() {
        assert!(!Key::from(1_i32).matches(&Key::from(1_i64)));
        assert!(!Key::new("k").matches(&Key::new("k".to_string())));
    }

    #[test]
    fn test_string_forms_match() {
        let owned = String::from("k");
        assert!(Key::from("k").matches(&Key::from(owned.clone())));
        assert!(Key::from(&owned).matches(&Key::from("k")));
        assert!(!Key::from("k").matches(&Key::from("K")));
    }

    #[test]
    fn test_absent_key() {
        let key = Key::absent();
        assert!(key.is_absent());
        assert!(!key.is_comparable());
        assert!(!key.matches(&Key::absent()));
        assert!(Key::from(None::<&str>).is_absent());
        assert!(matches!(key.validate(), Err(CanopyError::InvalidKey(_))));
    }

    #[test]
    fn test_nan_is_not_comparable() {
        let key = Key::from(f64::NAN);
        assert!(!key.is_comparable());
        assert!(!key.matches(&key.clone()));
        assert!(matches!(key.validate(), Err(CanopyError::InvalidKey(_))));
    }

    #[test]
    fn test_debug_output() {
        assert_eq!(format!("{:?}", Key::from("user")), "\"user\"");
        assert_eq!(format!("{:?}", Key::absent()), "<absent>");
    }
}

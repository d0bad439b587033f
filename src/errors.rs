use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Boxed error type returned by command handlers and registered functions.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A failed invocation, as delivered on a command's error stream.
///
/// This is an inexpensively cloned handle, since the same failure may be
/// delivered to several subscribers, or to every caller waiting on a
/// [`MemoizingCache`](crate::MemoizingCache) key.
#[derive(Clone)]
pub struct Failure {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
    panicked: bool,
}

impl Failure {
    /// Construct from any error (or string) convertible to [`BoxError`].
    pub fn new<E>(err: E) -> Failure
        where E: Into<BoxError>
    {
        Failure { inner: Arc::from(err.into()), panicked: false }
    }

    /// Construct from a panic payload, as returned by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Failure {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Failure { inner: Arc::new(Panicked(msg)), panicked: true }
    }

    /// Return true if this failure originated from a caught panic.
    pub fn is_panic(&self) -> bool {
        self.panicked
    }

    /// Attempt to downcast the underlying error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
        where E: StdError + 'static
    {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("error", &self.inner)
            .field("panicked", &self.panicked)
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.inner)
    }
}

impl From<Canceled> for Failure {
    fn from(me: Canceled) -> Failure {
        Failure::new(me)
    }
}

#[derive(Debug)]
struct Panicked(String);

impl fmt::Display for Panicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panicked: {}", self.0)
    }
}

impl StdError for Panicked {}

/// Error returned when `execute` is called on a command whose gate is
/// closed.
///
/// The call is rejected without running anything and without touching the
/// in-flight count. Callers are expected to check `can_execute` first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateClosed;

impl fmt::Display for GateClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command executed while it can not execute")
    }
}

impl StdError for GateClosed {}

/// Error type returned by the synchronous
/// [`Command::execute`](crate::Command::execute).
#[derive(Clone, Debug)]
pub enum ExecuteError {
    /// The command could not execute, see [`GateClosed`].
    GateClosed,

    /// The handler failed, and no error stream subscriber was registered to
    /// receive it.
    Failed(Failure),
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::GateClosed => fmt::Display::fmt(&GateClosed, f),
            ExecuteError::Failed(e) => write!(f, "Command handler failed: {}", e),
        }
    }
}

impl StdError for ExecuteError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ExecuteError::GateClosed => None,
            ExecuteError::Failed(e) => Some(e),
        }
    }
}

impl From<GateClosed> for ExecuteError {
    fn from(_: GateClosed) -> ExecuteError {
        ExecuteError::GateClosed
    }
}

impl From<Failure> for ExecuteError {
    fn from(f: Failure) -> ExecuteError {
        ExecuteError::Failed(f)
    }
}

/// Error for a unit of work which was dropped by its scheduler before it
/// could complete.
///
/// This only occurs if the scheduler is shut down or otherwise discards
/// queued work, for example when a `DispatchPool` is dropped.
#[derive(Debug)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scheduled command work was canceled")
    }
}

impl StdError for Canceled {}

impl From<Canceled> for io::Error {
    fn from(me: Canceled) -> io::Error {
        io::Error::new(io::ErrorKind::Other, me)
    }
}

#[cfg(test)]
mod tests {
    use std::panic::catch_unwind;

    use super::*;

    #[test]
    fn failure_from_str() {
        let f = Failure::new("bad input");
        assert_eq!("bad input", f.to_string());
        assert!(!f.is_panic());
    }

    #[test]
    fn failure_from_panic() {
        let payload = catch_unwind(|| panic!("oh no")).unwrap_err();
        let f = Failure::from_panic(payload);
        assert!(f.is_panic());
        assert_eq!("panicked: oh no", f.to_string());
    }

    #[test]
    fn failure_downcast() {
        let f = Failure::from(Canceled);
        assert!(f.downcast_ref::<Canceled>().is_some());
        assert!(f.downcast_ref::<GateClosed>().is_none());
    }

    #[test]
    fn execute_error_source() {
        let e = ExecuteError::from(Failure::new("x"));
        assert!(e.source().is_some());
        assert!(ExecuteError::from(GateClosed).source().is_none());
    }
}

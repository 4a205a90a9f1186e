use std::error;
use std::fmt;
use std::sync::Arc;

use crate::pool::State;

/// The error type returned by [`Pool::get`](crate::Pool::get) and
/// [`Pool::get_timeout`](crate::Pool::get_timeout).
#[derive(Debug, Clone)]
pub enum PoolError<E> {
    /// The acquisition deadline elapsed before a connection became free.
    ///
    /// Carries a snapshot of the pool taken at expiry and, if connection
    /// creation has ever failed, the most recent failure.
    TimedOut {
        /// Census of the pool at the moment the deadline expired.
        state: State,
        /// The most recent connection creation failure, if any.
        cause: Option<Arc<E>>,
    },
    /// The pool is empty and the most recent attempt to create a connection
    /// failed with this error.
    Connect(Arc<E>),
    /// The pool was suspended for the entire acquisition deadline.
    Suspended,
    /// The pool has been closed.
    Closed,
}

impl<E> fmt::Display for PoolError<E>
where
    E: error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolError::TimedOut { state, cause } => {
                write!(f, "timed out waiting for a connection ({})", state)?;
                if let Some(cause) = cause {
                    write!(f, "; last connection error: {}", cause)?;
                }
                Ok(())
            }
            PoolError::Connect(err) => write!(f, "failed to create a connection: {}", err),
            PoolError::Suspended => {
                write!(f, "pool suspension outlasted the acquisition deadline")
            }
            PoolError::Closed => write!(f, "pool has been closed"),
        }
    }
}

impl<E> error::Error for PoolError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            PoolError::TimedOut {
                cause: Some(cause), ..
            } => Some(cause.as_ref()),
            PoolError::Connect(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Returned by [`Pool::suspend`](crate::Pool::suspend) and
/// [`Pool::resume`](crate::Pool::resume) when the pool was built without
/// `allow_pool_suspension`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pool suspension is not enabled")]
pub struct SuspensionDisabled;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl error::Error for Boom {}

    #[test]
    fn timeout_display_includes_snapshot_and_cause() {
        let err = PoolError::TimedOut {
            state: State {
                total: 2,
                active: 2,
                idle: 0,
                waiting: 1,
            },
            cause: Some(Arc::new(Boom)),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("total=2"));
        assert!(rendered.contains("active=2"));
        assert!(rendered.contains("boom"));
        assert!(err.source().is_some());
    }

    #[test]
    fn connect_exposes_the_failure_as_source() {
        let err: PoolError<Boom> = PoolError::Connect(Arc::new(Boom));
        assert_eq!(err.to_string(), "failed to create a connection: boom");
        assert!(err.source().unwrap().to_string().contains("boom"));
    }
}

use std::marker::PhantomData;
use std::time::Duration;

use tracing::warn;

use crate::pool::Pool;
use crate::ManageConnection;

/// Smallest acquisition deadline the pool will honor.
const CONNECTION_TIMEOUT_FLOOR: Duration = Duration::from_millis(250);
/// Smallest usable leak detection threshold.
const LEAK_THRESHOLD_FLOOR: Duration = Duration::from_secs(2);

/// Resolved pool settings, after defaulting and clamping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Config {
    pub(crate) max_size: u32,
    pub(crate) min_idle: u32,
    pub(crate) connection_timeout: Duration,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_lifetime: Option<Duration>,
    pub(crate) validation_timeout: Duration,
    pub(crate) leak_detection_threshold: Option<Duration>,
    pub(crate) alive_bypass_window: Duration,
    pub(crate) housekeeping_period: Duration,
    pub(crate) allow_pool_suspension: bool,
}

/// A builder for a connection pool.
#[derive(Debug)]
pub struct Builder<M: ManageConnection> {
    max_size: u32,
    min_idle: Option<u32>,
    connection_timeout: Duration,
    idle_timeout: Option<Duration>,
    max_lifetime: Option<Duration>,
    validation_timeout: Duration,
    leak_detection_threshold: Option<Duration>,
    alive_bypass_window: Duration,
    housekeeping_period: Duration,
    allow_pool_suspension: bool,
    _p: PhantomData<M>,
}

impl<M: ManageConnection> Default for Builder<M> {
    fn default() -> Self {
        Builder {
            max_size: 10,
            min_idle: None,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            validation_timeout: Duration::from_secs(5),
            leak_detection_threshold: None,
            alive_bypass_window: Duration::from_millis(500),
            housekeeping_period: Duration::from_secs(30),
            allow_pool_suspension: false,
            _p: PhantomData,
        }
    }
}

impl<M: ManageConnection> Builder<M> {
    /// Constructs a new `Builder`.
    ///
    /// Parameters are initialized with their default values.
    pub fn new() -> Builder<M> {
        Default::default()
    }

    /// Sets the maximum number of connections managed by the pool.
    ///
    /// Defaults to 10.
    pub fn max_size(mut self, max_size: u32) -> Builder<M> {
        assert!(max_size > 0, "max_size must be greater than zero!");
        self.max_size = max_size;
        self
    }

    /// Sets the number of idle connections the pool tries to maintain.
    ///
    /// The housekeeper replaces evicted connections until at least this many
    /// sit idle, while respecting `max_size`.
    ///
    /// Defaults to `max_size`.
    pub fn min_idle(mut self, min_idle: u32) -> Builder<M> {
        self.min_idle = Some(min_idle);
        self
    }

    /// Sets the deadline for [`Pool::get`].
    ///
    /// Values below 250 ms are raised to 250 ms.
    ///
    /// Defaults to 30 seconds.
    pub fn connection_timeout(mut self, connection_timeout: Duration) -> Builder<M> {
        assert!(
            connection_timeout > Duration::from_secs(0),
            "connection_timeout must be non-zero"
        );
        self.connection_timeout = connection_timeout;
        self
    }

    /// Sets the duration after which an idle connection in excess of
    /// `min_idle` is closed, or `None` to retire connections by lifetime
    /// alone.
    ///
    /// Defaults to 10 minutes.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Builder<M> {
        assert!(
            idle_timeout != Some(Duration::from_secs(0)),
            "idle_timeout must be greater than zero!"
        );
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the maximum lifetime of connections in the pool, or `None` for
    /// unbounded.
    ///
    /// A small random variance (up to 2.5%) is subtracted from each
    /// connection's lifetime so that connections created together do not all
    /// retire at the same instant. A connection that reaches its lifetime
    /// while checked out is closed when it is returned.
    ///
    /// Defaults to 30 minutes.
    pub fn max_lifetime(mut self, max_lifetime: Option<Duration>) -> Builder<M> {
        assert!(
            max_lifetime != Some(Duration::from_secs(0)),
            "max_lifetime must be greater than zero!"
        );
        self.max_lifetime = max_lifetime;
        self
    }

    /// Sets the bound on a single aliveness check.
    ///
    /// Clamped to `connection_timeout` if larger.
    ///
    /// Defaults to 5 seconds.
    pub fn validation_timeout(mut self, validation_timeout: Duration) -> Builder<M> {
        assert!(
            validation_timeout > Duration::from_secs(0),
            "validation_timeout must be non-zero"
        );
        self.validation_timeout = validation_timeout;
        self
    }

    /// Sets how long a connection may be held out of the pool before a leak
    /// warning is logged, or `None` to disable leak detection.
    ///
    /// Values below 2 seconds are raised to 2 seconds. The connection is
    /// never forcibly reclaimed.
    ///
    /// Defaults to `None`.
    pub fn leak_detection_threshold(mut self, threshold: Option<Duration>) -> Builder<M> {
        self.leak_detection_threshold = threshold;
        self
    }

    /// Sets the grace period after a release during which the next borrower
    /// skips the aliveness check.
    ///
    /// Defaults to 500 ms.
    pub fn alive_bypass_window(mut self, window: Duration) -> Builder<M> {
        self.alive_bypass_window = window;
        self
    }

    /// Sets the interval between housekeeping passes.
    ///
    /// Defaults to 30 seconds.
    pub fn housekeeping_period(mut self, period: Duration) -> Builder<M> {
        assert!(
            period > Duration::from_secs(0),
            "housekeeping_period must be non-zero"
        );
        self.housekeeping_period = period;
        self
    }

    /// Permits [`Pool::suspend`] and [`Pool::resume`].
    ///
    /// While suspended, acquisitions block (up to their deadline) rather
    /// than fail.
    ///
    /// Defaults to false.
    pub fn allow_pool_suspension(mut self, allow: bool) -> Builder<M> {
        self.allow_pool_suspension = allow;
        self
    }

    fn resolve(&self) -> Config {
        let min_idle = self.min_idle.unwrap_or(self.max_size);
        assert!(
            min_idle <= self.max_size,
            "min_idle must be no larger than max_size"
        );

        let mut connection_timeout = self.connection_timeout;
        if connection_timeout < CONNECTION_TIMEOUT_FLOOR {
            warn!(
                "connection_timeout below {:?}, raising it to the minimum",
                CONNECTION_TIMEOUT_FLOOR
            );
            connection_timeout = CONNECTION_TIMEOUT_FLOOR;
        }

        let mut validation_timeout = self.validation_timeout;
        if validation_timeout > connection_timeout {
            warn!("validation_timeout exceeds connection_timeout, clamping");
            validation_timeout = connection_timeout;
        }

        let leak_detection_threshold = self.leak_detection_threshold.map(|threshold| {
            if threshold < LEAK_THRESHOLD_FLOOR {
                warn!(
                    "leak_detection_threshold below {:?}, raising it to the minimum",
                    LEAK_THRESHOLD_FLOOR
                );
                LEAK_THRESHOLD_FLOOR
            } else {
                threshold
            }
        });

        Config {
            max_size: self.max_size,
            min_idle,
            connection_timeout,
            idle_timeout: self.idle_timeout,
            max_lifetime: self.max_lifetime,
            validation_timeout,
            leak_detection_threshold,
            alive_bypass_window: self.alive_bypass_window,
            housekeeping_period: self.housekeeping_period,
            allow_pool_suspension: self.allow_pool_suspension,
        }
    }

    /// Consumes the builder, returning a new, initialized `Pool`.
    ///
    /// The pool is not returned until `min_idle` connections have been
    /// established; the first creation failure is returned instead.
    pub async fn build(self, manager: M) -> Result<Pool<M>, M::Error> {
        let pool = Pool::new_inner(self.resolve(), manager);
        pool.fill_initial().await?;
        pool.start_background_tasks();
        Ok(pool)
    }

    /// Consumes the builder, returning a new `Pool` without waiting for any
    /// connections to be established.
    pub fn build_unchecked(self, manager: M) -> Pool<M> {
        let pool = Pool::new_inner(self.resolve(), manager);
        pool.start_background_tasks();
        pool.request_fill();
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::NeverManager;

    #[test]
    fn defaults_match_documentation() {
        let config = Builder::<NeverManager>::new().resolve();
        assert_eq!(config.max_size, 10);
        assert_eq!(config.min_idle, 10);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(1800)));
        assert_eq!(config.validation_timeout, Duration::from_secs(5));
        assert_eq!(config.leak_detection_threshold, None);
        assert_eq!(config.alive_bypass_window, Duration::from_millis(500));
        assert!(!config.allow_pool_suspension);
    }

    #[test]
    fn floors_and_caps_are_applied() {
        let config = Builder::<NeverManager>::new()
            .connection_timeout(Duration::from_millis(100))
            .validation_timeout(Duration::from_secs(60))
            .leak_detection_threshold(Some(Duration::from_millis(500)))
            .resolve();
        assert_eq!(config.connection_timeout, Duration::from_millis(250));
        assert_eq!(config.validation_timeout, Duration::from_millis(250));
        assert_eq!(
            config.leak_detection_threshold,
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    #[should_panic(expected = "min_idle must be no larger than max_size")]
    fn min_idle_above_max_size_panics() {
        Builder::<NeverManager>::new()
            .max_size(2)
            .min_idle(5)
            .resolve();
    }

    #[test]
    #[should_panic(expected = "max_size must be greater than zero!")]
    fn zero_max_size_panics() {
        let _ = Builder::<NeverManager>::new().max_size(0);
    }
}

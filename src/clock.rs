use tokio::time::Instant;

/// Millisecond timestamps measured against a fixed epoch.
///
/// All durations are derived from the tokio clock rather than wall time, so
/// they are monotonic and tests running under `tokio::time::pause` can drive
/// timeout and eviction behavior deterministically.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub(crate) fn new() -> Clock {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    pub(crate) fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

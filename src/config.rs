use std::time::Duration;

/// Tuning knobs for a CPU's event loop.
///
/// Mirrors the shape of the teacher's `runtime::event_loop::Config`: a plain
/// struct with a `Default` impl, read once when the loop is built.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of local tasks executed per tick (the fairness bound
    /// `B` from the loop's design) so a chatty compute workload cannot
    /// starve selector polling.
    pub task_batch: usize,

    /// Upper bound on how long a tick's selector poll may block when the
    /// local task queue is empty and no timer is due sooner.
    pub max_poll_wait: Duration,

    /// Initial capacity of the selector's readiness event buffer.
    pub selector_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_batch: 256,
            max_poll_wait: Duration::from_millis(100),
            selector_capacity: 1024,
        }
    }
}

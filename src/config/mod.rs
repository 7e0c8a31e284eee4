//! Server tuning knobs that are not part of the per-call API.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long `stop` waits for the listener to drain before aborting it.
    pub shutdown_timeout: Duration,
    /// Run the expiry sweep on this interval while started. `None` leaves
    /// expiry purely to the checks made on access.
    pub sweep_interval: Option<Duration>,
    /// Frames a viewer may have queued before it is evicted as too slow.
    pub viewer_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            sweep_interval: None,
            viewer_queue_capacity: 1024,
        }
    }
}

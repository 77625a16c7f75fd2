use std::time::Duration;

/// How long a relayed write may wait on a slow recipient before the recipient is dropped.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound WebSocket message accepted from a client.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128 * 1024;

/// Frames queued per connection before writers start waiting.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Chunks between progress log lines for an active transfer.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 50;

/// Runtime knobs shared by the listener, sessions and the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub write_timeout: Duration,
    pub max_message_size: usize,
    pub outbound_capacity: usize,
    pub progress_interval: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

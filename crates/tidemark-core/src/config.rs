//! Engine configuration

use std::time::Duration;

/// Tunables shared by the RPC and sync layers.
///
/// The defaults suit interactive peers on ordinary links; tests shrink the
/// durations. The backoff ceiling must stay below the RPC timeout so a
/// stalled bulk stream fails before the call that started it does.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Caller-side deadline for a single RPC call.
    pub rpc_timeout: Duration,
    /// Largest message sent unchunked on the control channel.
    pub max_message_size: usize,
    /// Payload size of one chunk fragment.
    pub chunk_size: usize,
    /// Records fetched per cursor page during fast sync.
    pub fast_sync_page: usize,
    /// Sub-channel buffered-amount threshold that triggers backoff.
    pub buffer_threshold: usize,
    /// First backoff sleep.
    pub backoff_start: Duration,
    /// Abort the stream once the next backoff sleep would exceed this.
    pub backoff_ceiling: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
            max_message_size: 256 * 1024,
            chunk_size: 64 * 1024,
            fast_sync_page: 256,
            buffer_threshold: 1024 * 1024,
            backoff_start: Duration::from_millis(50),
            backoff_ceiling: Duration::from_secs(15),
        }
    }
}

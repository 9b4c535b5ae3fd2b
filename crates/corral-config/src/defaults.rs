//! Default values shared by the host library and the binaries.

/// Default number of idle child processes kept in the cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 8;

/// Default bound on waiting for the peer's next message.
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 60_000;

/// Default bound on waiting for a child pipe to accept a write.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;

/// Default readiness-poll granularity inside bounded waits.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default largest single read issued against a child pipe.
pub const DEFAULT_READ_CHUNK: usize = 1024;

/// Default largest frame payload written in one record.
pub const DEFAULT_FRAME_BLOCK: usize = 4096;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

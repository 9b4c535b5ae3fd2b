//! Shared configuration for the corral process host.
//!
//! The host and the CLI agree on one [`Config`] value covering the process
//! cache bound, the wire byte order, the transport timeouts, and the logging
//! surface. Every field carries a serde default so partial configuration
//! files stay valid as new knobs appear.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod byteorder;
mod defaults;
mod logging;

pub use byteorder::ByteOrder;
pub use defaults::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_FRAME_BLOCK, DEFAULT_LOG_FILTER, DEFAULT_PEER_TIMEOUT_MS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_READ_CHUNK, DEFAULT_WRITE_TIMEOUT_MS,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Runtime configuration shared by the host library and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of idle child processes kept alive in the cache.
    pub cache_capacity: usize,
    /// Byte order the peer executables were built for.
    pub byte_order: ByteOrder,
    /// How long a run waits for the peer's next message before giving up.
    pub peer_timeout_ms: u64,
    /// How long a write waits for the child's pipe to accept data.
    pub write_timeout_ms: u64,
    /// Granularity of readiness polling inside bounded waits.
    pub poll_interval_ms: u64,
    /// Largest single read issued against a child pipe.
    pub read_chunk: usize,
    /// Largest frame payload written in one record; longer data is split.
    pub frame_block: usize,
    /// Log filter expression handed to the tracing subscriber.
    pub log_filter: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            byte_order: ByteOrder::host(),
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            read_chunk: DEFAULT_READ_CHUNK,
            frame_block: DEFAULT_FRAME_BLOCK,
            log_filter: defaults::default_log_filter_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Peer-response timeout as a [`Duration`].
    #[must_use]
    pub const fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Pipe-write timeout as a [`Duration`].
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Readiness-poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }
}

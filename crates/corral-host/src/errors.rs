//! Error types for the process host.
//!
//! The taxonomy mirrors the failure classes of the protocol: transport
//! failures ([`ChannelError`]), framing failures ([`WireError`]),
//! parameter-store failures ([`ParamError`]) and the run-level
//! [`SessionError`] that carries the executable path and, where one exists,
//! the protocol fragment being processed when things went wrong.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the byte transport to one child process.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Spawning the child process failed outright.
    #[error("failed to spawn task executable {}: {source}", .executable.display())]
    SpawnFailed {
        /// Path of the executable that failed to start.
        executable: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The child exited before the conversation could start.
    #[error("task executable {} died during startup: {detail}", .executable.display())]
    StartupFailure {
        /// Path of the executable that failed to start.
        executable: PathBuf,
        /// Decoded exit status or signal.
        detail: String,
    },

    /// An operation was attempted against a process that is already gone.
    #[error("no live process for task executable {}", .executable.display())]
    Dead {
        /// Path of the executable whose process is gone.
        executable: PathBuf,
    },

    /// The child's stdin pipe never became writable within the bound.
    #[error("write to task executable {} blocked for {waited_ms}ms", .executable.display())]
    WriteBlocked {
        /// Path of the unresponsive executable.
        executable: PathBuf,
        /// How long the write waited before giving up.
        waited_ms: u64,
    },

    /// A blocking read did not complete within its bound.
    #[error("read from task executable {} timed out after {waited_ms}ms", .executable.display())]
    ReadTimeout {
        /// Path of the unresponsive executable.
        executable: PathBuf,
        /// How long the read waited before giving up.
        waited_ms: u64,
    },

    /// The child survived the full escalating termination sequence.
    #[error("task executable {} survived SIGTERM and SIGKILL", .executable.display())]
    Unkillable {
        /// Path of the executable that would not die.
        executable: PathBuf,
    },

    /// I/O failure on one of the child's pipes.
    #[error("pipe error for task executable {}: {source}", .executable.display())]
    Io {
        /// Path of the executable whose pipe failed.
        executable: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Errors raised by the frame codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The record did not start with the protocol magic.
    #[error("bad frame magic {found:#06x}; not a legal pipe record")]
    BadMagic {
        /// The two header bytes that were found instead, as one word.
        found: u16,
    },

    /// The header ended before its four bytes arrived.
    #[error("truncated frame header: got {got} of 4 bytes")]
    TruncatedHeader {
        /// Number of header bytes actually read.
        got: usize,
    },

    /// The stream ended inside a record's payload.
    #[error("truncated frame payload: got {got} of {expected} bytes")]
    TruncatedPayload {
        /// Bytes the header promised.
        expected: usize,
        /// Bytes actually read before end-of-stream.
        got: usize,
    },

    /// A 16-bit-packed payload had an odd byte count.
    #[error("odd payload length {len}; packed data comes in 16-bit words")]
    OddPayload {
        /// The offending byte count.
        len: usize,
    },
}

/// Errors raised by a task's parameter store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    /// The peer addressed a parameter the task does not define.
    #[error("task `{task}` has no parameter `{name}`")]
    Unknown {
        /// Name of the task whose store was queried.
        task: String,
        /// The unknown parameter name.
        name: String,
    },

    /// The value failed validation against the parameter's type.
    #[error("invalid value `{value}` for parameter `{name}`: {message}")]
    Invalid {
        /// The parameter being set.
        name: String,
        /// The rejected value.
        value: String,
        /// Why validation rejected it.
        message: String,
    },
}

/// Errors raised while running a protocol session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport failure on the underlying channel.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Framing failure; the session must be discarded.
    #[error("framing error talking to {}: {source}", .executable.display())]
    Wire {
        /// Path of the executable whose stream broke framing.
        executable: PathBuf,
        /// The codec failure.
        #[source]
        source: WireError,
    },

    /// A data delivery announced one length and carried another.
    #[error(
        "wrong number of bytes from {} on channel {channel}: got {got}, expected {expected}",
        .executable.display()
    )]
    LengthMismatch {
        /// Path of the executable that sent the delivery.
        executable: PathBuf,
        /// Protocol channel of the delivery.
        channel: i32,
        /// Bytes the sub-frame header promised.
        expected: usize,
        /// Bytes the frame actually carried.
        got: usize,
    },

    /// A message could not be parsed as any protocol form.
    #[error("malformed message from {}: `{fragment}`", .executable.display())]
    MalformedMessage {
        /// Path of the executable that sent the message.
        executable: PathBuf,
        /// The offending message text.
        fragment: String,
    },

    /// The peer reported a fatal error of its own.
    #[error("task `{task}` ({}) terminated abnormally: {detail}", .executable.display())]
    Peer {
        /// Path of the executable running the task.
        executable: PathBuf,
        /// Name of the logical task that failed.
        task: String,
        /// Error code scanned from the message, when present.
        errno: Option<i32>,
        /// The peer's error text.
        detail: String,
    },

    /// No message arrived within the configured bound.
    #[error("task executable {} sent nothing for {waited_ms}ms", .executable.display())]
    PeerTimeout {
        /// Path of the unresponsive executable.
        executable: PathBuf,
        /// How long the session waited.
        waited_ms: u64,
    },

    /// The peer closed its side of the pipe mid-conversation.
    #[error("task executable {} closed the pipe unexpectedly", .executable.display())]
    Disconnected {
        /// Path of the executable that hung up.
        executable: PathBuf,
    },

    /// The run was cancelled from outside.
    #[error("run against {} was interrupted", .executable.display())]
    Interrupted {
        /// Path of the executable whose run was cancelled.
        executable: PathBuf,
    },

    /// The peer asked to be fed on a channel this host does not serve.
    #[error("data request from {} for unsupported channel {channel}", .executable.display())]
    UnsupportedTransferChannel {
        /// Path of the executable that made the request.
        executable: PathBuf,
        /// The unsupported channel number.
        channel: i32,
    },

    /// The task's parameter store failed a get or a forced set.
    #[error("parameter `{name}` of task `{task}`: {source}")]
    Param {
        /// Name of the task whose store failed.
        task: String,
        /// The parameter involved.
        name: String,
        /// The store failure.
        #[source]
        source: ParamError,
    },

    /// Reading the run's stdin or writing one of its sinks failed.
    #[error("host stdio error: {source}")]
    HostIo {
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The run failed and the follow-up kill failed too.
    #[error("{primary}; additionally failed to kill the process: {cleanup}")]
    Cleanup {
        /// The error that ended the run.
        #[source]
        primary: Box<SessionError>,
        /// Description of the failed kill.
        cleanup: String,
    },

    /// Invariant violation inside the host itself.
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

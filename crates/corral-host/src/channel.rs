//! Non-blocking byte transport to one child process.
//!
//! [`ByteChannel`] owns the spawned process and its pipes. Reads go through
//! an internal buffer filled by bounded, chunked reads behind a readiness
//! poll, so callers can peek, drain pending output, or block with a timeout
//! without ever issuing an unbounded read. Writes poll the stdin pipe for
//! writability before committing. Lifecycle escalation runs SIGSTOP/SIGCONT
//! for suspension and a TERM-then-KILL sequence for termination, and a live
//! child is never leaked on drop.
//!
//! The [`Channel`] trait is the seam the session layer talks through;
//! in-memory test doubles implement it without spawning anything.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use corral_config::Config;

use crate::errors::ChannelError;

/// Log target for transport operations.
pub(crate) const CHANNEL_TARGET: &str = "corral_host::channel";

/// How long each reap attempt waits during termination escalation.
const REAP_GRACE: Duration = Duration::from_millis(500);

/// Transport tuning knobs lifted from the shared configuration.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Largest single read issued against the pipe.
    pub read_chunk: usize,
    /// Granularity of readiness polling inside bounded waits.
    pub poll_interval: Duration,
}

impl ChannelSettings {
    /// Extracts the transport knobs from the shared configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_chunk: config.read_chunk.max(1),
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Byte-level transport a protocol session drives.
pub trait Channel {
    /// Path of the executable on the other end.
    fn executable(&self) -> &Path;

    /// Whether the process still exists (reaps a zombie as a side effect).
    fn is_alive(&mut self) -> bool;

    /// Whether end-of-stream has been observed on the read side.
    fn at_eof(&self) -> bool;

    /// Writes all of `bytes`, waiting up to `timeout` for pipe writability.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Dead`] for a gone process,
    /// [`ChannelError::WriteBlocked`] when the pipe never became writable,
    /// and [`ChannelError::Io`] for pipe failures.
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), ChannelError>;

    /// Returns the next pending byte without consuming it, waiting up to
    /// `timeout` for one to arrive. `None` means timeout or end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] for pipe failures.
    fn peek_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ChannelError>;

    /// Drains up to `max` bytes that are already buffered or immediately
    /// available. An empty result means nothing was pending.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] for pipe failures.
    fn read_pending(&mut self, max: usize) -> Result<Vec<u8>, ChannelError>;

    /// Reads up to and including the next newline. The non-blocking form
    /// may return a partial line without the newline rather than wait.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ReadTimeout`] when a blocking read exceeds
    /// `timeout` and [`ChannelError::Io`] for pipe failures.
    fn read_line(&mut self, blocking: bool, timeout: Duration) -> Result<Vec<u8>, ChannelError>;

    /// Reads exactly `n` bytes, returning fewer only at end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ReadTimeout`] when the bytes do not arrive
    /// within `timeout` and [`ChannelError::Io`] for pipe failures.
    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, ChannelError>;

    /// Delivers a suspend signal; `false` if the process no longer exists.
    fn suspend(&mut self) -> bool;

    /// Delivers a continue signal; `false` if the process no longer exists.
    fn resume(&mut self) -> bool;

    /// Waits up to `timeout` for the process to die, reaping it on success.
    fn wait(&mut self, timeout: Duration) -> bool;

    /// Best-effort graceful stop within the grace window.
    fn terminate(&mut self, grace: Duration);

    /// Escalating kill: wake, SIGTERM, reap, SIGKILL, reap.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unkillable`] only when the process survives
    /// the whole sequence.
    fn force_kill(&mut self) -> Result<(), ChannelError>;
}

/// Pipe transport to one spawned child process.
#[derive(Debug)]
pub struct ByteChannel {
    executable: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    buf: Vec<u8>,
    eof: bool,
    exited: bool,
    settings: ChannelSettings,
}

impl ByteChannel {
    /// Spawns `executable` with `args`, capturing its stdin and stdout.
    ///
    /// The spawn is immediately followed by a non-blocking wait: a child
    /// that managed to start but died at once (bad binary, missing shared
    /// library, refused connection mode) is reported as a startup failure
    /// with its decoded exit status instead of surfacing later as a broken
    /// pipe.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SpawnFailed`] when the OS rejects the spawn
    /// and [`ChannelError::StartupFailure`] when the child exits before the
    /// conversation starts.
    pub fn spawn(
        executable: &Path,
        args: &[&str],
        settings: ChannelSettings,
    ) -> Result<Self, ChannelError> {
        debug!(
            target: CHANNEL_TARGET,
            executable = %executable.display(),
            ?args,
            "spawning task executable"
        );

        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| ChannelError::SpawnFailed {
                executable: executable.to_path_buf(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ChannelError::SpawnFailed {
            executable: executable.to_path_buf(),
            source: io::Error::other("failed to capture stdin"),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::SpawnFailed {
                executable: executable.to_path_buf(),
                source: io::Error::other("failed to capture stdout"),
            })?;

        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(ChannelError::StartupFailure {
                    executable: executable.to_path_buf(),
                    detail: describe_exit(status),
                });
            }
            Ok(None) => {}
            Err(source) => {
                return Err(ChannelError::Io {
                    executable: executable.to_path_buf(),
                    source,
                });
            }
        }

        debug!(
            target: CHANNEL_TARGET,
            executable = %executable.display(),
            pid = child.id(),
            "task executable spawned"
        );

        Ok(Self {
            executable: executable.to_path_buf(),
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            buf: Vec::new(),
            eof: false,
            exited: false,
            settings,
        })
    }

    /// Process id, while the process has not been reaped.
    fn pid(&self) -> Option<Pid> {
        if self.exited {
            None
        } else {
            Some(Pid::from_raw(self.child.id() as i32))
        }
    }

    fn io_error(&self, source: io::Error) -> ChannelError {
        ChannelError::Io {
            executable: self.executable.clone(),
            source,
        }
    }

    fn deliver_signal(&self, sig: Signal) -> bool {
        match self.pid() {
            Some(pid) => signal::kill(pid, sig).is_ok(),
            None => false,
        }
    }

    /// Marks the process reaped and releases its pipe handles.
    fn note_exit(&mut self, status: ExitStatus) {
        debug!(
            target: CHANNEL_TARGET,
            executable = %self.executable.display(),
            ?status,
            "task executable exited"
        );
        self.exited = true;
        self.stdin = None;
        self.stdout = None;
    }

    /// Polls one fd for the given events, bounded by `timeout`.
    fn poll_ready<F: AsFd>(fd: &F, events: PollFlags, timeout: Duration) -> io::Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(fd.as_fd(), events)];
        let ready = poll(&mut fds, PollTimeout::from(millis)).map_err(io::Error::from)?;
        Ok(ready > 0)
    }

    /// Performs at most one chunked read after a readiness poll, appending
    /// whatever arrived to the internal buffer.
    fn fill_once(&mut self, timeout: Duration) -> Result<usize, ChannelError> {
        if self.eof {
            return Ok(0);
        }
        let ready = match self.stdout.as_ref() {
            Some(stdout) => Self::poll_ready(stdout, PollFlags::POLLIN, timeout)
                .map_err(|source| self.io_error(source))?,
            None => {
                self.eof = true;
                return Ok(0);
            }
        };
        if !ready {
            return Ok(0);
        }
        let mut chunk = vec![0u8; self.settings.read_chunk];
        let got = match self.stdout.as_mut() {
            Some(stdout) => stdout.read(&mut chunk),
            None => Ok(0),
        };
        match got {
            Ok(0) => {
                self.eof = true;
                Ok(0)
            }
            Ok(count) => {
                self.buf.extend_from_slice(&chunk[..count]);
                Ok(count)
            }
            Err(source) => Err(self.io_error(source)),
        }
    }

    /// Removes and returns the first `n` buffered bytes (or all of them).
    fn take_from_buffer(&mut self, n: usize) -> Vec<u8> {
        let rest = self.buf.split_off(n.min(self.buf.len()));
        std::mem::replace(&mut self.buf, rest)
    }

    fn newline_position(&self) -> Option<usize> {
        self.buf.iter().position(|&byte| byte == b'\n')
    }
}

impl Channel for ByteChannel {
    fn executable(&self) -> &Path {
        &self.executable
    }

    fn is_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.note_exit(status);
                false
            }
            Err(source) => {
                warn!(
                    target: CHANNEL_TARGET,
                    executable = %self.executable.display(),
                    error = %source,
                    "failed to check process status"
                );
                true
            }
        }
    }

    fn at_eof(&self) -> bool {
        self.eof && self.buf.is_empty()
    }

    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), ChannelError> {
        if !self.is_alive() {
            return Err(ChannelError::Dead {
                executable: self.executable.clone(),
            });
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let mut announced = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(self.settings.poll_interval);
            let writable = match self.stdin.as_ref() {
                Some(stdin) => Self::poll_ready(stdin, PollFlags::POLLOUT, slice)
                    .map_err(|source| self.io_error(source))?,
                None => {
                    return Err(ChannelError::Dead {
                        executable: self.executable.clone(),
                    });
                }
            };
            if writable {
                let result = match self.stdin.as_mut() {
                    Some(stdin) => stdin.write_all(bytes).and_then(|()| stdin.flush()),
                    None => Err(io::Error::other("stdin pipe closed")),
                };
                return result.map_err(|source| self.io_error(source));
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::WriteBlocked {
                    executable: self.executable.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            if !announced {
                warn!(
                    target: CHANNEL_TARGET,
                    executable = %self.executable.display(),
                    "waiting for task executable to accept input"
                );
                announced = true;
            }
        }
    }

    fn peek_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ChannelError> {
        if self.buf.is_empty() && !self.eof {
            self.fill_once(timeout)?;
        }
        Ok(self.buf.first().copied())
    }

    fn read_pending(&mut self, max: usize) -> Result<Vec<u8>, ChannelError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        if self.buf.is_empty() {
            self.fill_once(Duration::ZERO)?;
        }
        Ok(self.take_from_buffer(max))
    }

    fn read_line(&mut self, blocking: bool, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        if !blocking {
            if self.newline_position().is_none() {
                self.fill_once(Duration::ZERO)?;
            }
            return Ok(match self.newline_position() {
                Some(position) => self.take_from_buffer(position + 1),
                None => self.take_from_buffer(self.buf.len()),
            });
        }

        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if let Some(position) = self.newline_position() {
                return Ok(self.take_from_buffer(position + 1));
            }
            if self.eof {
                // partial line on end-of-stream
                return Ok(self.take_from_buffer(self.buf.len()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::ReadTimeout {
                    executable: self.executable.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            self.fill_once(remaining.min(self.settings.poll_interval))?;
        }
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if self.buf.len() >= n {
                return Ok(self.take_from_buffer(n));
            }
            if self.eof {
                // short read on end-of-stream
                return Ok(self.take_from_buffer(self.buf.len()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::ReadTimeout {
                    executable: self.executable.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            self.fill_once(remaining.min(self.settings.poll_interval))?;
        }
    }

    fn suspend(&mut self) -> bool {
        self.is_alive() && self.deliver_signal(Signal::SIGSTOP)
    }

    fn resume(&mut self) -> bool {
        self.is_alive() && self.deliver_signal(Signal::SIGCONT)
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        if self.exited {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let pause = (timeout / 10).max(Duration::from_millis(10));
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.note_exit(status);
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(pause.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    fn terminate(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        if !self.wait(grace) {
            if let Err(error) = self.force_kill() {
                warn!(
                    target: CHANNEL_TARGET,
                    executable = %self.executable.display(),
                    error = %error,
                    "failed to terminate task executable"
                );
            }
        }
    }

    fn force_kill(&mut self) -> Result<(), ChannelError> {
        if !self.is_alive() {
            return Ok(());
        }
        // A stopped process ignores SIGTERM until it is continued.
        self.deliver_signal(Signal::SIGCONT);
        for sig in [Signal::SIGTERM, Signal::SIGKILL] {
            self.deliver_signal(sig);
            if self.wait(REAP_GRACE) {
                return Ok(());
            }
        }
        Err(ChannelError::Unkillable {
            executable: self.executable.clone(),
        })
    }
}

impl Drop for ByteChannel {
    fn drop(&mut self) {
        if self.is_alive() {
            if let Err(error) = self.force_kill() {
                warn!(
                    target: CHANNEL_TARGET,
                    executable = %self.executable.display(),
                    error = %error,
                    "failed to kill task executable on drop"
                );
            }
        }
    }
}

/// Renders an exit status for startup-failure diagnostics.
fn describe_exit(status: ExitStatus) -> String {
    if let Some(sig) = status.signal() {
        return format!("killed by signal {sig}");
    }
    match status.code() {
        Some(code) => format!("exited with status {code}"),
        None => "exited".to_owned(),
    }
}

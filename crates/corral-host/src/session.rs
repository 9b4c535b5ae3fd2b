//! One logical conversation with a spawned task executable.
//!
//! A session walks the child through setup mode (environment directives,
//! then the end-of-setup marker) and then services slave mode: the child
//! drives the conversation with requests — feed me input, take this output,
//! get or set a parameter, run this command — until it says `bye` or
//! something breaks. Messages are processed strictly in arrival order; the
//! protocol is stateful and nothing may be reordered or pipelined.

use std::io::{BufRead as _, Write as _};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use corral_config::{ByteOrder, Config};

use crate::cancel::CancelToken;
use crate::channel::Channel;
use crate::errors::{ChannelError, ParamError, SessionError, WireError};
use crate::message::{self, MessageKind};
use crate::task::{Collaborators, ParamValue, RunIo, TaskInfo};
use crate::wire;

/// Log target for session operations.
pub(crate) const SESSION_TARGET: &str = "corral_host::session";

/// Environment passed to a child during setup mode, in directive order.
pub type EnvVars = std::collections::BTreeMap<String, String>;

/// Marker ending setup mode.
const SETUP_DONE: &str = "_go_\n";

/// Grace given to a peer between the `bye` request and the kill.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Reserved redirection target that routes command output back in-band.
const IPC_OUT_FILE: &str = "IPC$IPCIO-OUT";

/// Marker line terminating in-band command output.
const IPC_DONE_MARK: &str = "# IPC$IPCIO-FINISHED\n";

/// Protocol channel the peer reads its stdin from.
const CHAN_STDIN_FEED: i32 = 3;
/// Protocol channel carrying the task's stdout.
const CHAN_STDOUT: i32 = 4;
/// Protocol channel carrying the task's stderr.
const CHAN_STDERR: i32 = 5;
/// Protocol channel carrying graphics metacode.
const CHAN_GRAPHICS: i32 = 6;
/// Protocol channel for image display data (not implemented).
const CHAN_IMAGE: i32 = 7;
/// Protocol channel for plot display data (not implemented).
const CHAN_PLOT: i32 = 8;
/// Protocol channel multiplexing control sub-messages.
const CHAN_CONTROL: i32 = 9;

/// Wire and timing knobs a session lifts from the shared configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Byte order of the peer's 16-bit words.
    pub byte_order: ByteOrder,
    /// Bound on waiting for the peer's next message.
    pub peer_timeout: Duration,
    /// Bound on waiting for the peer to accept a write.
    pub write_timeout: Duration,
    /// Granularity of cancellation checks inside waits.
    pub poll_interval: Duration,
    /// Largest frame payload written in one record.
    pub frame_block: usize,
}

impl SessionSettings {
    /// Extracts the session knobs from the shared configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            byte_order: config.byte_order,
            peer_timeout: config.peer_timeout(),
            write_timeout: config.write_timeout(),
            poll_interval: config.poll_interval(),
            frame_block: config.frame_block.clamp(2, usize::from(u16::MAX) & !1),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Where a session stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Between runs; safe to cache.
    Idle,
    /// Inside a run.
    Running,
    /// A run failed; the session must be discarded, never cached.
    Failed,
}

/// The live conversation with one spawned task executable.
pub struct ProtocolSession<C: Channel> {
    channel: C,
    executable: PathBuf,
    settings: SessionSettings,
    residual: String,
    transfer_pending: Vec<u8>,
    env_pending: Vec<String>,
    state: SessionState,
}

impl<C: Channel> ProtocolSession<C> {
    /// Wraps a freshly spawned channel.
    pub fn new(channel: C, settings: SessionSettings) -> Self {
        let executable = channel.executable().to_path_buf();
        Self {
            channel,
            executable,
            settings,
            residual: String::new(),
            transfer_pending: Vec::new(),
            env_pending: Vec::new(),
            state: SessionState::Idle,
        }
    }

    /// Path of the executable this session talks to.
    #[must_use]
    pub fn executable(&self) -> &std::path::Path {
        &self.executable
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the child process still exists.
    pub fn is_alive(&mut self) -> bool {
        self.channel.is_alive()
    }

    /// Pushes the run-time environment to a newly spawned child and ends
    /// setup mode.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] when the directives cannot be written.
    pub fn initialize(&mut self, env: &EnvVars) -> Result<(), SessionError> {
        let mut setup = String::new();
        for (key, value) in env {
            setup.push_str(&format!("set {key}={value}\n"));
        }
        match std::env::current_dir() {
            Ok(cwd) => setup.push_str(&format!("chdir {}\n", cwd.display())),
            Err(error) => warn!(
                target: SESSION_TARGET,
                error = %error,
                "cannot determine working directory; child keeps its own"
            ),
        }
        if !setup.is_empty() {
            self.write_text(&setup)?;
        }
        self.write_text(SETUP_DONE)
    }

    /// Queues an environment directive for delivery at the next run.
    ///
    /// A running peer is not expecting unsolicited messages, so updates are
    /// held until the conversation is ours to start.
    pub fn append_env(&mut self, directive: &str) {
        let mut line = directive.to_owned();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.env_pending.push(line);
    }

    /// Runs one logical task to completion.
    ///
    /// # Errors
    ///
    /// Any [`SessionError`] other than the locally recovered parameter
    /// validation case ends the run; the session is then in the
    /// [`SessionState::Failed`] state and must be discarded by the caller.
    pub fn run(
        &mut self,
        task: &mut dyn TaskInfo,
        collab: &mut Collaborators<'_>,
        io: &mut RunIo<'_>,
        cancel: &CancelToken,
    ) -> Result<(), SessionError> {
        debug!(
            target: SESSION_TARGET,
            executable = %self.executable.display(),
            task = task.name(),
            "starting task run"
        );
        self.state = SessionState::Running;
        let result = self.run_loop(task, collab, io, cancel);
        self.state = match &result {
            Ok(()) => SessionState::Idle,
            Err(_) => SessionState::Failed,
        };
        result
    }

    fn run_loop(
        &mut self,
        task: &mut dyn TaskInfo,
        collab: &mut Collaborators<'_>,
        io: &mut RunIo<'_>,
        cancel: &CancelToken,
    ) -> Result<(), SessionError> {
        if !self.env_pending.is_empty() {
            let directives = self.env_pending.join("");
            self.env_pending.clear();
            self.write_text(&directives)?;
        }

        // Leading underscores are a driving-language naming convention the
        // peer does not know about.
        let name = task.name().strip_prefix('_').unwrap_or(task.name());
        let start = format!("{}{}\n", name, io.redirection_markers());
        self.write_text(&start)?;

        loop {
            if cancel.is_cancelled() {
                return Err(self.interrupted());
            }
            if self.residual.is_empty() {
                self.residual = self.read_text(cancel)?;
                continue;
            }

            let classified =
                message::classify(&self.residual).map_err(|err| SessionError::MalformedMessage {
                    executable: self.executable.clone(),
                    fragment: err.fragment,
                })?;
            self.residual.drain(..classified.consumed);

            match classified.kind {
                MessageKind::DataRequest { channel, nbytes } => {
                    if channel != CHAN_STDIN_FEED {
                        return Err(SessionError::UnsupportedTransferChannel {
                            executable: self.executable.clone(),
                            channel,
                        });
                    }
                    self.serve_transfer(nbytes, io)?;
                }
                MessageKind::DataDelivery { channel, nbytes } => {
                    self.deliver(channel, nbytes, collab, io, cancel)?;
                }
                MessageKind::Done => {
                    debug!(
                        target: SESSION_TARGET,
                        executable = %self.executable.display(),
                        task = task.name(),
                        "task signalled completion"
                    );
                    return Ok(());
                }
                MessageKind::PeerError { errno, text } => {
                    return Err(SessionError::Peer {
                        executable: self.executable.clone(),
                        task: task.name().to_owned(),
                        errno,
                        detail: text,
                    });
                }
                MessageKind::ParamGet { name } => self.handle_param_get(task, name)?,
                MessageKind::ParamSet { name, value } => {
                    self.handle_param_set(task, name, value)?;
                }
                MessageKind::GroupQuery => {
                    let group = collab.interpreter.current_group();
                    self.write_text(&format!("{group}\n"))?;
                }
                MessageKind::OsEscape { command } => self.handle_os_escape(&command, io)?,
                MessageKind::Command { line } => self.handle_command(&line, collab, io)?,
            }
        }
    }

    /// Serves an `xfer` stdin-feed request.
    ///
    /// Replies with two records: the decimal byte count, then the bytes.
    /// A line longer than the requested chunk is retained and delivered
    /// across as many requests as the peer makes; the peer keeps asking
    /// until it sees the newline.
    fn serve_transfer(&mut self, nbytes: usize, io: &mut RunIo<'_>) -> Result<(), SessionError> {
        let nchars = nbytes / 2;
        if self.transfer_pending.is_empty() {
            let mut line = Vec::new();
            io.stdin
                .read_until(b'\n', &mut line)
                .map_err(|source| SessionError::HostIo { source })?;
            self.transfer_pending = line;
        }
        let take = self.transfer_pending.len().min(nchars);
        let chunk: Vec<u8> = self.transfer_pending.drain(..take).collect();
        self.write_text(&take.to_string())?;
        self.write_framed(&wire::pack16(self.settings.byte_order, &chunk))
    }

    /// Routes an `xmit` data delivery by channel number.
    fn deliver(
        &mut self,
        channel: i32,
        nbytes: usize,
        collab: &mut Collaborators<'_>,
        io: &mut RunIo<'_>,
        cancel: &CancelToken,
    ) -> Result<(), SessionError> {
        let raw = self.read_frame(cancel)?;
        if raw.len() != nbytes * 2 {
            return Err(SessionError::LengthMismatch {
                executable: self.executable.clone(),
                channel,
                expected: nbytes * 2,
                got: raw.len(),
            });
        }
        match channel {
            CHAN_STDOUT => {
                let text = self.unpack(&raw)?;
                io.stdout
                    .write_all(&text)
                    .and_then(|()| io.stdout.flush())
                    .map_err(|source| SessionError::HostIo { source })?;
            }
            CHAN_STDERR => {
                let text = self.unpack(&raw)?;
                io.stderr
                    .write_all(&text)
                    .and_then(|()| io.stderr.flush())
                    .map_err(|source| SessionError::HostIo { source })?;
            }
            CHAN_GRAPHICS => {
                let words = self.words(&raw)?;
                collab.graphics.append(&words);
            }
            CHAN_IMAGE => self.notice(io, "data for image display\n")?,
            CHAN_PLOT => self.notice(io, "data for plot display\n")?,
            CHAN_CONTROL => self.handle_control(&raw, collab, io)?,
            other => self.notice(io, &format!("data for channel {other}\n"))?,
        }
        Ok(())
    }

    /// Handles a control sub-message multiplexed over the control channel.
    ///
    /// The first two words carry the target channel; which of the two holds
    /// it depends on the byte order, because the peer sends a four-byte
    /// integer split across two words. Only graphics control is
    /// implemented. A reply from the kernel goes straight back over the raw
    /// framed channel — the one message answered out of band.
    fn handle_control(
        &mut self,
        raw: &[u8],
        collab: &mut Collaborators<'_>,
        io: &mut RunIo<'_>,
    ) -> Result<(), SessionError> {
        let words = self.words(raw)?;
        if words.len() < 2 {
            return Err(SessionError::MalformedMessage {
                executable: self.executable.clone(),
                fragment: "control sub-message shorter than its address".to_owned(),
            });
        }
        let target = match self.settings.byte_order {
            ByteOrder::Big => words[1],
            ByteOrder::Little => words[0],
        };
        if i32::from(target) == CHAN_GRAPHICS {
            if let Some(reply) = collab.graphics.handle_control(&words[2..]) {
                self.write_framed(&reply)?;
            }
            Ok(())
        } else {
            self.notice(io, &format!("graphics control data for channel {target}\n"))
        }
    }

    /// Answers a parameter-get request, reporting list exhaustion as the
    /// bare `EOF` reply the peer expects.
    fn handle_param_get(
        &mut self,
        task: &mut dyn TaskInfo,
        name: String,
    ) -> Result<(), SessionError> {
        match task.get_param(&name) {
            Ok(ParamValue::Value(value)) => {
                let escaped = value.replace('\n', "\\n");
                self.write_text(&format!("{escaped}\n"))
            }
            Ok(ParamValue::Exhausted) => self.write_text("EOF\n"),
            Err(source) => Err(SessionError::Param {
                task: task.name().to_owned(),
                name,
                source,
            }),
        }
    }

    /// Applies a parameter-set notification. Validation failures are
    /// recovered locally: log a warning and force the value through.
    fn handle_param_set(
        &mut self,
        task: &mut dyn TaskInfo,
        name: String,
        value: String,
    ) -> Result<(), SessionError> {
        match task.set_param(&name, &value, true) {
            Ok(()) => Ok(()),
            Err(error @ ParamError::Invalid { .. }) => {
                warn!(
                    target: SESSION_TARGET,
                    task = task.name(),
                    parameter = %name,
                    error = %error,
                    "parameter value rejected; storing it unchecked"
                );
                task.set_param(&name, &value, false)
                    .map_err(|source| SessionError::Param {
                        task: task.name().to_owned(),
                        name,
                        source,
                    })
            }
            Err(source) => Err(SessionError::Param {
                task: task.name().to_owned(),
                name,
                source,
            }),
        }
    }

    /// Runs an OS escape as a literal shell command and replies with its
    /// exit status.
    fn handle_os_escape(&mut self, command: &str, io: &mut RunIo<'_>) -> Result<(), SessionError> {
        debug!(
            target: SESSION_TARGET,
            executable = %self.executable.display(),
            command,
            "running OS escape"
        );
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| SessionError::HostIo { source })?;
        io.stdout
            .write_all(&output.stdout)
            .and_then(|()| io.stderr.write_all(&output.stderr))
            .map_err(|source| SessionError::HostIo { source })?;
        let status = output.status.code().unwrap_or(-1);
        self.write_text(&format!("{status}\n"))
    }

    /// Hands an arbitrary command line to the interpreter.
    ///
    /// A command redirecting into the reserved in-band output file gets its
    /// captured output sent back to the peer, terminated by the fixed done
    /// marker; everything else writes its output to the task's stdout sink.
    fn handle_command(
        &mut self,
        line: &str,
        collab: &mut Collaborators<'_>,
        io: &mut RunIo<'_>,
    ) -> Result<(), SessionError> {
        if line.contains(IPC_OUT_FILE) {
            let suffix = format!("> {IPC_OUT_FILE}");
            let Some(stripped) = line.trim_end().strip_suffix(suffix.as_str()) else {
                return Err(SessionError::MalformedMessage {
                    executable: self.executable.clone(),
                    fragment: line.to_owned(),
                });
            };
            let mut command = stripped.to_owned();
            command.push('\n');
            let mut output = collab.interpreter.execute(&command);
            output.push_str(IPC_DONE_MARK);
            return self.write_text(&output);
        }
        let output = collab.interpreter.execute(line);
        if !output.is_empty() {
            io.stdout
                .write_all(output.as_bytes())
                .and_then(|()| io.stdout.flush())
                .map_err(|source| SessionError::HostIo { source })?;
        }
        Ok(())
    }

    fn notice(&self, io: &mut RunIo<'_>, text: &str) -> Result<(), SessionError> {
        io.stdout
            .write_all(text.as_bytes())
            .and_then(|()| io.stdout.flush())
            .map_err(|source| SessionError::HostIo { source })
    }

    /// Standard termination: ask the peer to say `bye`, wait briefly for it
    /// to exit, then kill it if it is still hanging around. Calling this on
    /// an already-dead session is a no-op.
    pub fn terminate(&mut self) {
        if !self.channel.is_alive() {
            return;
        }
        if let Err(error) = self.write_text("bye\n") {
            debug!(
                target: SESSION_TARGET,
                executable = %self.executable.display(),
                error = %error,
                "peer did not accept the goodbye"
            );
        }
        if !self.channel.wait(TERMINATE_GRACE) {
            if let Err(error) = self.channel.force_kill() {
                warn!(
                    target: SESSION_TARGET,
                    executable = %self.executable.display(),
                    error = %error,
                    "failed to terminate task executable"
                );
            }
        }
    }

    /// Kills the process without asking; for error paths and interrupts,
    /// where a suspended or wedged peer cannot be trusted to answer a
    /// graceful request.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unkillable`] when the process survives the
    /// escalation sequence.
    pub fn kill(&mut self) -> Result<(), ChannelError> {
        self.channel.force_kill()
    }

    fn interrupted(&self) -> SessionError {
        SessionError::Interrupted {
            executable: self.executable.clone(),
        }
    }

    /// Waits, bounded by the peer timeout, for the next record to begin.
    fn await_data(&mut self, cancel: &CancelToken) -> Result<(), SessionError> {
        let started = Instant::now();
        let deadline = started + self.settings.peer_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(self.interrupted());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(self.settings.poll_interval);
            if self.channel.peek_byte(slice)?.is_some() {
                return Ok(());
            }
            if self.channel.at_eof() {
                return Err(SessionError::Disconnected {
                    executable: self.executable.clone(),
                });
            }
            if Instant::now() >= deadline {
                return Err(SessionError::PeerTimeout {
                    executable: self.executable.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    /// Reads one record's payload.
    fn read_frame(&mut self, cancel: &CancelToken) -> Result<Vec<u8>, SessionError> {
        self.await_data(cancel)?;
        let header = self
            .channel
            .read_exact(wire::HEADER_LEN, self.settings.peer_timeout)?;
        let length = wire::decode_header(self.settings.byte_order, &header).map_err(|source| {
            SessionError::Wire {
                executable: self.executable.clone(),
                source,
            }
        })?;
        let expected = usize::from(length);
        let payload = self.channel.read_exact(expected, self.settings.peer_timeout)?;
        if payload.len() < expected {
            return Err(SessionError::Wire {
                executable: self.executable.clone(),
                source: WireError::TruncatedPayload {
                    expected,
                    got: payload.len(),
                },
            });
        }
        Ok(payload)
    }

    /// Reads one record and decodes it as packed text.
    fn read_text(&mut self, cancel: &CancelToken) -> Result<String, SessionError> {
        let raw = self.read_frame(cancel)?;
        let bytes = self.unpack(&raw)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn unpack(&self, raw: &[u8]) -> Result<Vec<u8>, SessionError> {
        wire::unpack16(self.settings.byte_order, raw).map_err(|source| SessionError::Wire {
            executable: self.executable.clone(),
            source,
        })
    }

    fn words(&self, raw: &[u8]) -> Result<Vec<i16>, SessionError> {
        wire::words16(self.settings.byte_order, raw).map_err(|source| SessionError::Wire {
            executable: self.executable.clone(),
            source,
        })
    }

    /// Packs text and writes it as one or more records.
    fn write_text(&mut self, text: &str) -> Result<(), SessionError> {
        self.write_framed(&wire::pack16(self.settings.byte_order, text.as_bytes()))
    }

    /// Writes already-packed payload bytes, splitting long payloads into
    /// block-sized records.
    fn write_framed(&mut self, packed: &[u8]) -> Result<(), SessionError> {
        if packed.is_empty() {
            let record = wire::frame_record(self.settings.byte_order, &[]);
            return self
                .channel
                .write(&record, self.settings.write_timeout)
                .map_err(Into::into);
        }
        for chunk in packed.chunks(self.settings.frame_block) {
            let record = wire::frame_record(self.settings.byte_order, chunk);
            self.channel.write(&record, self.settings.write_timeout)?;
        }
        Ok(())
    }
}

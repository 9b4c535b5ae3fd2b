//! Test doubles: scripted channels, recording collaborators, frame helpers.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use corral_config::ByteOrder;

use crate::cache::Launcher;
use crate::channel::Channel;
use crate::errors::{ChannelError, ParamError};
use crate::task::{GraphicsSink, Interpreter, ParamValue, TaskInfo};
use crate::wire;

/// Shared observation point for one scripted channel, kept by the test
/// while the channel itself moves into a session.
#[derive(Debug, Default)]
pub struct ScriptLog {
    /// Everything the session wrote to the peer.
    pub written: Mutex<Vec<u8>>,
    /// Whether the escalating kill sequence ran.
    pub killed: AtomicBool,
    /// Whether the process is considered alive.
    pub alive: AtomicBool,
}

impl ScriptLog {
    pub fn written_bytes(&self) -> Vec<u8> {
        match self.written.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// In-memory channel that replays a scripted peer byte stream.
///
/// When the script runs out, the channel pretends the peer has gone quiet
/// (sleeping through bounded waits) rather than signalling end-of-stream,
/// which is what an unresponsive process looks like. The simulated process
/// "exits" as soon as anyone waits for it, so graceful termination succeeds
/// without a kill.
pub struct ScriptedChannel {
    executable: PathBuf,
    input: Vec<u8>,
    pos: usize,
    log: Arc<ScriptLog>,
}

impl ScriptedChannel {
    pub fn new(executable: impl Into<PathBuf>, input: Vec<u8>) -> (Self, Arc<ScriptLog>) {
        let log = Arc::new(ScriptLog::default());
        log.alive.store(true, Ordering::SeqCst);
        let channel = Self {
            executable: executable.into(),
            input,
            pos: 0,
            log: Arc::clone(&log),
        };
        (channel, log)
    }

    fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let take = n.min(self.remaining());
        let chunk = self.input[self.pos..self.pos + take].to_vec();
        self.pos += take;
        chunk
    }
}

impl Channel for ScriptedChannel {
    fn executable(&self) -> &Path {
        &self.executable
    }

    fn is_alive(&mut self) -> bool {
        self.log.is_alive()
    }

    fn at_eof(&self) -> bool {
        false
    }

    fn write(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), ChannelError> {
        if !self.log.is_alive() {
            return Err(ChannelError::Dead {
                executable: self.executable.clone(),
            });
        }
        match self.log.written.lock() {
            Ok(mut guard) => guard.extend_from_slice(bytes),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(bytes),
        }
        Ok(())
    }

    fn peek_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ChannelError> {
        if self.remaining() == 0 {
            thread::sleep(timeout);
            return Ok(None);
        }
        Ok(self.input.get(self.pos).copied())
    }

    fn read_pending(&mut self, max: usize) -> Result<Vec<u8>, ChannelError> {
        Ok(self.take(max))
    }

    fn read_line(&mut self, _blocking: bool, _timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let newline = self.input[self.pos..].iter().position(|&b| b == b'\n');
        match newline {
            Some(offset) => Ok(self.take(offset + 1)),
            None => Ok(self.take(self.remaining())),
        }
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        if self.remaining() < n {
            thread::sleep(timeout);
            return Err(ChannelError::ReadTimeout {
                executable: self.executable.clone(),
                waited_ms: timeout.as_millis() as u64,
            });
        }
        Ok(self.take(n))
    }

    fn suspend(&mut self) -> bool {
        self.log.is_alive()
    }

    fn resume(&mut self) -> bool {
        self.log.is_alive()
    }

    fn wait(&mut self, _timeout: Duration) -> bool {
        // the scripted peer exits as soon as it is waited for
        self.log.mark_dead();
        true
    }

    fn terminate(&mut self, _grace: Duration) {
        self.log.mark_dead();
    }

    fn force_kill(&mut self) -> Result<(), ChannelError> {
        if self.log.is_alive() {
            self.log.killed.store(true, Ordering::SeqCst);
            self.log.mark_dead();
        }
        Ok(())
    }
}

/// Launcher vending scripted channels, with per-executable scripts and a
/// shared record of every channel it created.
#[derive(Default)]
pub struct ScriptedLauncher {
    scripts: HashMap<PathBuf, VecDeque<Vec<u8>>>,
    created: Arc<Mutex<Vec<(PathBuf, Arc<ScriptLog>)>>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a scripted peer byte stream for the next launch of
    /// `executable`.
    pub fn script(&mut self, executable: impl Into<PathBuf>, input: Vec<u8>) {
        self.scripts
            .entry(executable.into())
            .or_default()
            .push_back(input);
    }

    /// Shared handle to the creation record.
    pub fn created(&self) -> Arc<Mutex<Vec<(PathBuf, Arc<ScriptLog>)>>> {
        Arc::clone(&self.created)
    }
}

/// Number of channels a creation record has seen.
pub fn launch_count(created: &Arc<Mutex<Vec<(PathBuf, Arc<ScriptLog>)>>>) -> usize {
    match created.lock() {
        Ok(guard) => guard.len(),
        Err(poisoned) => poisoned.into_inner().len(),
    }
}

/// Log handle of the `index`-th created channel.
pub fn launched_log(
    created: &Arc<Mutex<Vec<(PathBuf, Arc<ScriptLog>)>>>,
    index: usize,
) -> Arc<ScriptLog> {
    match created.lock() {
        Ok(guard) => Arc::clone(&guard[index].1),
        Err(poisoned) => Arc::clone(&poisoned.into_inner()[index].1),
    }
}

impl Launcher for ScriptedLauncher {
    type Chan = ScriptedChannel;

    fn launch(&mut self, executable: &Path) -> Result<ScriptedChannel, ChannelError> {
        let input = self
            .scripts
            .get_mut(executable)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        let (channel, log) = ScriptedChannel::new(executable, input);
        match self.created.lock() {
            Ok(mut guard) => guard.push((executable.to_path_buf(), log)),
            Err(poisoned) => poisoned
                .into_inner()
                .push((executable.to_path_buf(), log)),
        }
        Ok(channel)
    }
}

/// Task double with a flat parameter map, a set of list parameters that
/// are already exhausted, and a set of parameters whose strict validation
/// fails.
pub struct StubTask {
    pub name: String,
    pub executable: PathBuf,
    pub params: HashMap<String, String>,
    pub exhausted: Vec<String>,
    pub invalid: Vec<String>,
    pub set_calls: Vec<(String, String, bool)>,
}

impl StubTask {
    pub fn new(name: &str, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_owned(),
            executable: executable.into(),
            params: HashMap::new(),
            exhausted: Vec::new(),
            invalid: Vec::new(),
            set_calls: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_owned(), value.to_owned());
        self
    }
}

impl TaskInfo for StubTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn executable(&self) -> &Path {
        &self.executable
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, ParamError> {
        if self.exhausted.iter().any(|p| p == name) {
            return Ok(ParamValue::Exhausted);
        }
        match self.params.get(name) {
            Some(value) => Ok(ParamValue::Value(value.clone())),
            None => Err(ParamError::Unknown {
                task: self.name.clone(),
                name: name.to_owned(),
            }),
        }
    }

    fn set_param(&mut self, name: &str, value: &str, strict: bool) -> Result<(), ParamError> {
        self.set_calls
            .push((name.to_owned(), value.to_owned(), strict));
        if strict && self.invalid.iter().any(|p| p == name) {
            return Err(ParamError::Invalid {
                name: name.to_owned(),
                value: value.to_owned(),
                message: "value is not in range".to_owned(),
            });
        }
        self.params.insert(name.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Interpreter double recording every line and answering from a canned map.
#[derive(Default)]
pub struct RecordingInterpreter {
    pub lines: Vec<String>,
    pub responses: HashMap<String, String>,
    pub group: String,
}

impl RecordingInterpreter {
    pub fn with_group(group: &str) -> Self {
        Self {
            group: group.to_owned(),
            ..Self::default()
        }
    }
}

impl Interpreter for RecordingInterpreter {
    fn execute(&mut self, line: &str) -> String {
        self.lines.push(line.to_owned());
        self.responses.get(line).cloned().unwrap_or_default()
    }

    fn current_group(&self) -> String {
        self.group.clone()
    }
}

/// Graphics double recording payloads and optionally answering control
/// messages.
#[derive(Default)]
pub struct RecordingGraphics {
    pub appended: Vec<Vec<i16>>,
    pub controls: Vec<Vec<i16>>,
    pub control_reply: Option<Vec<u8>>,
}

impl GraphicsSink for RecordingGraphics {
    fn append(&mut self, payload: &[i16]) {
        self.appended.push(payload.to_vec());
    }

    fn handle_control(&mut self, payload: &[i16]) -> Option<Vec<u8>> {
        self.controls.push(payload.to_vec());
        self.control_reply.clone()
    }
}

/// Focus double counting restorations.
#[derive(Default)]
pub struct RecordingFocus {
    pub restores: usize,
}

impl crate::task::FocusManager for RecordingFocus {
    fn restore_last(&mut self) {
        self.restores += 1;
    }

    fn reset_history(&mut self) {}
}

/// Concatenates text frames into one scripted peer stream.
pub fn text_frames(order: ByteOrder, messages: &[&str]) -> Vec<u8> {
    messages
        .iter()
        .flat_map(|message| wire::encode_frame(order, message))
        .collect()
}

/// Builds an `xmit` delivery: the announcement frame plus the data frame.
pub fn delivery(order: ByteOrder, channel: i32, text: &str) -> Vec<u8> {
    let mut stream = wire::encode_frame(order, &format!("xmit({channel},{})\n", text.len()));
    stream.extend_from_slice(&wire::encode_frame(order, text));
    stream
}

/// Builds an `xmit` delivery carrying raw 16-bit words.
pub fn word_delivery(order: ByteOrder, channel: i32, words: &[i16]) -> Vec<u8> {
    let payload: Vec<u8> = words
        .iter()
        .flat_map(|&word| wire::word_to_bytes(order, word as u16))
        .collect();
    let mut stream = wire::encode_frame(order, &format!("xmit({channel},{})\n", words.len()));
    stream.extend_from_slice(&wire::frame_record(order, &payload));
    stream
}

/// Splits a written byte stream back into decoded text frames.
pub fn decode_written(order: ByteOrder, mut bytes: &[u8]) -> Vec<String> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        let Ok(length) = wire::decode_header(order, &bytes[..wire::HEADER_LEN.min(bytes.len())])
        else {
            panic!("written stream does not start with a record header");
        };
        let length = usize::from(length);
        let payload = &bytes[wire::HEADER_LEN..wire::HEADER_LEN + length];
        let Ok(text) = wire::unpack16(order, payload) else {
            panic!("written record has an odd payload");
        };
        frames.push(String::from_utf8_lossy(&text).into_owned());
        bytes = &bytes[wire::HEADER_LEN + length..];
    }
    frames
}

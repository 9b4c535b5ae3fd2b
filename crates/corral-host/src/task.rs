//! Collaborator seams consumed by a protocol session.
//!
//! The session drives these traits instead of the front-end's real parameter
//! store, interpreter, and graphics kernel, so a headless embedding (or a
//! test) can plug in lightweight implementations. The no-op implementations
//! here are complete enough for running tasks that never touch graphics or
//! window focus.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::errors::ParamError;

/// Result of a parameter-get request.
///
/// List-style parameters yield values one at a time and eventually run out;
/// exhaustion is an ordinary outcome the peer is told about with an `EOF`
/// reply, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// The parameter's current value.
    Value(String),
    /// A list parameter has no more values.
    Exhausted,
}

/// The logical task a session runs, together with its parameter store.
pub trait TaskInfo {
    /// The task's name as the peer executable knows it.
    fn name(&self) -> &str;

    /// Absolute path of the executable that hosts this task.
    fn executable(&self) -> &Path;

    /// Looks up a parameter value for a `=name` request.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError::Unknown`] when the task defines no such
    /// parameter. Exhaustion of a list parameter is *not* an error; it is
    /// reported as [`ParamValue::Exhausted`].
    fn get_param(&mut self, name: &str) -> Result<ParamValue, ParamError>;

    /// Stores a parameter value from a `name = value` notification.
    ///
    /// With `strict` set the store validates the value against the
    /// parameter's type; without it the value is written as-is.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError::Invalid`] when strict validation rejects the
    /// value and [`ParamError::Unknown`] for an undefined parameter.
    fn set_param(&mut self, name: &str, value: &str, strict: bool) -> Result<(), ParamError>;
}

/// Sink for the graphics metacode channels.
pub trait GraphicsSink {
    /// Receives a metacode payload from the graphics data channel.
    fn append(&mut self, payload: &[i16]);

    /// Handles a control sub-message addressed to the graphics kernel.
    ///
    /// A `Some` return is a reply payload the session writes straight back
    /// to the peer over the raw framed channel.
    fn handle_control(&mut self, payload: &[i16]) -> Option<Vec<u8>>;
}

/// Graphics sink that discards everything; suitable for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGraphics;

impl GraphicsSink for NullGraphics {
    fn append(&mut self, _payload: &[i16]) {}

    fn handle_control(&mut self, _payload: &[i16]) -> Option<Vec<u8>> {
        None
    }
}

/// The driving-language interpreter a peer can hand command lines to.
pub trait Interpreter {
    /// Executes one command line and returns whatever output it generated.
    fn execute(&mut self, line: &str) -> String;

    /// Name of the currently active task group.
    fn current_group(&self) -> String;
}

/// Window-focus bookkeeping restored around every run.
pub trait FocusManager {
    /// Returns focus to wherever it was before the run started.
    fn restore_last(&mut self);

    /// Forgets the recorded focus history.
    fn reset_history(&mut self);
}

/// Focus manager that does nothing; suitable for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFocus;

impl FocusManager for NullFocus {
    fn restore_last(&mut self) {}

    fn reset_history(&mut self) {}
}

/// The non-task collaborators a run needs.
pub struct Collaborators<'a> {
    /// Sink for graphics data and control messages.
    pub graphics: &'a mut dyn GraphicsSink,
    /// Interpreter for command lines the peer sends back.
    pub interpreter: &'a mut dyn Interpreter,
}

/// Standard I/O bindings for one task run.
pub struct RunIo<'a> {
    /// Source the peer's stdin-feed requests are served from.
    pub stdin: &'a mut dyn BufRead,
    /// Sink for the peer's stdout channel.
    pub stdout: &'a mut dyn Write,
    /// Sink for the peer's stderr channel.
    pub stderr: &'a mut dyn Write,
    /// Whether stdin was redirected away from the terminal.
    pub stdin_redirected: bool,
    /// Whether stdout or stderr was redirected away from the terminal.
    pub output_redirected: bool,
}

impl<'a> RunIo<'a> {
    /// Binds the three streams with no redirections flagged.
    pub fn new(
        stdin: &'a mut dyn BufRead,
        stdout: &'a mut dyn Write,
        stderr: &'a mut dyn Write,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            stdin_redirected: false,
            output_redirected: false,
        }
    }

    /// The redirection marker string appended to the task start line.
    #[must_use]
    pub fn redirection_markers(&self) -> &'static str {
        match (self.stdin_redirected, self.output_redirected) {
            (true, true) => "<>",
            (true, false) => "<",
            (false, true) => ">",
            (false, false) => "",
        }
    }
}

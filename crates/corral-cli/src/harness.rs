//! Collaborator implementations backing the CLI.
//!
//! The CLI has no command-language interpreter and no parameter-type
//! machinery; it serves parameters from a flat `--param` map and logs
//! anything a task asks of the interpreter seam.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use corral_host::{Interpreter, ParamError, ParamValue, TaskInfo};

/// Log target for the CLI harness.
const HARNESS_TARGET: &str = "corral_cli::harness";

/// Task backed by a flat name/value parameter map.
pub struct CliTask {
    name: String,
    executable: PathBuf,
    params: HashMap<String, String>,
}

impl CliTask {
    /// Builds a task for one run.
    pub fn new(name: &str, executable: &Path, params: HashMap<String, String>) -> Self {
        Self {
            name: name.to_owned(),
            executable: executable.to_path_buf(),
            params,
        }
    }
}

impl TaskInfo for CliTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn executable(&self) -> &Path {
        &self.executable
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, ParamError> {
        match self.params.get(name) {
            Some(value) => Ok(ParamValue::Value(value.clone())),
            None => Err(ParamError::Unknown {
                task: self.name.clone(),
                name: name.to_owned(),
            }),
        }
    }

    fn set_param(&mut self, name: &str, value: &str, _strict: bool) -> Result<(), ParamError> {
        // no type information on the command line; accept everything
        self.params.insert(name.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Interpreter seam for a front-end with no command language: command
/// lines are logged and dropped, and the group name is fixed.
pub struct LoggingInterpreter {
    group: String,
}

impl LoggingInterpreter {
    /// Builds an interpreter reporting `group` as the active task group.
    pub fn new(group: &str) -> Self {
        Self {
            group: group.to_owned(),
        }
    }
}

impl Interpreter for LoggingInterpreter {
    fn execute(&mut self, line: &str) -> String {
        warn!(
            target: HARNESS_TARGET,
            line = line.trim_end(),
            "task sent a command line; no interpreter is attached"
        );
        String::new()
    }

    fn current_group(&self) -> String {
        self.group.clone()
    }
}

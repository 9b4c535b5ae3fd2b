//! Operational CLI around the corral process host.
//!
//! `corral run <executable> <task>…` drives one task executable through the
//! shared process cache, serving parameters from the command line, and can
//! finish by listing the cached processes the way an interactive front-end
//! would in its diagnostics view.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tracing::error;

use corral_config::Config;
use corral_host::{
    CancelToken, Collaborators, EnvVars, NullFocus, NullGraphics, Orchestrator, PipeLauncher,
    ProcessCache, RunIo, SharedCache,
};

mod cli;
mod harness;
pub mod telemetry;

use cli::{Cli, CliCommand, split_assignment};
use harness::{CliTask, LoggingInterpreter};

/// Task group name reported for `_curpack` queries.
const GROUP_NAME: &str = "corral";

/// Parses arguments, configures telemetry, and executes the command.
pub fn run<I, T>(args: I, stdout: &mut dyn Write, stderr: &mut dyn Write) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(parse_error) => {
            let rendered = parse_error.render().to_string();
            return match parse_error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = write!(stdout, "{rendered}");
                    ExitCode::SUCCESS
                }
                _ => {
                    let _ = write!(stderr, "{rendered}");
                    ExitCode::from(2)
                }
            };
        }
    };

    match build_config(&cli) {
        Ok(config) => {
            if let Err(telemetry_error) = telemetry::initialise(&config) {
                let _ = writeln!(stderr, "corral: {telemetry_error}");
                return ExitCode::FAILURE;
            }
            execute(cli.command, &config, stdout, stderr)
        }
        Err(message) => {
            let _ = writeln!(stderr, "corral: {message}");
            ExitCode::from(2)
        }
    }
}

/// Applies command-line overrides on top of the default configuration.
fn build_config(cli: &Cli) -> Result<Config, String> {
    let mut config = Config::default();
    if let Some(filter) = &cli.log_filter {
        config.log_filter = filter.clone();
    }
    if let Some(format) = &cli.log_format {
        config.log_format = format
            .parse()
            .map_err(|_| format!("unknown log format `{format}`"))?;
    }
    let CliCommand::Run {
        capacity,
        timeout_ms,
        byte_order,
        ..
    } = &cli.command;
    if let Some(capacity) = capacity {
        config.cache_capacity = *capacity;
    }
    if let Some(timeout_ms) = timeout_ms {
        config.peer_timeout_ms = *timeout_ms;
    }
    if let Some(order) = byte_order {
        config.byte_order = order
            .parse()
            .map_err(|_| format!("unknown byte order `{order}`"))?;
    }
    Ok(config)
}

fn execute(
    command: CliCommand,
    config: &Config,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> ExitCode {
    let CliCommand::Run {
        executable,
        tasks,
        env,
        param,
        list,
        ..
    } = command;

    let env_vars = match parse_assignments(&env) {
        Ok(pairs) => pairs.into_iter().collect::<EnvVars>(),
        Err(message) => {
            let _ = writeln!(stderr, "corral: {message}");
            return ExitCode::from(2);
        }
    };
    let params = match parse_assignments(&param) {
        Ok(pairs) => pairs.into_iter().collect::<HashMap<_, _>>(),
        Err(message) => {
            let _ = writeln!(stderr, "corral: {message}");
            return ExitCode::from(2);
        }
    };

    let cache = SharedCache::new(ProcessCache::new(PipeLauncher::from_config(config), config));
    let orchestrator = Orchestrator::new(cache);

    let cancel = CancelToken::new();
    install_interrupt(&cancel);

    let stdin = io::stdin();
    let mut stdin_lock = stdin.lock();
    let mut graphics = NullGraphics;
    let mut interpreter = LoggingInterpreter::new(GROUP_NAME);
    let mut focus = NullFocus;

    for task_name in &tasks {
        let mut task = CliTask::new(task_name, &executable, params.clone());
        let result = {
            let mut run_io = RunIo::new(&mut stdin_lock, &mut *stdout, &mut *stderr);
            let mut collab = Collaborators {
                graphics: &mut graphics,
                interpreter: &mut interpreter,
            };
            orchestrator.run(
                &mut task,
                &env_vars,
                &mut run_io,
                &mut collab,
                &mut focus,
                &cancel,
            )
        };
        if let Err(run_error) = result {
            error!(task = task_name.as_str(), error = %run_error, "task run failed");
            let _ = writeln!(stderr, "corral: {run_error}");
            return ExitCode::FAILURE;
        }
    }

    if list {
        match orchestrator.cache().with_cache(|cache| cache.list()) {
            Ok(rows) => {
                for (position, row) in rows.iter().enumerate() {
                    let pin = if row.locked { "L" } else { " " };
                    let _ = writeln!(
                        stdout,
                        "{:2}: {} {}",
                        position + 1,
                        pin,
                        row.executable.display()
                    );
                }
            }
            Err(cache_error) => {
                let _ = writeln!(stderr, "corral: {cache_error}");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

fn parse_assignments(assignments: &[String]) -> Result<Vec<(String, String)>, String> {
    assignments.iter().map(|text| split_assignment(text)).collect()
}

/// Routes SIGINT to the run's cancellation token, so an interrupted run
/// kills the child instead of orphaning it.
fn install_interrupt(cancel: &CancelToken) {
    if let Err(signal_error) =
        signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.as_flag())
    {
        error!(error = %signal_error, "cannot install interrupt handler");
    }
}

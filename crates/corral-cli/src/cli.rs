//! CLI argument definitions for the corral binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command-line interface for the corral process host.
#[derive(Parser, Debug)]
#[command(name = "corral", disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// Log filter expression (overrides the configured default).
    #[arg(long, value_name = "FILTER")]
    pub(crate) log_filter: Option<String>,
    /// Log output format: `compact` or `json`.
    #[arg(long, value_name = "FORMAT")]
    pub(crate) log_format: Option<String>,
    /// The operation to perform.
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Structured subcommands for the corral CLI.
#[derive(Subcommand, Debug, Clone)]
pub(crate) enum CliCommand {
    /// Runs one or more tasks inside a task executable.
    Run {
        /// Path of the task executable to drive.
        #[arg(value_name = "EXECUTABLE")]
        executable: PathBuf,
        /// Logical task names to run, in order.
        #[arg(value_name = "TASK", required = true)]
        tasks: Vec<String>,
        /// Environment directives pushed during setup, as `name=value`.
        #[arg(long, value_name = "NAME=VALUE")]
        env: Vec<String>,
        /// Parameter values served to the tasks, as `name=value`.
        #[arg(long, value_name = "NAME=VALUE")]
        param: Vec<String>,
        /// Process cache capacity.
        #[arg(long, value_name = "N")]
        capacity: Option<usize>,
        /// Peer-response timeout in milliseconds.
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
        /// Wire byte order: `big` or `little`.
        #[arg(long, value_name = "ORDER")]
        byte_order: Option<String>,
        /// Prints the cached processes, newest first, after the runs.
        #[arg(long)]
        list: bool,
    },
}

/// Splits one `name=value` argument.
pub(crate) fn split_assignment(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_owned(), value.to_owned())),
        _ => Err(format!("`{text}` is not of the form name=value")),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn splits_assignments() {
        assert_eq!(
            split_assignment("stdimage=imt1024"),
            Ok(("stdimage".to_owned(), "imt1024".to_owned()))
        );
    }

    #[rstest]
    #[case::no_equals("stdimage")]
    #[case::empty_name("=imt1024")]
    fn rejects_bad_assignments(#[case] text: &str) {
        assert!(split_assignment(text).is_err());
    }

    #[rstest]
    fn parses_a_run_invocation() {
        let Ok(cli) = Cli::try_parse_from([
            "corral",
            "run",
            "/iraf/bin/x_images.e",
            "imstat",
            "--param",
            "images=*.fits",
            "--list",
        ]) else {
            panic!("run invocation should parse");
        };
        let CliCommand::Run {
            executable,
            tasks,
            param,
            list,
            ..
        } = cli.command;
        assert_eq!(executable, PathBuf::from("/iraf/bin/x_images.e"));
        assert_eq!(tasks, vec!["imstat".to_owned()]);
        assert_eq!(param, vec!["images=*.fits".to_owned()]);
        assert!(list);
    }

    #[rstest]
    fn run_requires_a_task() {
        assert!(Cli::try_parse_from(["corral", "run", "/iraf/bin/x_images.e"]).is_err());
    }
}

//! CLI entrypoint for the corral process host.
//!
//! The binary delegates to [`corral_cli::run`], which parses arguments,
//! configures telemetry, and drives task executables through the shared
//! process cache.

use std::io::{self, StderrLock, StdoutLock};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stdout: StdoutLock<'_> = io::stdout().lock();
    let mut stderr: StderrLock<'_> = io::stderr().lock();
    corral_cli::run(std::env::args_os(), &mut stdout, &mut stderr)
}

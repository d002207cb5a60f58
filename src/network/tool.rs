//! Invocation of ip(8) and iptables(8)
//!
//! Tools run with an empty environment: the caller's variables never reach
//! a command running as root.

use crate::error::{Error, Result};
use std::path::Path;
use std::process::{Command, Output};
use tracing::debug;

/// Human-readable command line, used as the operation name in errors
pub fn describe(program: &Path, args: &[&str]) -> String {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());

    std::iter::once(name.as_str())
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a tool and return its output whatever the exit status
pub fn output(program: &Path, args: &[&str]) -> Result<Output> {
    debug!(command = %describe(program, args), "Running");

    Command::new(program)
        .args(args)
        .env_clear()
        .output()
        .map_err(|e| Error::privileged(describe(program, args), e))
}

/// Run a tool, failing unless it exits successfully
pub fn run(program: &Path, args: &[&str]) -> Result<()> {
    let output = output(program, args)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::privileged(describe(program, args), stderr.trim()));
    }

    Ok(())
}

//! Replacing the current process with the recorded shell

use crate::error::{Error, Result};
use crate::sys::Environment;
use nix::sys::signal::{SigHandler, SigSet, Signal, signal};
use nix::unistd::execve;
use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;

/// Everything needed to exec the shell, prepared before the final exec so
/// that conversion errors surface as ordinary errors
#[derive(Debug)]
pub struct ShellImage {
    program: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
    signal_mask: SigSet,
}

impl ShellImage {
    /// Prepare `shell` as an argument-less command with `env` as its
    /// environment and `signal_mask` as its blocked set
    pub fn new(shell: &Path, env: &Environment, signal_mask: SigSet) -> Result<Self> {
        let program = CString::new(shell.as_os_str().as_bytes())
            .map_err(|e| Error::Environment(format!("invalid shell path: {}", e)))?;

        Ok(Self {
            argv: vec![program.clone()],
            program,
            env: env.to_cstrings()?,
            signal_mask,
        })
    }

    /// Get the program path
    pub fn program(&self) -> &CString {
        &self.program
    }

    /// Replace the current process with the shell
    ///
    /// Restores the signal disposition a freshly started program expects:
    /// the given mask, and default SIGPIPE handling. Only returns on failure.
    pub fn exec(self) -> Result<Infallible> {
        self.signal_mask
            .thread_set_mask()
            .map_err(|e| Error::privileged("sigprocmask", e))?;

        unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }
            .map_err(|e| Error::privileged("signal SIGPIPE", e))?;

        debug!(program = ?self.program, "Executing shell");
        execve(&self.program, &self.argv, &self.env)
            .map_err(|e| Error::privileged(format!("execve {:?}", self.program), e))
    }
}

//! Scoped entry into another process's network namespace

use crate::error::{Error, Result};
use nix::sched::{CloneFlags, setns};
use nix::unistd::Pid;
use std::fs::File;
use tracing::{debug, error};

/// Handle on the namespace to return to
///
/// Restoring happens on drop as well, so an unwinding panic inside the
/// scoped closure cannot leave the caller in the wrong namespace.
struct NamespaceGuard {
    original: Option<File>,
}

impl NamespaceGuard {
    fn restore(&mut self) -> Result<()> {
        match self.original.take() {
            Some(original) => setns(&original, CloneFlags::CLONE_NEWNET)
                .map_err(|e| Error::privileged("setns (restore)", e)),
            None => Ok(()),
        }
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            // Carrying on in the container namespace would misconfigure the host
            error!(error = %e, "Cannot return to original network namespace");
            std::process::abort();
        }
    }
}

/// Run `f` inside the network namespace of `pid`, then return to the
/// caller's namespace whatever `f` returned
pub fn in_network_namespace<T>(pid: Pid, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let original = File::open("/proc/self/ns/net")?;
    let target = File::open(format!("/proc/{}/ns/net", pid))?;

    setns(&target, CloneFlags::CLONE_NEWNET)
        .map_err(|e| Error::privileged(format!("setns into namespace of {}", pid), e))?;
    debug!(%pid, "Entered network namespace");

    let mut guard = NamespaceGuard {
        original: Some(original),
    };
    let result = f();
    guard.restore()?;

    debug!(%pid, "Returned to original network namespace");
    result
}

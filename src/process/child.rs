//! Supervised child processes
//!
//! A child is created with clone(2) so it can optionally start in a fresh
//! network namespace. The parent keeps a `ChildProcess` handle that tracks
//! the child's lifecycle from wait(2) statuses; dropping the handle kills
//! and reaps a child that is still alive.

use crate::error::{Error, Result};
use crate::process::state::{ChildState, Lifecycle};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// Stack given to a cloned child
const STACK_SIZE: usize = 8 * 1024 * 1024;

/// Shell convention for a child killed by a signal
const SIGNAL_EXIT_BASE: i32 = 128;

/// Namespaces a new child starts in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Share every namespace with the parent
    Shared,
    /// Start in a new, empty network namespace
    NetworkNamespace,
}

impl Isolation {
    fn clone_flags(self) -> CloneFlags {
        match self {
            Isolation::Shared => CloneFlags::empty(),
            Isolation::NetworkNamespace => CloneFlags::CLONE_NEWNET,
        }
    }
}

/// What the supervisor needs from a child
pub trait Supervised {
    /// Process id of the child
    fn pid(&self) -> Pid;
    /// Collect any status change without blocking
    fn wait(&mut self) -> Result<()>;
    /// Send SIGCONT and record the child as running
    fn resume(&mut self) -> Result<()>;
    /// Deliver a signal; the state changes only once wait observes it
    fn signal(&mut self, signal: Signal) -> Result<()>;
    /// Current lifecycle state
    fn state(&self) -> ChildState;
    /// Exit status, once terminated
    fn exit_status(&self) -> Option<i32>;

    fn running(&self) -> bool {
        self.state() == ChildState::Running
    }

    fn stopped(&self) -> bool {
        self.state() == ChildState::Stopped
    }

    fn terminated(&self) -> bool {
        self.state() == ChildState::Terminated
    }
}

/// Handle on a live or reaped child
pub struct ChildProcess {
    name: String,
    pid: Pid,
    lifecycle: Lifecycle,
    exit_status: Option<i32>,
    /// SIGKILL already sent; only reaping is left
    killed: bool,
}

impl ChildProcess {
    /// Clone a child that runs `body` and exits with its status
    ///
    /// An error from `body` is printed to stderr and the child exits with
    /// status 1. The child shares nothing with the parent but what the
    /// isolation level leaves shared; `body` sees a copy of the parent's
    /// memory.
    pub fn spawn<F>(name: &str, isolation: Isolation, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<i32>,
    {
        let mut body = Some(body);
        let callback = Box::new(move || -> isize {
            let status = match body.take() {
                Some(body) => match body() {
                    Ok(status) => status,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        1
                    }
                },
                None => 1,
            };
            status as isize
        });

        let mut stack = vec![0u8; STACK_SIZE];
        let pid = unsafe {
            nix::sched::clone(
                callback,
                &mut stack,
                isolation.clone_flags(),
                Some(Signal::SIGCHLD as i32),
            )
        }
        .map_err(|e| Error::privileged(format!("clone ({})", name), e))?;

        info!(name, %pid, ?isolation, "Spawned child");

        Ok(Self {
            name: name.to_string(),
            pid,
            lifecycle: Lifecycle::new(),
            exit_status: None,
            killed: false,
        })
    }

    /// Get the child's name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn record(&mut self, status: WaitStatus) {
        let outcome = match status {
            WaitStatus::Exited(_, code) => {
                self.exit_status = Some(code);
                self.lifecycle.terminate()
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.exit_status = Some(SIGNAL_EXIT_BASE + signal as i32);
                self.lifecycle.terminate()
            }
            WaitStatus::Stopped(_, _) if self.running() => self.lifecycle.suspend(),
            WaitStatus::Continued(_) if self.stopped() => self.lifecycle.resume(),
            _ => Ok(()),
        };

        if outcome.is_err() {
            warn!(name = %self.name, ?status, state = ?self.state(), "Ignoring wait status");
        }

        match self.exit_status {
            Some(status) if self.terminated() => {
                info!(name = %self.name, pid = %self.pid, status, "Child terminated")
            }
            _ => debug!(name = %self.name, pid = %self.pid, ?status, state = ?self.state(), "Child status"),
        }
    }
}

impl Supervised for ChildProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn wait(&mut self) -> Result<()> {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;

        // Several changes may be pending behind a single SIGCHLD
        while !self.terminated() {
            match waitpid(self.pid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => self.record(status),
                Err(e) => return Err(Error::privileged(format!("waitpid {}", self.pid), e)),
            }
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.signal(Signal::SIGCONT)?;
        if self.stopped() && self.lifecycle.resume().is_err() {
            warn!(name = %self.name, "Cannot record resumed child");
        }
        Ok(())
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        // A reaped pid may already belong to someone else
        if self.terminated() || self.killed {
            return Ok(());
        }

        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {
                if signal == Signal::SIGKILL {
                    self.killed = true;
                }
                debug!(name = %self.name, pid = %self.pid, %signal, "Signalled child");
                Ok(())
            }
            Err(e) => Err(Error::privileged(format!("kill {} {}", signal, self.pid), e)),
        }
    }

    fn state(&self) -> ChildState {
        self.lifecycle.state()
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.terminated() {
            return;
        }

        if let Err(e) = self.signal(Signal::SIGKILL) {
            warn!(name = %self.name, error = %e, "Failed to kill child");
        }
        match waitpid(self.pid, None) {
            Ok(status) => debug!(name = %self.name, ?status, "Reaped child on drop"),
            Err(e) => warn!(name = %self.name, error = %e, "Failed to reap child"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Poll `wait` until `done` holds, failing after a few seconds
    fn wait_until(child: &mut ChildProcess, done: impl Fn(&ChildProcess) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(child) {
            assert!(Instant::now() < deadline, "child never reached expected state");
            child.wait().unwrap();
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn sleeper() -> Result<i32> {
        loop {
            thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn test_exit_status_propagates() {
        let mut child = ChildProcess::spawn("seven", Isolation::Shared, || Ok(7)).unwrap();
        assert!(child.running());

        wait_until(&mut child, |c| c.terminated());
        assert_eq!(child.exit_status(), Some(7));
    }

    #[test]
    fn test_body_error_exits_one() {
        let mut child = ChildProcess::spawn("failing", Isolation::Shared, || {
            Err(Error::Environment("boom".into()))
        })
        .unwrap();

        wait_until(&mut child, |c| c.terminated());
        assert_eq!(child.exit_status(), Some(1));
    }

    #[test]
    fn test_stop_resume_kill() {
        let mut child = ChildProcess::spawn("sleeper", Isolation::Shared, sleeper).unwrap();

        child.signal(Signal::SIGSTOP).unwrap();
        // Signalling alone does not change the recorded state
        assert!(child.running());
        wait_until(&mut child, |c| c.stopped());

        child.resume().unwrap();
        assert!(child.running());

        child.signal(Signal::SIGKILL).unwrap();
        wait_until(&mut child, |c| c.terminated());
        assert_eq!(child.exit_status(), Some(SIGNAL_EXIT_BASE + 9));
    }

    #[test]
    fn test_signal_after_termination_is_noop() {
        let mut child = ChildProcess::spawn("short", Isolation::Shared, || Ok(0)).unwrap();
        wait_until(&mut child, |c| c.terminated());

        assert!(child.signal(Signal::SIGKILL).is_ok());
        assert!(child.wait().is_ok());
        assert_eq!(child.exit_status(), Some(0));
    }

    #[test]
    fn test_sigkill_sent_once() {
        let mut child = ChildProcess::spawn("doomed", Isolation::Shared, sleeper).unwrap();
        let pid = child.pid();

        child.signal(Signal::SIGKILL).unwrap();
        assert!(child.killed);

        // Nothing but reaping is left; the pid is not signalled again
        child.signal(Signal::SIGKILL).unwrap();
        child.signal(Signal::SIGCONT).unwrap();
        drop(child);

        assert_eq!(
            waitpid(pid, Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        );
    }

    #[test]
    fn test_drop_kills_running_child() {
        let child = ChildProcess::spawn("doomed", Isolation::Shared, sleeper).unwrap();
        let pid = child.pid();
        drop(child);

        // Reaped, so the pid no longer names our child
        assert_eq!(
            waitpid(pid, Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        );
    }

    #[test]
    #[ignore] // Requires CAP_SYS_ADMIN
    fn test_network_namespace_isolation() {
        let mut child = ChildProcess::spawn("isolated", Isolation::NetworkNamespace, || {
            let ours = std::fs::read_link("/proc/self/ns/net")?;
            let parents = std::fs::read_link(format!("/proc/{}/ns/net", nix::unistd::getppid()))?;
            Ok(if ours == parents { 1 } else { 0 })
        })
        .unwrap();

        wait_until(&mut child, |c| c.terminated());
        assert_eq!(child.exit_status(), Some(0));
    }
}

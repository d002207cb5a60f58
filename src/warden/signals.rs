//! Signals as file-descriptor events
//!
//! The supervised signals are blocked for the whole session and read from a
//! signalfd, so they are handled synchronously by the event loop instead of
//! in async-signal context.

use crate::error::{Error, Result};
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::Pid;
use std::os::unix::io::{AsFd, BorrowedFd};

/// Signals the supervisor reacts to
pub const SUPERVISED_SIGNALS: [Signal; 4] = [
    Signal::SIGCHLD,
    Signal::SIGCONT,
    Signal::SIGHUP,
    Signal::SIGTERM,
];

/// The set of supervised signals
pub fn supervised_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in SUPERVISED_SIGNALS {
        set.add(signal);
    }
    set
}

/// Block the supervised signals for the calling thread
///
/// Returns the mask in force before, for a later exec to restore.
pub fn block_supervised() -> Result<SigSet> {
    supervised_set()
        .thread_swap_mask(SigmaskHow::SIG_BLOCK)
        .map_err(|e| Error::privileged("sigprocmask", e))
}

/// One signal read from the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRecord {
    /// Raw signal number
    pub signo: i32,
    /// Sending process, when the kernel reports one
    pub pid: Option<Pid>,
}

impl SignalRecord {
    /// Build a record for `signal` sent by `pid`
    pub fn new(signal: Signal, pid: Option<Pid>) -> Self {
        Self {
            signo: signal as i32,
            pid,
        }
    }

    /// The signal, if it is one the platform knows
    pub fn signal(&self) -> Option<Signal> {
        Signal::try_from(self.signo).ok()
    }
}

/// Readable descriptor delivering the supervised signals
pub struct SignalChannel {
    fd: SignalFd,
}

impl SignalChannel {
    /// Block the supervised signals and open a channel for them
    pub fn open() -> Result<Self> {
        let set = supervised_set();
        set.thread_block()
            .map_err(|e| Error::privileged("sigprocmask", e))?;

        let fd = SignalFd::with_flags(&set, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| Error::privileged("signalfd", e))?;

        Ok(Self { fd })
    }

    /// Read one pending signal, if any
    pub fn read(&self) -> Result<Option<SignalRecord>> {
        let info = self
            .fd
            .read_signal()
            .map_err(|e| Error::privileged("read signalfd", e))?;

        Ok(info.map(|info| SignalRecord {
            signo: info.ssi_signo as i32,
            pid: match info.ssi_pid {
                0 => None,
                pid => Some(Pid::from_raw(pid as i32)),
            },
        }))
    }
}

impl AsFd for SignalChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

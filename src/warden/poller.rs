//! poll(2) multiplexing over registered descriptors
//!
//! Each descriptor is paired with a reaction that runs when it becomes
//! readable. A reaction either lets the loop continue or ends it with an
//! exit status.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::unix::io::BorrowedFd;
use std::time::Duration;
use tracing::trace;

/// Outcome of one reaction or one poll round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep polling
    Continue,
    /// Stop the loop with this exit status
    Exit(i32),
}

type Reaction<'a> = Box<dyn FnMut() -> Result<Verdict> + 'a>;

struct Action<'a> {
    fd: BorrowedFd<'a>,
    reaction: Reaction<'a>,
}

/// Registered descriptors and their reactions
#[derive(Default)]
pub struct Poller<'a> {
    actions: Vec<Action<'a>>,
}

impl<'a> Poller<'a> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Run `reaction` whenever `fd` is readable
    pub fn add_action(
        &mut self,
        fd: BorrowedFd<'a>,
        reaction: impl FnMut() -> Result<Verdict> + 'a,
    ) {
        self.actions.push(Action {
            fd,
            reaction: Box::new(reaction),
        });
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Wait up to `timeout` for readiness, then run the ready reactions in
    /// registration order
    ///
    /// A timeout or an interrupted wait is a `Continue` round. The first
    /// reaction returning `Exit` ends the round.
    pub fn poll(&mut self, timeout: Duration) -> Result<Verdict> {
        let ready: Vec<bool> = {
            let mut fds: Vec<PollFd> = self
                .actions
                .iter()
                .map(|action| PollFd::new(action.fd, PollFlags::POLLIN))
                .collect();

            match poll(&mut fds, poll_timeout(timeout)?) {
                Ok(0) | Err(Errno::EINTR) => return Ok(Verdict::Continue),
                Ok(_) => {}
                Err(e) => return Err(Error::privileged("poll", e)),
            }

            let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            fds.iter()
                .map(|fd| fd.revents().is_some_and(|r| r.intersects(readable)))
                .collect()
        };

        for (index, action) in self.actions.iter_mut().enumerate() {
            if !ready[index] {
                continue;
            }

            trace!(index, "Descriptor ready");
            if let Verdict::Exit(status) = (action.reaction)()? {
                return Ok(Verdict::Exit(status));
            }
        }

        Ok(Verdict::Continue)
    }
}

/// poll(2) takes milliseconds as a non-negative i32
fn poll_timeout(timeout: Duration) -> Result<PollTimeout> {
    PollTimeout::try_from(timeout)
        .map_err(|e| Error::Config(format!("poll timeout {:?} out of range ({:?})", timeout, e)))
}

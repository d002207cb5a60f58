//! Signal dispatch into supervised children
//!
//! | Signal          | Action                                   | Result                  |
//! |-----------------|------------------------------------------|-------------------------|
//! | SIGCONT         | resume the child                         | continue                |
//! | SIGCHLD         | wait; stopped child suspends us as well  | continue, or exit(code) |
//! | SIGHUP, SIGTERM | forward SIGHUP to the child              | exit(0)                 |
//! | anything else   |                                          | `UnknownSignal`         |
//!
//! Pending SIGCHLDs coalesce into one record naming a single pid, possibly
//! one of a helper we ran ourselves. A SIGCHLD therefore makes every child
//! collect its own status with a non-blocking, pid-scoped wait.

use crate::error::{Error, Result};
use crate::process::Supervised;
use crate::warden::signals::SignalRecord;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Loop status after a voluntary shutdown
pub const SHUTDOWN_STATUS: i32 = 0;

/// Status reported for a terminated child without a recorded status
const UNKNOWN_STATUS: i32 = 1;

/// What the loop should do after a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Keep polling
    Continue,
    /// Stop ourselves (the child stopped), then keep polling once continued
    SuspendSelf,
    /// Leave the loop with this status
    Exit(i32),
}

impl Reaction {
    /// Combine reactions of several children: exit wins over suspension,
    /// suspension over continuing
    fn merge(self, other: Reaction) -> Reaction {
        match (self, other) {
            (Reaction::Exit(status), _) | (_, Reaction::Exit(status)) => Reaction::Exit(status),
            (Reaction::SuspendSelf, _) | (_, Reaction::SuspendSelf) => Reaction::SuspendSelf,
            _ => Reaction::Continue,
        }
    }
}

/// Apply one signal record to one child
///
/// The reaction depends only on the signal and the child's state.
pub fn handle_signal<C: Supervised + ?Sized>(record: &SignalRecord, child: &mut C) -> Result<Reaction> {
    match record.signal() {
        Some(Signal::SIGCONT) => {
            child.resume()?;
            Ok(Reaction::Continue)
        }
        Some(Signal::SIGCHLD) => {
            child.wait()?;
            if child.terminated() {
                Ok(Reaction::Exit(child.exit_status().unwrap_or(UNKNOWN_STATUS)))
            } else if child.stopped() {
                Ok(Reaction::SuspendSelf)
            } else {
                Ok(Reaction::Continue)
            }
        }
        Some(Signal::SIGHUP) | Some(Signal::SIGTERM) => {
            child.signal(Signal::SIGHUP)?;
            Ok(Reaction::Exit(SHUTDOWN_STATUS))
        }
        _ => Err(Error::UnknownSignal(record.signo)),
    }
}

/// Direct children of this process, keyed by pid
///
/// Each handle waits on its own pid only, so one child's status can never be
/// attributed to another.
pub struct Children<C: Supervised> {
    by_pid: HashMap<Pid, C>,
}

impl<C: Supervised> Children<C> {
    pub fn new() -> Self {
        Self {
            by_pid: HashMap::new(),
        }
    }

    /// Register a child
    pub fn insert(&mut self, child: C) {
        self.by_pid.insert(child.pid(), child);
    }

    #[cfg(test)]
    pub fn get(&self, pid: Pid) -> Option<&C> {
        self.by_pid.get(&pid)
    }

    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }

    /// Apply a signal record to every child and merge the reactions
    pub fn dispatch(&mut self, record: &SignalRecord) -> Result<Reaction> {
        debug!(signal = ?record.signal(), pid = ?record.pid, "Dispatching signal");

        if record.signal() == Some(Signal::SIGCHLD)
            && !record.pid.is_some_and(|pid| self.by_pid.contains_key(&pid))
        {
            debug!(pid = ?record.pid, "SIGCHLD names a process we do not supervise");
        }

        let mut reaction = Reaction::Continue;
        for child in self.by_pid.values_mut() {
            reaction = reaction.merge(handle_signal(record, child)?);
        }

        if let Reaction::Exit(status) = reaction {
            info!(status, signal = ?record.signal(), "Leaving supervisor loop");
        }
        Ok(reaction)
    }

    /// Send SIGKILL to every registered child
    ///
    /// Children that already terminated are skipped by their handles, so
    /// this never fails on them.
    pub fn kill_all(&mut self) {
        for child in self.by_pid.values_mut() {
            if let Err(e) = child.signal(Signal::SIGKILL) {
                warn!(pid = %child.pid(), error = %e, "Failed to kill child");
            }
        }
    }
}

impl<C: Supervised> Default for Children<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ChildState;

    /// Child whose wait statuses are scripted
    struct FakeChild {
        pid: Pid,
        state: ChildState,
        exit_status: Option<i32>,
        /// State the next wait() will observe
        pending: Option<(ChildState, Option<i32>)>,
        sent: Vec<Signal>,
        waits: usize,
    }

    impl FakeChild {
        fn new(pid: i32) -> Self {
            Self {
                pid: Pid::from_raw(pid),
                state: ChildState::Running,
                exit_status: None,
                pending: None,
                sent: Vec::new(),
                waits: 0,
            }
        }

        fn will_exit(mut self, status: i32) -> Self {
            self.pending = Some((ChildState::Terminated, Some(status)));
            self
        }

        fn will_stop(mut self) -> Self {
            self.pending = Some((ChildState::Stopped, None));
            self
        }

        fn already_stopped(mut self) -> Self {
            self.state = ChildState::Stopped;
            self
        }
    }

    impl Supervised for FakeChild {
        fn pid(&self) -> Pid {
            self.pid
        }

        fn wait(&mut self) -> Result<()> {
            self.waits += 1;
            if let Some((state, status)) = self.pending.take() {
                self.state = state;
                self.exit_status = status;
            }
            Ok(())
        }

        fn resume(&mut self) -> Result<()> {
            self.sent.push(Signal::SIGCONT);
            if self.state == ChildState::Stopped {
                self.state = ChildState::Running;
            }
            Ok(())
        }

        fn signal(&mut self, signal: Signal) -> Result<()> {
            if self.state != ChildState::Terminated {
                self.sent.push(signal);
            }
            Ok(())
        }

        fn state(&self) -> ChildState {
            self.state
        }

        fn exit_status(&self) -> Option<i32> {
            self.exit_status
        }
    }

    fn record(signal: Signal, pid: Option<i32>) -> SignalRecord {
        SignalRecord::new(signal, pid.map(Pid::from_raw))
    }

    #[test]
    fn test_sigchld_exit_propagates_status() {
        let mut child = FakeChild::new(10).will_exit(7);
        let reaction = handle_signal(&record(Signal::SIGCHLD, Some(10)), &mut child).unwrap();
        assert_eq!(reaction, Reaction::Exit(7));
    }

    #[test]
    fn test_sigchld_stop_suspends_self() {
        let mut child = FakeChild::new(10).will_stop();
        let reaction = handle_signal(&record(Signal::SIGCHLD, Some(10)), &mut child).unwrap();
        assert_eq!(reaction, Reaction::SuspendSelf);
    }

    #[test]
    fn test_sigchld_without_change_continues() {
        let mut child = FakeChild::new(10);
        let reaction = handle_signal(&record(Signal::SIGCHLD, Some(10)), &mut child).unwrap();
        assert_eq!(reaction, Reaction::Continue);
        assert_eq!(child.waits, 1);
    }

    #[test]
    fn test_sigchld_naming_other_pid_still_waits() {
        let mut child = FakeChild::new(10).will_exit(7);
        let reaction = handle_signal(&record(Signal::SIGCHLD, Some(11)), &mut child).unwrap();
        assert_eq!(reaction, Reaction::Exit(7));
        assert_eq!(child.waits, 1);
    }

    #[test]
    fn test_sigcont_resumes_stopped_child() {
        let mut child = FakeChild::new(10).already_stopped();
        let reaction = handle_signal(&record(Signal::SIGCONT, None), &mut child).unwrap();
        assert_eq!(reaction, Reaction::Continue);
        assert!(child.running());
        assert_eq!(child.sent, vec![Signal::SIGCONT]);
    }

    #[test]
    fn test_sigterm_forwards_sighup() {
        for signal in [Signal::SIGTERM, Signal::SIGHUP] {
            let mut child = FakeChild::new(10);
            let reaction = handle_signal(&record(signal, Some(1)), &mut child).unwrap();
            assert_eq!(reaction, Reaction::Exit(SHUTDOWN_STATUS));
            assert_eq!(child.sent, vec![Signal::SIGHUP]);
        }
    }

    #[test]
    fn test_unknown_signal_is_fatal() {
        let mut child = FakeChild::new(10);
        let err = handle_signal(&record(Signal::SIGUSR1, None), &mut child).unwrap_err();
        assert!(matches!(err, Error::UnknownSignal(sig) if sig == Signal::SIGUSR1 as i32));
        assert!(child.sent.is_empty());
    }

    #[test]
    fn test_reaction_is_pure_in_signal_and_state() {
        // Same inputs, same decision, however often they are replayed
        for _ in 0..3 {
            let mut child = FakeChild::new(10).already_stopped();
            assert_eq!(
                handle_signal(&record(Signal::SIGCONT, None), &mut child).unwrap(),
                Reaction::Continue
            );
            let mut child = FakeChild::new(10);
            assert_eq!(
                handle_signal(&record(Signal::SIGHUP, None), &mut child).unwrap(),
                Reaction::Exit(SHUTDOWN_STATUS)
            );
        }
    }

    #[test]
    fn test_dispatch_sigchld_waits_every_child() {
        let mut children = Children::new();
        children.insert(FakeChild::new(10));
        children.insert(FakeChild::new(20).will_exit(4));

        let reaction = children.dispatch(&record(Signal::SIGCHLD, Some(10))).unwrap();
        assert_eq!(reaction, Reaction::Exit(4));
        assert_eq!(children.get(Pid::from_raw(10)).unwrap().waits, 1);
        assert_eq!(children.get(Pid::from_raw(20)).unwrap().waits, 1);
        assert!(children.get(Pid::from_raw(10)).unwrap().running());
    }

    #[test]
    fn test_dispatch_coalesced_sigchld_from_helper() {
        // The record names a helper process; the child's exit is still seen
        let mut children = Children::new();
        children.insert(FakeChild::new(10).will_exit(3));

        assert_eq!(
            children.dispatch(&record(Signal::SIGCHLD, Some(99))).unwrap(),
            Reaction::Exit(3)
        );
    }

    #[test]
    fn test_dispatch_sigchld_without_changes_continues() {
        let mut children = Children::new();
        children.insert(FakeChild::new(10));
        children.insert(FakeChild::new(20));

        assert_eq!(
            children.dispatch(&record(Signal::SIGCHLD, None)).unwrap(),
            Reaction::Continue
        );
    }

    #[test]
    fn test_dispatch_stop_and_exit_prefers_exit() {
        let mut children = Children::new();
        children.insert(FakeChild::new(10).will_stop());
        children.insert(FakeChild::new(20).will_exit(5));

        assert_eq!(
            children.dispatch(&record(Signal::SIGCHLD, Some(10))).unwrap(),
            Reaction::Exit(5)
        );
    }

    #[test]
    fn test_sigterm_sends_exactly_one_sighup_per_child() {
        let mut children = Children::new();
        children.insert(FakeChild::new(10));
        children.insert(FakeChild::new(20).already_stopped());

        let reaction = children.dispatch(&record(Signal::SIGTERM, None)).unwrap();
        assert_eq!(reaction, Reaction::Exit(SHUTDOWN_STATUS));

        for pid in [10, 20] {
            assert_eq!(children.get(Pid::from_raw(pid)).unwrap().sent, vec![Signal::SIGHUP]);
        }
    }

    #[test]
    fn test_kill_all_skips_terminated() {
        let mut children = Children::new();
        let mut done = FakeChild::new(10).will_exit(0);
        done.wait().unwrap();
        children.insert(done);
        children.insert(FakeChild::new(20));

        children.kill_all();

        assert!(children.get(Pid::from_raw(10)).unwrap().sent.is_empty());
        assert_eq!(children.get(Pid::from_raw(20)).unwrap().sent, vec![Signal::SIGKILL]);
    }

    #[test]
    fn test_merge() {
        assert_eq!(Reaction::Continue.merge(Reaction::SuspendSelf), Reaction::SuspendSelf);
        assert_eq!(Reaction::SuspendSelf.merge(Reaction::Exit(2)), Reaction::Exit(2));
        assert_eq!(Reaction::Continue.merge(Reaction::Continue), Reaction::Continue);
    }
}

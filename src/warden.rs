//! The Warden - per-process supervisor loop
//!
//! Each process of the session runs one warden:
//! - Watches proxy listeners and hands readiness to their handlers
//! - Reads the supervised signals from a signalfd and applies them to the
//!   direct children
//! - Ends when a child terminates or shutdown is requested, killing any
//!   children left behind

pub mod lifecycle;
pub mod poller;
pub mod signals;

use std::os::unix::io::AsFd;
use std::time::Duration;

use nix::sys::signal::{Signal, raise};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::ChildProcess;
use crate::proxy::Proxy;
use lifecycle::{Children, Reaction};
use poller::{Poller, Verdict};
use signals::SignalChannel;

/// Event loop owning every registration of this process
pub struct Warden<'a> {
    channel: SignalChannel,
    poller: Poller<'a>,
    children: Children<ChildProcess>,
    idle_tick: Duration,
}

impl<'a> Warden<'a> {
    /// Block the supervised signals and prepare an empty loop
    ///
    /// `idle_tick` bounds each poll; nothing happens when it elapses.
    pub fn new(idle_tick: Duration) -> Result<Self> {
        Ok(Self {
            channel: SignalChannel::open()?,
            poller: Poller::new(),
            children: Children::new(),
            idle_tick,
        })
    }

    /// Hand the proxy's listeners to its handlers whenever they are readable
    ///
    /// Handler failures are logged; they never end the loop.
    pub fn watch(&mut self, proxy: &'a dyn Proxy) {
        if let Some(udp) = proxy.udp_listener() {
            self.poller.add_action(udp.as_fd(), move || {
                if let Err(e) = proxy.handle_udp() {
                    warn!(error = %e, "UDP handler failed");
                }
                Ok(Verdict::Continue)
            });
        }

        if let Some(tcp) = proxy.tcp_listener() {
            self.poller.add_action(tcp.as_fd(), move || {
                if let Err(e) = proxy.handle_tcp() {
                    warn!(error = %e, "TCP handler failed");
                }
                Ok(Verdict::Continue)
            });
        }
    }

    /// Supervise a direct child
    pub fn supervise(&mut self, child: ChildProcess) {
        debug!(name = child.name(), "Supervising child");
        self.children.insert(child);
    }

    /// Poll until a reaction ends the loop, then kill the remaining children
    ///
    /// Returns the status the loop ended with: the exit status of a
    /// terminated child, or 0 after a requested shutdown.
    pub fn run(self) -> Result<i32> {
        let Warden {
            channel,
            poller,
            mut children,
            idle_tick,
        } = self;

        info!(
            listeners = poller.len(),
            children = children.len(),
            "Warden: Starting supervisor loop"
        );

        let status = {
            let mut poller: Poller<'_> = poller;

            // Without children there is nothing to deliver signals to
            if !children.is_empty() {
                let channel = &channel;
                let children = &mut children;
                poller.add_action(channel.as_fd(), move || {
                    let Some(record) = channel.read()? else {
                        return Ok(Verdict::Continue);
                    };

                    match children.dispatch(&record)? {
                        Reaction::Continue => Ok(Verdict::Continue),
                        Reaction::SuspendSelf => {
                            debug!("Child stopped, stopping ourselves");
                            raise(Signal::SIGSTOP).map_err(|e| Error::privileged("raise SIGSTOP", e))?;
                            Ok(Verdict::Continue)
                        }
                        Reaction::Exit(status) => Ok(Verdict::Exit(status)),
                    }
                });
            }

            loop {
                if let Verdict::Exit(status) = poller.poll(idle_tick)? {
                    break status;
                }
            }
        };

        children.kill_all();
        info!(status, "Warden: Supervisor loop finished");
        Ok(status)
    }
}

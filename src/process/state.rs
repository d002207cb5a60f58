//! Child process state machine
//!
//! Lifecycle of a supervised child using the state-machines crate in
//! dynamic mode, since transitions are driven by wait(2) statuses observed
//! at runtime.

use state_machines::state_machine;

state_machine! {
    name: ChildMachine,
    dynamic: true,
    initial: Running,
    states: [Running, Stopped, Terminated],
    events {
        suspend {
            transition: { from: Running, to: Stopped }
        }
        resume {
            transition: { from: Stopped, to: Running }
        }
        terminate {
            transition: { from: [Running, Stopped], to: Terminated }
        }
    }
}

/// Simple state enum for external use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    Stopped,
    Terminated,
}

impl ChildState {
    /// Parse state from string representation
    pub fn from_str(s: &str) -> Self {
        match s {
            "Running" => ChildState::Running,
            "Stopped" => ChildState::Stopped,
            _ => ChildState::Terminated,
        }
    }
}

/// Lifecycle tracker for one child
pub struct Lifecycle {
    machine: DynamicChildMachine<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: ChildMachine::new(()).into_dynamic(),
        }
    }

    /// Get current state as enum
    pub fn state(&self) -> ChildState {
        ChildState::from_str(self.machine.current_state())
    }

    /// Record that the child stopped
    pub fn suspend(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ChildMachineEvent::Suspend)
    }

    /// Record that the child continued
    pub fn resume(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ChildMachineEvent::Resume)
    }

    /// Record that the child exited or was killed
    pub fn terminate(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(ChildMachineEvent::Terminate)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

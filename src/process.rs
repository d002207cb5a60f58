//! Child process management
//!
//! Provides:
//! - clone(2)-based child creation with optional network isolation
//! - Lifecycle tracking from wait(2) statuses
//! - The final exec into the recorded shell

pub mod child;
pub mod exec;
pub mod state;

pub use child::{ChildProcess, Isolation, Supervised};
pub use exec::ShellImage;
pub use state::ChildState;

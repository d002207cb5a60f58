//! Network plumbing for the recording namespace
//!
//! Provides:
//! - Private address allocation for the veth link
//! - veth pair creation and teardown
//! - Interface and route ioctls
//! - Scoped entry into a child's network namespace

pub mod address;
pub mod ioctl;
pub mod netns;
pub mod tool;
pub mod veth;

pub use address::Interfaces;
pub use netns::in_network_namespace;
pub use veth::VirtualEthernetPair;

//! Virtual Ethernet pair management
//!
//! A veth pair links the host to the container namespace. The egress end
//! stays on the host; the ingress end is moved into the container's network
//! namespace. Deleting either end removes both.

use crate::error::{Error, Result};
use crate::network::tool;
use nix::unistd::Pid;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Longest device name the kernel accepts
const MAX_IFNAME: usize = libc::IF_NAMESIZE - 1;

/// Device names for the pair belonging to session `pid`
pub fn device_names(pid: u32) -> (String, String) {
    (format!("veth-{}", pid), format!("veth-i{}", pid))
}

/// A veth pair, deleted from the host when dropped
#[derive(Debug)]
pub struct VirtualEthernetPair {
    /// Host-side device name
    egress: String,
    /// Container-side device name
    ingress: String,
    /// Absolute path of ip(8)
    ip_command: PathBuf,
}

impl VirtualEthernetPair {
    /// Create the pair on the host
    pub fn create(egress: &str, ingress: &str, ip_command: &Path) -> Result<Self> {
        for name in [egress, ingress] {
            if name.is_empty() || name.len() > MAX_IFNAME {
                return Err(Error::Usage(format!(
                    "Invalid device name: {} (1 to {} chars)",
                    name, MAX_IFNAME
                )));
            }
        }

        tool::run(
            ip_command,
            &["link", "add", egress, "type", "veth", "peer", "name", ingress],
        )?;

        debug!(egress, ingress, "Created veth pair");

        Ok(Self {
            egress: egress.to_string(),
            ingress: ingress.to_string(),
            ip_command: ip_command.to_path_buf(),
        })
    }

    /// Get the host-side device name
    pub fn egress(&self) -> &str {
        &self.egress
    }

    /// Get the container-side device name
    pub fn ingress(&self) -> &str {
        &self.ingress
    }

    /// Move the ingress end into the network namespace of `pid`
    pub fn move_ingress_to(&self, pid: Pid) -> Result<()> {
        tool::run(
            &self.ip_command,
            &["link", "set", "dev", &self.ingress, "netns", &pid.to_string()],
        )?;

        debug!(device = %self.ingress, %pid, "Moved device into namespace");
        Ok(())
    }

    /// Delete the pair
    ///
    /// Succeeds if the devices are already gone, e.g. because the namespace
    /// holding the ingress end was torn down.
    pub fn destroy(&self) -> Result<()> {
        let args = ["link", "del", self.egress.as_str()];
        let output = tool::output(&self.ip_command, &args)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_missing_device(&stderr) {
                return Err(Error::privileged(
                    tool::describe(&self.ip_command, &args),
                    stderr.trim(),
                ));
            }
        }

        debug!(egress = %self.egress, "Deleted veth pair");
        Ok(())
    }
}

impl Drop for VirtualEthernetPair {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(egress = %self.egress, error = %e, "Failed to delete veth pair");
        }
    }
}

/// Assign a point-to-point address to `device` and bring it up
///
/// Runs in whatever network namespace the caller is in.
pub fn assign_address(ip_command: &Path, device: &str, addr: Ipv4Addr, peer: Ipv4Addr) -> Result<()> {
    let addr = addr.to_string();
    let peer = peer.to_string();

    tool::run(ip_command, &["addr", "add", &addr, "peer", &peer, "dev", device])?;
    tool::run(ip_command, &["link", "set", "dev", device, "up"])?;

    debug!(device, %addr, %peer, "Configured device");
    Ok(())
}

fn is_missing_device(stderr: &str) -> bool {
    stderr.contains("Cannot find device") || stderr.contains("does not exist")
}

//! Linux network ioctl syscalls
//!
//! Native ioctl operations for device and route configuration, replacing
//! `ip link set up` and `ip route add default` where a command is not needed.

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::ffi::CString;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::unix::io::AsRawFd;
use tracing::debug;

bitflags! {
    /// Interface flags carried by SIOCGIFFLAGS/SIOCSIFFLAGS
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterfaceFlags: libc::c_short {
        const UP = libc::IFF_UP as libc::c_short;
        const BROADCAST = libc::IFF_BROADCAST as libc::c_short;
        const LOOPBACK = libc::IFF_LOOPBACK as libc::c_short;
        const POINTOPOINT = libc::IFF_POINTOPOINT as libc::c_short;
        const RUNNING = libc::IFF_RUNNING as libc::c_short;
    }
}

/// `struct ifreq` restricted to the flags member of its union
#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

/// Any datagram socket will do as an ioctl handle
fn control_socket() -> Result<UdpSocket> {
    UdpSocket::bind("0.0.0.0:0").map_err(|e| Error::privileged("socket", e))
}

/// Safely copy interface name into fixed-size buffer
/// Returns error if name is too long (max 15 chars + null terminator)
fn copy_ifname(dest: &mut [libc::c_char; libc::IF_NAMESIZE], name: &str) -> Result<()> {
    let name_cstr = CString::new(name)
        .map_err(|e| Error::Usage(format!("Invalid interface name: {}", e)))?;
    let name_bytes = name_cstr.as_bytes_with_nul();

    if name_bytes.len() > libc::IF_NAMESIZE {
        return Err(Error::Usage(format!(
            "Interface name too long: {} (max {} chars)",
            name,
            libc::IF_NAMESIZE - 1
        )));
    }

    for (slot, byte) in dest.iter_mut().zip(name_bytes) {
        *slot = *byte as libc::c_char;
    }

    Ok(())
}

/// Read the flags of an interface
pub fn interface_flags(name: &str) -> Result<InterfaceFlags> {
    let sock = control_socket()?;

    let mut req: IfReqFlags = unsafe { std::mem::zeroed() };
    copy_ifname(&mut req.ifr_name, name)?;

    let result = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req as *mut IfReqFlags) };
    if result < 0 {
        return Err(Error::privileged(
            format!("ioctl SIOCGIFFLAGS {}", name),
            std::io::Error::last_os_error(),
        ));
    }

    Ok(InterfaceFlags::from_bits_retain(req.ifr_flags))
}

/// Bring an interface up, keeping its other flags
pub fn set_interface_up(name: &str) -> Result<()> {
    let sock = control_socket()?;
    let flags = interface_flags(name)? | InterfaceFlags::UP;

    let mut req: IfReqFlags = unsafe { std::mem::zeroed() };
    copy_ifname(&mut req.ifr_name, name)?;
    req.ifr_flags = flags.bits();

    let result = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &req as *const IfReqFlags) };
    if result < 0 {
        return Err(Error::privileged(
            format!("ioctl SIOCSIFFLAGS {}", name),
            std::io::Error::last_os_error(),
        ));
    }

    debug!(device = name, "Interface up");
    Ok(())
}

fn sockaddr_v4(addr: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    };

    // sockaddr_in and sockaddr have the same size on Linux
    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

/// Install a default route through `gateway` in the current network namespace
pub fn add_default_route(gateway: Ipv4Addr) -> Result<()> {
    let sock = control_socket()?;

    let mut route: libc::rtentry = unsafe { std::mem::zeroed() };
    route.rt_gateway = sockaddr_v4(gateway);
    route.rt_dst = sockaddr_v4(Ipv4Addr::UNSPECIFIED);
    route.rt_genmask = sockaddr_v4(Ipv4Addr::UNSPECIFIED);
    route.rt_flags = libc::RTF_UP | libc::RTF_GATEWAY;

    let result = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCADDRT, &route as *const libc::rtentry) };
    if result < 0 {
        return Err(Error::privileged(
            "ioctl SIOCADDRT",
            std::io::Error::last_os_error(),
        ));
    }

    debug!(%gateway, "Default route added");
    Ok(())
}

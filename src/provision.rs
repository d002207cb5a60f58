//! Session provisioning - builds the recording topology
//!
//! Provides:
//! - Address and device naming for one session
//! - veth link, NAT and DNAT setup on the host side
//! - The process tree: container (new network namespace) running the
//!   shell, and a recorder hosting the outward-facing proxies
//!
//! Every host-side resource is owned by a local of `record_session` and
//! released in reverse order when it returns, on success or failure.

use crate::bulkhead::{Dnat, Nat};
use crate::error::Result;
use crate::manifest::SessionConfig;
use crate::network::ioctl::{add_default_route, set_interface_up};
use crate::network::veth::{assign_address, device_names};
use crate::network::{Interfaces, VirtualEthernetPair, in_network_namespace};
use crate::process::{ChildProcess, Isolation, ShellImage, Supervised};
use crate::proxy::{DnsProxy, HttpProxy};
use crate::sys::{self, Environment};
use crate::warden::Warden;
use crate::warden::signals::block_supervised;
use ipnet::Ipv4Net;
use nix::sys::signal::SigSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use tracing::{debug, info};

/// First host number tried when allocating the veth addresses
const FIRST_HOST: u32 = 1;

/// Names and addresses of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlan {
    pub egress_device: String,
    pub ingress_device: String,
    pub egress_addr: Ipv4Addr,
    pub ingress_addr: Ipv4Addr,
    /// Connection mark tagging the session's NAT rules
    pub mark: u32,
}

impl SessionPlan {
    /// Derive device names from `pid` and pick two free addresses of `pool`
    pub fn new(pid: u32, interfaces: &Interfaces, pool: Ipv4Net) -> Result<Self> {
        let (egress_device, ingress_device) = device_names(pid);
        let (egress_addr, ingress_addr) = interfaces.allocate_pair(pool, FIRST_HOST)?;

        Ok(Self {
            egress_device,
            ingress_device,
            egress_addr,
            ingress_addr,
            mark: pid,
        })
    }
}

/// Run one recorded shell session and return its exit status
pub fn record_session(folder: &Path, config: &SessionConfig, env: Environment) -> Result<i32> {
    let folder = sys::check_storage_folder(folder)?;
    let nameserver = sys::first_nameserver()?;
    let plan = SessionPlan::new(std::process::id(), &Interfaces::scan()?, config.pool()?)?;

    info!(
        egress = %plan.egress_addr,
        ingress = %plan.ingress_addr,
        device = %plan.egress_device,
        %nameserver,
        "Provisioning session"
    );

    let veth = VirtualEthernetPair::create(&plan.egress_device, &plan.ingress_device, &config.ip_command)?;
    assign_address(&config.ip_command, veth.egress(), plan.egress_addr, plan.ingress_addr)?;

    let dns_outside = DnsProxy::new(
        SocketAddrV4::new(plan.egress_addr, 0),
        SocketAddr::V4(nameserver),
        SocketAddr::V4(nameserver),
        config.dns_timeout(),
    )?;

    let mut nat = Nat::install(&config.iptables_command, plan.ingress_addr, plan.mark)?;

    let http = HttpProxy::new(SocketAddrV4::new(plan.egress_addr, 0), &folder)?;
    let mut dnat = Dnat::install(&config.iptables_command, http.listener_addr()?, veth.egress())?;

    // From here on SIGCHLD and friends queue up for the signalfd instead of
    // being lost between a spawn and the first poll
    let caller_mask = block_supervised()?;

    let container = ChildProcess::spawn("container", Isolation::NetworkNamespace, || {
        run_container(nameserver, &dns_outside, config, &env, caller_mask)
    })?;

    veth.move_ingress_to(container.pid())?;
    in_network_namespace(container.pid(), || {
        assign_address(&config.ip_command, veth.ingress(), plan.ingress_addr, plan.egress_addr)?;
        add_default_route(plan.egress_addr)
    })?;
    debug!(pid = %container.pid(), "Container network configured");

    let recorder = ChildProcess::spawn("recorder", Isolation::Shared, || {
        sys::drop_privileges()?;

        let mut warden = Warden::new(config.idle_tick())?;
        warden.watch(&dns_outside);
        warden.watch(&http);
        warden.run()
    })?;

    let mut warden = Warden::new(config.idle_tick())?;
    warden.supervise(container);
    warden.supervise(recorder);
    let status = warden.run()?;

    dnat.remove()?;
    nat.remove()?;

    info!(status, "Session finished");
    Ok(status)
}

/// Body of the container process, inside the new network namespace
fn run_container(
    nameserver: SocketAddrV4,
    dns_outside: &DnsProxy,
    config: &SessionConfig,
    env: &Environment,
    caller_mask: SigSet,
) -> Result<i32> {
    set_interface_up("lo")?;

    // A loopback resolver is out of reach from here; stand in for it
    let dns_inside = DnsProxy::maybe_proxy(
        nameserver,
        dns_outside.udp_addr()?,
        dns_outside.tcp_addr()?,
        config.dns_timeout(),
    )?;

    sys::drop_privileges()?;

    let shell_env = env.clone().with_shell_prefix(&config.shell_prefix);
    let image = ShellImage::new(&sys::shell_path()?, &shell_env, caller_mask)?;
    debug!(shell = ?image.program(), "Starting shell");

    let shell = ChildProcess::spawn("shell", Isolation::Shared, move || {
        let never = image.exec()?;
        match never {}
    })?;

    let mut warden = Warden::new(config.idle_tick())?;
    if let Some(proxy) = &dns_inside {
        warden.watch(proxy);
    }
    warden.supervise(shell);
    warden.run()
}

//! DNS forwarder
//!
//! Listens on UDP and TCP at one address and forwards every query to an
//! upstream resolver, relaying the answer back to the client. Upstream
//! exchanges run on worker threads bounded by a timeout.

use crate::error::{Error, Result};
use crate::proxy::Proxy;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest DNS message over UDP or TCP
const MAX_MESSAGE: usize = 65535;

/// Fixed DNS header length
const HEADER_LEN: usize = 12;

/// Query id and question count from a DNS header
pub fn header_summary(message: &[u8]) -> Option<(u16, u16)> {
    if message.len() < HEADER_LEN {
        return None;
    }
    Some((BigEndian::read_u16(&message[0..2]), BigEndian::read_u16(&message[4..6])))
}

/// DNS proxy serving UDP and TCP on the same address
#[derive(Debug)]
pub struct DnsProxy {
    udp: UdpSocket,
    tcp: TcpListener,
    udp_target: SocketAddr,
    tcp_target: SocketAddr,
    timeout: Duration,
}

impl DnsProxy {
    /// Bind both listeners at `listen` and forward to the given targets
    ///
    /// With port 0 the kernel picks the UDP port and TCP binds the same one.
    pub fn new(
        listen: SocketAddrV4,
        udp_target: SocketAddr,
        tcp_target: SocketAddr,
        timeout: Duration,
    ) -> Result<Self> {
        let udp = UdpSocket::bind(listen)
            .map_err(|e| Error::Proxy(format!("cannot bind DNS UDP listener at {}: {}", listen, e)))?;
        let port = udp.local_addr()?.port();

        let tcp_listen = SocketAddrV4::new(*listen.ip(), port);
        let tcp = TcpListener::bind(tcp_listen).map_err(|e| {
            Error::Proxy(format!("cannot bind DNS TCP listener at {}: {}", tcp_listen, e))
        })?;

        udp.set_nonblocking(true)?;
        tcp.set_nonblocking(true)?;

        info!(listen = %tcp_listen, upstream = %udp_target, "DNS proxy listening");

        Ok(Self {
            udp,
            tcp,
            udp_target,
            tcp_target,
            timeout,
        })
    }

    /// Build a proxy only when the resolver sits on a loopback address
    ///
    /// Such a resolver is unreachable from a fresh network namespace, so a
    /// stand-in must listen at its address there and forward outward.
    pub fn maybe_proxy(
        nameserver: SocketAddrV4,
        udp_target: SocketAddr,
        tcp_target: SocketAddr,
        timeout: Duration,
    ) -> Result<Option<Self>> {
        if !nameserver.ip().is_loopback() {
            debug!(%nameserver, "Resolver reachable through the veth link");
            return Ok(None);
        }

        Self::new(nameserver, udp_target, tcp_target, timeout).map(Some)
    }

    /// Address of the UDP listener
    pub fn udp_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Address of the TCP listener
    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }
}

impl Proxy for DnsProxy {
    fn udp_listener(&self) -> Option<&UdpSocket> {
        Some(&self.udp)
    }

    fn tcp_listener(&self) -> Option<&TcpListener> {
        Some(&self.tcp)
    }

    fn handle_udp(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_MESSAGE];
        let (len, client) = match self.udp.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        buf.truncate(len);
        log_query("udp", client, &buf);

        let reply = self.udp.try_clone()?;
        let target = self.udp_target;
        let timeout = self.timeout;
        thread::spawn(move || {
            if let Err(e) = forward_udp(&reply, client, &buf, target, timeout) {
                warn!(%client, upstream = %target, error = %e, "DNS query over UDP failed");
            }
        });

        Ok(())
    }

    fn handle_tcp(&self) -> Result<()> {
        let (client, peer) = match self.tcp.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let target = self.tcp_target;
        let timeout = self.timeout;
        thread::spawn(move || {
            if let Err(e) = forward_tcp(client, peer, target, timeout) {
                warn!(client = %peer, upstream = %target, error = %e, "DNS query over TCP failed");
            }
        });

        Ok(())
    }
}

fn log_query(transport: &str, client: SocketAddr, message: &[u8]) {
    match header_summary(message) {
        Some((id, questions)) => debug!(transport, %client, id, questions, "DNS query"),
        None => debug!(transport, %client, len = message.len(), "Truncated DNS query"),
    }
}

fn unspecified_for(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
    }
}

fn forward_udp(
    reply: &UdpSocket,
    client: SocketAddr,
    query: &[u8],
    target: SocketAddr,
    timeout: Duration,
) -> io::Result<()> {
    let upstream = UdpSocket::bind(unspecified_for(target))?;
    upstream.set_read_timeout(Some(timeout))?;
    upstream.connect(target)?;
    upstream.send(query)?;

    let mut answer = vec![0u8; MAX_MESSAGE];
    let len = upstream.recv(&mut answer)?;
    reply.send_to(&answer[..len], client)?;
    Ok(())
}

fn read_message(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let len = stream.read_u16::<BigEndian>()?;
    let mut message = vec![0u8; usize::from(len)];
    stream.read_exact(&mut message)?;
    Ok(message)
}

fn write_message(stream: &mut TcpStream, message: &[u8]) -> io::Result<()> {
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DNS message too long"))?;
    stream.write_u16::<BigEndian>(len)?;
    stream.write_all(message)
}

fn forward_tcp(
    mut client: TcpStream,
    peer: SocketAddr,
    target: SocketAddr,
    timeout: Duration,
) -> io::Result<()> {
    client.set_nonblocking(false)?;
    client.set_read_timeout(Some(timeout))?;
    client.set_write_timeout(Some(timeout))?;

    let query = read_message(&mut client)?;
    log_query("tcp", peer, &query);

    let mut upstream = TcpStream::connect_timeout(&target, timeout)?;
    upstream.set_read_timeout(Some(timeout))?;
    upstream.set_write_timeout(Some(timeout))?;

    write_message(&mut upstream, &query)?;
    let answer = read_message(&mut upstream)?;
    write_message(&mut client, &answer)
}

//! Recording proxies
//!
//! Provides:
//! - A DNS forwarder listening on UDP and TCP
//! - A transparent TCP proxy that records every exchange to disk
//!
//! Proxies expose their listeners to the event loop and do one unit of
//! protocol work per readiness event. Exchanges with upstream servers run on
//! short-lived worker threads, so a handler never blocks the loop.

pub mod dns;
pub mod http;

pub use dns::DnsProxy;
pub use http::HttpProxy;

use crate::error::Result;
use std::net::{TcpListener, UdpSocket};

/// A proxy the event loop can watch
pub trait Proxy {
    /// Datagram listener, if the proxy serves UDP
    fn udp_listener(&self) -> Option<&UdpSocket> {
        None
    }

    /// Stream listener, if the proxy serves TCP
    fn tcp_listener(&self) -> Option<&TcpListener> {
        None
    }

    /// The UDP listener is readable
    fn handle_udp(&self) -> Result<()> {
        Ok(())
    }

    /// The TCP listener is readable
    fn handle_tcp(&self) -> Result<()> {
        Ok(())
    }
}

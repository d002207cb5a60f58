//! Transparent recording proxy for TCP traffic
//!
//! Connections arrive through DNAT; the original destination is recovered
//! with `SO_ORIGINAL_DST`. Each connection is relayed in both directions and,
//! once both sides are done, written out as a JSON recording.

use crate::error::{Error, Result};
use crate::proxy::Proxy;
use nix::sys::socket::{getsockopt, sockopt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Upper bound on reaching the original destination
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A relayed connection silent this long in either direction is torn down
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Relay buffer size
const CHUNK: usize = 16 * 1024;

/// One recorded connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    /// Client address inside the namespace
    pub client: String,
    /// Original destination
    pub server: String,
    /// Unix seconds when the connection was accepted
    pub started: u64,
    /// Unix seconds when both directions closed
    pub finished: u64,
    /// Bytes sent by the client, hex-encoded
    pub request: String,
    /// Bytes sent by the server, hex-encoded
    pub response: String,
}

impl Recording {
    /// SHA-256 of the request bytes, hex-encoded
    pub fn request_digest(request: &[u8]) -> String {
        hex::encode(Sha256::digest(request))
    }

    /// Write the recording into `folder` under the request digest
    ///
    /// Repeated identical requests get a numeric suffix instead of replacing
    /// earlier recordings.
    pub fn save(&self, folder: &Path, digest: &str) -> Result<PathBuf> {
        let (path, file) = create_unique(folder, digest)?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| Error::Proxy(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(path)
    }
}

fn create_unique(folder: &Path, stem: &str) -> Result<(PathBuf, File)> {
    for attempt in 0u32.. {
        let name = match attempt {
            0 => format!("{}.json", stem),
            n => format!("{}-{}.json", stem, n),
        };
        let path = folder.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Proxy(format!("no free recording name for {}", stem)))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Destination the client dialled before DNAT rewrote it
fn original_destination(stream: &TcpStream) -> Result<SocketAddrV4> {
    let sin = getsockopt(stream, sockopt::OriginalDst)
        .map_err(|e| Error::privileged("getsockopt SO_ORIGINAL_DST", e))?;

    Ok(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

/// Recording proxy
#[derive(Debug)]
pub struct HttpProxy {
    listener: TcpListener,
    folder: PathBuf,
}

impl HttpProxy {
    /// Listen at `listen` and store recordings in `folder`
    pub fn new(listen: SocketAddrV4, folder: &Path) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .map_err(|e| Error::Proxy(format!("cannot bind HTTP listener at {}: {}", listen, e)))?;
        listener.set_nonblocking(true)?;

        info!(listen = %listener.local_addr()?, folder = %folder.display(), "HTTP proxy listening");

        Ok(Self {
            listener,
            folder: folder.to_path_buf(),
        })
    }

    /// Address the DNAT rule must point at
    pub fn listener_addr(&self) -> Result<SocketAddrV4> {
        match self.listener.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(addr) => Err(Error::Proxy(format!("unexpected IPv6 listener {}", addr))),
        }
    }
}

impl Proxy for HttpProxy {
    fn tcp_listener(&self) -> Option<&TcpListener> {
        Some(&self.listener)
    }

    fn handle_tcp(&self) -> Result<()> {
        let (client, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        client.set_nonblocking(false)?;

        let server = original_destination(&client)?;
        if server == self.listener_addr()? {
            return Err(Error::Proxy(format!(
                "connection from {} was not redirected",
                peer
            )));
        }

        debug!(client = %peer, %server, "Accepted connection");

        let folder = self.folder.clone();
        thread::spawn(move || {
            if let Err(e) = record_connection(client, peer, server, &folder) {
                warn!(client = %peer, %server, error = %e, "Recording failed");
            }
        });

        Ok(())
    }
}

fn record_connection(client: TcpStream, peer: SocketAddr, server: SocketAddrV4, folder: &Path) -> Result<()> {
    let started = unix_now();
    let upstream = TcpStream::connect_timeout(&SocketAddr::V4(server), CONNECT_TIMEOUT)?;
    set_idle_timeout(&client, IDLE_TIMEOUT)?;
    set_idle_timeout(&upstream, IDLE_TIMEOUT)?;

    let (request, response) = relay(client, upstream)?;

    let recording = Recording {
        client: peer.to_string(),
        server: server.to_string(),
        started,
        finished: unix_now(),
        request: hex::encode(&request),
        response: hex::encode(&response),
    };
    let path = recording.save(folder, &Recording::request_digest(&request))?;

    info!(
        client = %peer,
        %server,
        request_bytes = request.len(),
        response_bytes = response.len(),
        path = %path.display(),
        "Recorded exchange"
    );
    Ok(())
}

fn set_idle_timeout(stream: &TcpStream, timeout: Duration) -> Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(())
}

/// Copy both directions until each side closes; returns what the client
/// sent and what the server sent
pub fn relay(client: TcpStream, server: TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let client_reader = client.try_clone()?;
    let server_reader = server.try_clone()?;

    crossbeam::scope(|scope| {
        let upstream = scope.spawn(move |_| pump(client_reader, server));
        let response = pump(server_reader, client);
        let request = upstream
            .join()
            .map_err(|_| Error::Proxy("relay thread panicked".to_string()))?;
        Ok((request, response))
    })
    .map_err(|_| Error::Proxy("relay thread panicked".to_string()))?
}

/// Copy `from` into `to`, keeping a copy of every byte
///
/// A failure in either direction tears down both sockets so the opposite
/// pump stops too; the bytes seen so far are still returned.
fn pump(mut from: TcpStream, mut to: TcpStream) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; CHUNK];

    loop {
        let n = match from.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                abort(&from, &to, &e);
                return captured;
            }
        };

        if let Err(e) = to.write_all(&buf[..n]) {
            abort(&from, &to, &e);
            return captured;
        }
        captured.extend_from_slice(&buf[..n]);
    }

    let _ = to.shutdown(Shutdown::Write);
    captured
}

fn abort(from: &TcpStream, to: &TcpStream, error: &io::Error) {
    debug!(error = %error, "Relay aborted");
    let _ = from.shutdown(Shutdown::Both);
    let _ = to.shutdown(Shutdown::Both);
}

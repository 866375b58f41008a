#![forbid(unsafe_code)]

//! Awl UDP transport adapter.
//!
//! * Single `UdpSocket` per session, bound with `SO_REUSEPORT` when supported.
//! * Send/receive facade with per-call deadlines; no event loop.
//! * Hosts the rendezvous wire codec and the hole punching state machine.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Type};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, info};

use awl_core::{Error, Result};

pub mod puncher;
pub mod wire;

pub use puncher::{PunchClient, Session};
pub use wire::{Message, MessageKind, DATAGRAM_LEN};

/// Send/receive capability bound to one UDP socket.
///
/// Blocking happens only inside these calls, bounded by the per-call
/// timeout. Implementations must not buffer datagrams across calls; every
/// call maps to at most one datagram.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt a datagram send within `timeout`. Returns the number of
    /// bytes written; an elapsed deadline reports zero bytes.
    async fn send_to(&self, buf: &[u8], target: SocketAddr, timeout: Duration) -> Result<usize>;

    /// Wait up to `timeout` for one datagram. `None` means the deadline
    /// passed without traffic; a genuine zero-length datagram reports
    /// `Some((0, addr))`.
    async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>>;

    /// Address the socket is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Release the socket and unblock any in-flight receive. Idempotent.
    fn close(&self);
}

/// Real socket implementation of [`Transport`].
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl UdpTransport {
    /// Bind on `local`; port 0 requests an ephemeral port.
    pub async fn bind(local: SocketAddr) -> Result<Self> {
        // Build the socket manually to set reuse options (if available).
        let domain = Domain::for_address(local);
        let socket = socket2::Socket::new(domain, Type::DGRAM, None)?;
        // ReusePort best-effort.
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        socket.set_reuse_port(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
        let std_sock: std::net::UdpSocket = socket.into();
        std_sock.set_nonblocking(true)?;
        let udp = UdpSocket::from_std(std_sock)?;
        info!("awl-transport bound on {}", udp.local_addr()?);
        Ok(Self {
            socket: Arc::new(udp),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, buf: &[u8], target: SocketAddr, timeout: Duration) -> Result<usize> {
        self.ensure_open()?;
        match time::timeout(timeout, self.socket.send_to(buf, target)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(0),
        }
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>> {
        self.ensure_open()?;
        tokio::select! {
            _ = self.shutdown.notified() => Err(Error::Closed),
            res = time::timeout(timeout, self.socket.recv_from(buf)) => match res {
                Ok(Ok((n, from))) => Ok(Some((n, from))),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Ok(None),
            },
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self.socket.local_addr()?;
        // An unspecified bind address is not usable as a destination; report
        // loopback instead so the returned endpoint is reachable.
        let mapped = match addr.ip() {
            IpAddr::V4(v4) if v4.is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
            }
            IpAddr::V6(v6) if v6.is_unspecified() => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
            }
            _ => addr,
        };
        Ok(mapped)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_waiters();
            debug!("awl-transport closed");
        }
    }
}

//! Rendezvous registration and the hole punching state machine.
//!
//! One session owns one bound socket and runs as a single cooperative
//! task. A connector registers with the rendezvous server, waits for its
//! introduction, then bursts punches over a predicted port window and
//! listens for the listener's echo. A listener registers, reflects every
//! acceptable punch back to its source, and keeps serving until cancelled
//! (or after the first success for the single-shot variant).
//!
//! Simultaneous outbound traffic from both peers is what opens the NAT
//! mappings; the predicted window covers NATs that allocate ports
//! sequentially, and re-targeting the observed source port covers the
//! symmetric ones that do not.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use awl_core::{PeerRole, PuncherConfig, Result, SessionToken};

use crate::wire::{self, ErrorCode, Message, MessageKind, DATAGRAM_LEN};
use crate::{Transport, UdpTransport};

/// One registration-to-termination pass over a bound transport.
///
/// Generic over [`Transport`] so the state machine can be driven by a
/// scripted implementation in tests. [`PunchClient`] is the convenience
/// wrapper that binds a real socket per session.
pub struct Session<T: Transport> {
    transport: Arc<T>,
    server: SocketAddr,
    role: PeerRole,
    config: PuncherConfig,
    running: Arc<AtomicBool>,
    token: Option<SessionToken>,
    target: Option<Ipv4Addr>,
}

impl<T: Transport> Session<T> {
    /// Connector session towards `peer`. Generates a fresh session token.
    pub fn connector(
        transport: Arc<T>,
        server: SocketAddr,
        peer: Ipv4Addr,
        config: PuncherConfig,
    ) -> Self {
        Self {
            transport,
            server,
            role: PeerRole::Connector,
            config,
            running: Arc::new(AtomicBool::new(true)),
            token: Some(SessionToken::generate()),
            target: Some(peer),
        }
    }

    /// Listener session; serves punches until cancelled. The session token
    /// arrives with the server's introduction.
    pub fn listener(transport: Arc<T>, server: SocketAddr, config: PuncherConfig) -> Self {
        Self::listening(transport, server, PeerRole::Listener, config)
    }

    /// Listener session that terminates after the first accepted punch.
    pub fn listener_single(transport: Arc<T>, server: SocketAddr, config: PuncherConfig) -> Self {
        Self::listening(transport, server, PeerRole::ListenerSingle, config)
    }

    fn listening(
        transport: Arc<T>,
        server: SocketAddr,
        role: PeerRole,
        config: PuncherConfig,
    ) -> Self {
        Self {
            transport,
            server,
            role,
            config,
            running: Arc::new(AtomicBool::new(true)),
            token: None,
            target: None,
        }
    }

    /// Replace the cancellation flag, sharing it with the caller.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.running = flag;
        self
    }

    /// Flag observed between state machine steps; store `false` to cancel.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// The session token. Connectors carry one from construction;
    /// listeners only after an introduction arrived.
    pub fn token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    /// Drive the session to completion. Returns the punched peer endpoint,
    /// or `None` on server-reported absence, budget exhaustion, or
    /// cancellation. Errors are transport failures only.
    pub async fn run(mut self) -> Result<Option<SocketAddr>> {
        self.register().await;
        self.outer_loop().await
    }

    /// Emit the single Register datagram. The result is advisory: a failed
    /// send is logged and the session proceeds to the receive loop, which
    /// will time out on its own.
    async fn register(&self) {
        let msg = match (self.role, self.target, self.token.as_ref()) {
            (PeerRole::Connector, Some(target), Some(token)) => Message::RegisterConnector {
                target,
                token: *token,
            },
            _ => Message::RegisterListener,
        };
        let datagram = msg.encode();
        match self
            .transport
            .send_to(&datagram, self.server, self.config.send_timeout())
            .await
        {
            Ok(n) if n == DATAGRAM_LEN => {
                debug!(role = %self.role, server = %self.server, "registered with rendezvous server");
            }
            Ok(n) => warn!(sent = n, "short register send"),
            Err(e) => warn!(error = %e, "register send failed"),
        }
    }

    /// Consume inbound datagrams and dispatch on (kind, sender, role).
    /// Connector iterations are bounded; listeners run until cancelled.
    async fn outer_loop(&mut self) -> Result<Option<SocketAddr>> {
        let connector = self.role == PeerRole::Connector;
        let mut consumed = 0u32;
        let mut buf = [0u8; DATAGRAM_LEN];
        loop {
            if !self.running.load(Ordering::Acquire) {
                debug!("session cancelled");
                return Ok(None);
            }
            if connector && consumed >= self.config.max_server_response_attempts {
                info!("no usable server response within budget, giving up");
                return Ok(None);
            }
            let received = match self
                .transport
                .recv_from(&mut buf, self.config.response_wait())
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        return Ok(None);
                    }
                    return Err(e);
                }
            };
            let Some((len, src)) = received else {
                // The receive deadline passed. Counted against the
                // connector budget so a silent server cannot hang the
                // session forever.
                if connector {
                    consumed += 1;
                }
                continue;
            };
            if len != DATAGRAM_LEN {
                debug!(len, %src, "discarding datagram with unexpected size");
                continue;
            }
            if connector {
                consumed += 1;
            }

            match MessageKind::from_u8(buf[0]) {
                Some(MessageKind::ConnectTo) if src == self.server => {
                    if let Some(endpoint) = self.handle_connect_to(&buf).await? {
                        return Ok(Some(endpoint));
                    }
                }
                Some(MessageKind::Error) if connector && src == self.server => {
                    match ErrorCode::from_u8(buf[1]) {
                        Some(ErrorCode::ClientNotFound) => {
                            info!("peer is not registered with the rendezvous server");
                            return Ok(None);
                        }
                        None => debug!(code = buf[1], "ignoring unknown server error code"),
                    }
                }
                Some(MessageKind::Punch) if self.role.is_listener() => {
                    if let Some(endpoint) = self.reflect(&mut buf, src).await? {
                        return Ok(Some(endpoint));
                    }
                }
                kind => debug!(?kind, %src, "discarding unexpected datagram"),
            }
        }
    }

    /// Parse an introduction and enter the punching sub-procedure.
    /// Connectors drop introductions whose forwarded token is not the one
    /// they registered with; crossed or stale server replies must not
    /// redirect a live session.
    async fn handle_connect_to(
        &mut self,
        datagram: &[u8; DATAGRAM_LEN],
    ) -> Result<Option<SocketAddr>> {
        let (peer, anchor_port, token) = match Message::decode(datagram) {
            Ok(Message::ConnectTo {
                peer,
                anchor_port,
                token,
            }) => (peer, anchor_port, token),
            Ok(_) | Err(_) => {
                debug!("discarding malformed introduction");
                return Ok(None);
            }
        };
        match self.role {
            PeerRole::Connector => {
                if self.token.as_ref() != Some(&token) {
                    debug!(token = %token.to_hex(), "discarding introduction with mismatched token");
                    return Ok(None);
                }
            }
            PeerRole::Listener | PeerRole::ListenerSingle => self.token = Some(token),
        }
        info!(peer = %peer, anchor_port, "introduction received, punching");
        self.punch_cycle(peer, anchor_port, &token).await
    }

    /// Burst/listen cycle for one introduction. The anchor port and
    /// prediction window never change within the cycle.
    async fn punch_cycle(
        &self,
        peer: Ipv4Addr,
        anchor_port: u16,
        token: &SessionToken,
    ) -> Result<Option<SocketAddr>> {
        let connector = self.role == PeerRole::Connector;
        let punch = Message::Punch { token: *token }.encode();
        for attempt in 0..self.config.max_punch_attempts {
            if !self.running.load(Ordering::Acquire) {
                return Ok(None);
            }
            self.burst(&punch, peer, anchor_port).await;
            if connector {
                if let Some(endpoint) = self
                    .listen_for_reply(&punch, peer, anchor_port, token)
                    .await?
                {
                    return Ok(Some(endpoint));
                }
            }
            if attempt + 1 < self.config.max_punch_attempts && !self.config.retry_delay().is_zero()
            {
                sleep(self.config.retry_delay()).await;
            }
        }
        Ok(None)
    }

    /// Send the punch to every port in the prediction window, ascending.
    /// Ports past 65535 are skipped; per-port send errors are not fatal.
    async fn burst(&self, punch: &[u8; DATAGRAM_LEN], peer: Ipv4Addr, anchor_port: u16) {
        for offset in 0..self.config.port_predictions {
            let Some(port) = anchor_port.checked_add(offset) else {
                break;
            };
            let target = SocketAddr::new(IpAddr::V4(peer), port);
            if let Err(e) = self
                .transport
                .send_to(punch, target, self.config.send_timeout())
                .await
            {
                debug!(%target, error = %e, "punch send failed");
            }
        }
    }

    /// Connector-only listen phase: wait out the per-attempt budget for
    /// traffic from the target peer. A matching punch from a port outside
    /// the window gets one extra punch sent straight back at the observed
    /// port; a matching echo ends the session.
    async fn listen_for_reply(
        &self,
        punch: &[u8; DATAGRAM_LEN],
        peer: Ipv4Addr,
        anchor_port: u16,
        token: &SessionToken,
    ) -> Result<Option<SocketAddr>> {
        let mut buf = [0u8; DATAGRAM_LEN];
        let deadline = Instant::now() + self.config.response_wait();
        loop {
            if !self.running.load(Ordering::Acquire) {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let poll = self.config.listen_poll().min(deadline - now);
            let received = match self.transport.recv_from(&mut buf, poll).await {
                Ok(v) => v,
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        return Ok(None);
                    }
                    return Err(e);
                }
            };
            let Some((len, src)) = received else {
                continue;
            };
            if len != DATAGRAM_LEN {
                continue;
            }
            if src.ip() != IpAddr::V4(peer) {
                debug!(%src, "ignoring datagram from unrelated address");
                continue;
            }
            match Message::decode(&buf) {
                Ok(Message::Punch { token: theirs }) if &theirs == token => {
                    if !in_window(src.port(), anchor_port, self.config.port_predictions) {
                        // Their NAT allocated outside the prediction;
                        // punch the observed port directly.
                        debug!(%src, "source port outside prediction window, re-targeting");
                        if let Err(e) = self
                            .transport
                            .send_to(punch, src, self.config.send_timeout())
                            .await
                        {
                            debug!(%src, error = %e, "re-target send failed");
                        }
                    }
                }
                Ok(Message::PunchSuccess { token: theirs }) if &theirs == token => {
                    info!(peer = %src, "punch acknowledged");
                    return Ok(Some(src));
                }
                Ok(msg) => debug!(kind = ?msg.kind(), %src, "ignoring datagram during punch wait"),
                Err(e) => debug!(error = %e, %src, "ignoring undecodable datagram"),
            }
        }
    }

    /// Listener echo: rewrite the punch in place and send it back to its
    /// source. Single-shot sessions return the source as their result.
    async fn reflect(
        &self,
        buf: &mut [u8; DATAGRAM_LEN],
        src: SocketAddr,
    ) -> Result<Option<SocketAddr>> {
        if !wire::reflect_punch(buf) {
            debug!(%src, "discarding punch with oversized token");
            return Ok(None);
        }
        if let Err(e) = self
            .transport
            .send_to(buf, src, self.config.send_timeout())
            .await
        {
            warn!(%src, error = %e, "punch echo failed");
            return Ok(None);
        }
        info!(peer = %src, "punch accepted and echoed");
        if self.role.is_single_shot() {
            return Ok(Some(src));
        }
        Ok(None)
    }
}

fn in_window(port: u16, anchor: u16, predictions: u16) -> bool {
    let port = u32::from(port);
    let anchor = u32::from(anchor);
    port >= anchor && port < anchor + u32::from(predictions)
}

/// Public client surface. Binds one [`UdpTransport`] per session and owns
/// the cancellation flag shared with whichever session is running.
pub struct PunchClient {
    server: SocketAddr,
    config: PuncherConfig,
    running: Arc<AtomicBool>,
    active: Mutex<Option<Arc<UdpTransport>>>,
}

impl PunchClient {
    /// Client talking to the given rendezvous server with default tunables.
    pub fn new(server: SocketAddr) -> Self {
        Self::with_config(server, PuncherConfig::default())
    }

    /// Client with explicit tunables, snapshotted per session start.
    pub fn with_config(server: SocketAddr, config: PuncherConfig) -> Self {
        Self {
            server,
            config,
            running: Arc::new(AtomicBool::new(true)),
            active: Mutex::new(None),
        }
    }

    /// Run as listener on `local` until [`dispose`](Self::dispose) is
    /// called.
    pub async fn listen_for_punches(&self, local: SocketAddr) -> Result<()> {
        let session = self.start(local, PeerRole::Listener, None).await?;
        let result = session.run().await;
        self.release_active();
        result.map(|_| ())
    }

    /// Run as single-shot listener on `local`; returns the first punched
    /// connector endpoint.
    pub async fn listen_for_single_punch(&self, local: SocketAddr) -> Result<Option<SocketAddr>> {
        let session = self.start(local, PeerRole::ListenerSingle, None).await?;
        let result = session.run().await;
        self.release_active();
        result
    }

    /// Run as connector towards `peer` from an ephemeral local port;
    /// returns the punched listener endpoint.
    pub async fn punch(&self, peer: Ipv4Addr) -> Result<Option<SocketAddr>> {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let session = self.start(local, PeerRole::Connector, Some(peer)).await?;
        let result = session.run().await;
        self.release_active();
        result
    }

    /// Local address of the currently bound session socket, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(|t| t.local_addr().ok())
    }

    /// Cancel the running session and release its socket. Idempotent; the
    /// client starts no further sessions afterwards.
    pub fn dispose(&self) {
        self.running.store(false, Ordering::Release);
        self.release_active();
        info!("punch client disposed");
    }

    async fn start(
        &self,
        local: SocketAddr,
        role: PeerRole,
        peer: Option<Ipv4Addr>,
    ) -> Result<Session<UdpTransport>> {
        let transport = Arc::new(UdpTransport::bind(local).await?);
        {
            let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(Arc::clone(&transport));
        }
        let session = match (role, peer) {
            (PeerRole::Connector, Some(p)) => {
                Session::connector(transport, self.server, p, self.config.clone())
            }
            (PeerRole::ListenerSingle, _) => {
                Session::listener_single(transport, self.server, self.config.clone())
            }
            _ => Session::listener(transport, self.server, self.config.clone()),
        };
        Ok(session.with_cancel_flag(Arc::clone(&self.running)))
    }

    fn release_active(&self) {
        let transport = {
            let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(t) = transport {
            t.close();
        }
    }
}

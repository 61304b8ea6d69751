//! UDP Tunnel Link
//!
//! Carries the handshake and keepalives over a connected UDP socket.
//!
//! # Lifecycle
//!
//! 1. **Establish**: resolve the endpoint, send the initiation and wait for
//!    an authenticated response, all within the handshake timeout
//! 2. **Keepalive**: drain replies left over from earlier keepalives, then one
//!    sealed empty packet out and one authenticated reply in
//! 3. **Close**: the socket and the transport keys are dropped with the link
//!
//! The client key pair is consumed by [`Connector::establish`] and dropped
//! as soon as the initiation is built, so its private half never outlives
//! the attempt.

use crate::config::{Endpoint, TunnelConfiguration};
use crate::handshake::{
    HandshakeError, Initiation, MSG_INITIATION, MSG_RESPONSE, RESPONSE_LEN, Responder, SessionKeys,
    transport_receiver,
};
use crate::keys::{KeyError, KeyPair};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest datagram read from the socket
const MAX_PACKET: usize = 2048;

/// Link statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    pub keepalives_sent: u64,
    pub keepalives_acked: u64,
}

impl TunnelStats {
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

/// An established tunnel link
#[async_trait]
pub trait Link: Send + Sync {
    /// One liveness round trip, bounded by `timeout`
    async fn keepalive(&self, timeout: Duration) -> Result<(), LinkError>;

    /// Seal and send a payload
    async fn send(&self, payload: &[u8]) -> Result<usize, LinkError>;

    fn stats(&self) -> TunnelStats;

    /// Tear the link down; later calls fail with [`LinkError::Closed`]
    async fn close(&self);
}

/// Establishes links from resolved configurations
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run the handshake against `config`'s endpoint
    async fn establish(&self, config: TunnelConfiguration, timeout: Duration) -> Result<Arc<dyn Link>, LinkError>;
}

/// Link errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("No reply within timeout")]
    Timeout,

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Link closed")]
    Closed,
}

impl From<HandshakeError> for LinkError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Key(KeyError::EntropyUnavailable(msg)) => LinkError::KeyGeneration(msg),
            other => LinkError::Protocol(other.to_string()),
        }
    }
}

fn io_error(err: std::io::Error) -> LinkError {
    LinkError::Unreachable(err.to_string())
}

/// Client side of the UDP link
pub struct UdpTunnel {
    socket: UdpSocket,
    peer: SocketAddr,
    keys: Mutex<SessionKeys>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    keepalives_sent: AtomicU64,
    keepalives_acked: AtomicU64,
    closed: AtomicBool,
}

impl UdpTunnel {
    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        Ok(())
    }

    /// Consume datagrams already queued; none of them may answer a new keepalive
    async fn drain(&self) -> Result<(), LinkError> {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let n = match self.socket.try_recv(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(io_error(e)),
            };

            match self.keys.lock().await.open(&buf[..n]) {
                Ok(payload) => {
                    debug!("Late reply from {} ({} bytes)", self.peer, payload.len());
                    self.bytes_received.fetch_add(payload.len() as u64, Ordering::Relaxed);
                }
                Err(e) => debug!("Dropping packet from {}: {}", self.peer, e),
            }
        }
    }
}

#[async_trait]
impl Link for UdpTunnel {
    async fn keepalive(&self, timeout: Duration) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.drain().await?;

        let packet = self.keys.lock().await.seal(&[])?;
        self.socket.send(&packet).await.map_err(io_error)?;
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let n = match tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                Err(_) => return Err(LinkError::Timeout),
                Ok(Err(e)) => return Err(io_error(e)),
                Ok(Ok(n)) => n,
            };

            match self.keys.lock().await.open(&buf[..n]) {
                Ok(payload) if payload.is_empty() => {
                    self.keepalives_acked.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Ok(payload) => {
                    self.bytes_received.fetch_add(payload.len() as u64, Ordering::Relaxed);
                }
                Err(e) => debug!("Dropping packet from {}: {}", self.peer, e),
            }
        }
    }

    async fn send(&self, payload: &[u8]) -> Result<usize, LinkError> {
        self.ensure_open()?;

        let packet = self.keys.lock().await.seal(payload)?;
        self.socket.send(&packet).await.map_err(io_error)?;
        self.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(payload.len())
    }

    fn stats(&self) -> TunnelStats {
        TunnelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
            keepalives_acked: self.keepalives_acked.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closing tunnel to {}", self.peer);
        }
    }
}

/// Connector over UDP
#[derive(Default)]
pub struct UdpConnector {
    resolver: OnceCell<TokioAsyncResolver>,
}

impl UdpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `resolver` for host-name endpoints instead of the system config
    pub fn with_resolver(resolver: TokioAsyncResolver) -> Self {
        Self {
            resolver: OnceCell::new_with(Some(resolver)),
        }
    }

    /// Resolve an endpoint to a socket address (host names via DNS)
    pub async fn resolve_peer(&self, endpoint: &Endpoint) -> Result<SocketAddr, LinkError> {
        if let Some(ip) = endpoint.ip() {
            return Ok(SocketAddr::new(ip, endpoint.port()));
        }

        let resolver = self
            .resolver
            .get_or_init(|| async {
                TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
                    warn!("System DNS config unavailable ({}), using Cloudflare", e);
                    TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
                })
            })
            .await;

        debug!("DNS lookup for endpoint {}", endpoint.host());
        let lookup = resolver
            .lookup_ip(endpoint.host())
            .await
            .map_err(|e| LinkError::Unreachable(format!("{}: {}", endpoint.host(), e)))?;

        lookup
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, endpoint.port()))
            .ok_or_else(|| LinkError::Unreachable(format!("{}: no addresses", endpoint.host())))
    }
}

async fn await_response(socket: &UdpSocket, initiation: Initiation) -> Result<SessionKeys, LinkError> {
    let mut buf = [0u8; MAX_PACKET];
    loop {
        let n = socket.recv(&mut buf).await.map_err(io_error)?;
        if n != RESPONSE_LEN || buf[0] != MSG_RESPONSE {
            debug!("Ignoring {}-byte datagram during handshake", n);
            continue;
        }
        return Ok(initiation.complete(&buf[..n])?);
    }
}

impl UdpConnector {
    async fn handshake(&self, config: TunnelConfiguration) -> Result<UdpTunnel, LinkError> {
        let peer = self.resolve_peer(config.endpoint()).await?;
        let bind: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind).await.map_err(io_error)?;
        socket.connect(peer).await.map_err(io_error)?;

        let (initiation, message) = Initiation::start(&config)?;
        drop(config);

        debug!("Handshake initiation to {} (index {})", peer, initiation.sender_index());
        socket.send(&message).await.map_err(io_error)?;
        let keys = await_response(&socket, initiation).await?;

        Ok(UdpTunnel {
            socket,
            peer,
            keys: Mutex::new(keys),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            keepalives_sent: AtomicU64::new(0),
            keepalives_acked: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Connector for UdpConnector {
    /// Endpoint lookup counts against `timeout` too
    async fn establish(&self, config: TunnelConfiguration, timeout: Duration) -> Result<Arc<dyn Link>, LinkError> {
        let endpoint = config.endpoint().clone();

        match tokio::time::timeout(timeout, self.handshake(config)).await {
            Ok(result) => {
                let tunnel = result?;
                info!("Tunnel to {} established", tunnel.peer);
                Ok(Arc::new(tunnel))
            }
            Err(_) => {
                warn!("Handshake with {} timed out after {:?}", endpoint, timeout);
                Err(LinkError::Timeout)
            }
        }
    }
}

/// Reference peer serving the handshake on a UDP socket
///
/// Echoes every authenticated transport packet, so a keepalive is answered
/// with a keepalive.
pub struct UdpResponder {
    local_addr: SocketAddr,
    silent: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl UdpResponder {
    pub async fn bind(addr: SocketAddr, keys: KeyPair) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(addr).await.map_err(io_error)?;
        let local_addr = socket.local_addr().map_err(io_error)?;
        let silent = Arc::new(AtomicBool::new(false));
        let delay_ms = Arc::new(AtomicU64::new(0));

        info!("Responder listening on {} ({})", local_addr, keys.public);
        let task = tokio::spawn(serve(
            socket,
            Responder::new(keys),
            silent.clone(),
            delay_ms.clone(),
        ));

        Ok(Self {
            local_addr,
            silent,
            delay_ms,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop answering (simulates a dead peer)
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Release);
    }

    /// Hold each reply back by `delay` (simulates a congested path)
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Release);
    }
}

impl Drop for UdpResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: UdpSocket, responder: Responder, silent: Arc<AtomicBool>, delay_ms: Arc<AtomicU64>) {
    let mut sessions: HashMap<u32, (SocketAddr, SessionKeys)> = HashMap::new();
    let mut buf = [0u8; MAX_PACKET];

    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("Responder recv error: {}", e);
                continue;
            }
        };
        if silent.load(Ordering::Acquire) {
            continue;
        }
        let packet = &buf[..n];

        let reply = if packet.first() == Some(&MSG_INITIATION) {
            match responder.respond(packet) {
                Ok((response, keys)) => {
                    debug!("Handshake from {} (index {})", from, keys.remote_index());
                    sessions.insert(keys.local_index(), (from, keys));
                    Some(response)
                }
                Err(e) => {
                    warn!("Rejected initiation from {}: {}", from, e);
                    None
                }
            }
        } else if let Some(index) = transport_receiver(packet) {
            match sessions.get_mut(&index) {
                Some((peer, keys)) if *peer == from => match keys.open(packet) {
                    Ok(payload) => keys.seal(&payload).ok(),
                    Err(e) => {
                        debug!("Dropping transport from {}: {}", from, e);
                        None
                    }
                },
                _ => None,
            }
        } else {
            None
        };

        if let Some(reply) = reply {
            let delay = delay_ms.load(Ordering::Acquire);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if let Err(e) = socket.send_to(&reply, from).await {
                debug!("Responder send error: {}", e);
            }
        }
    }
}

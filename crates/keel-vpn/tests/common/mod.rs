//! Scripted collaborators for supervisor tests
#![allow(dead_code)]

use async_trait::async_trait;
use keel_vpn::{
    BearerToken, Collaborators, ConfigResponse, ConfigurationResolver, ControlError, ControlPlane, Connector, Link,
    LinkError, PublicKey, RetryPolicy, ServerDescriptor, SessionReporter, SessionStore, StaticDirectory, StaticGateway,
    StatusEvent, Timings, TunnelConfiguration, TunnelStats, TunnelSupervisor, KeyPair,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

pub const USER: &str = "user_123";

pub fn descriptor(id: &str, public_key: PublicKey, endpoint: &str) -> ServerDescriptor {
    ServerDescriptor {
        id: id.to_string(),
        name: "US East".to_string(),
        location: "New York".to_string(),
        country: "US".to_string(),
        endpoint: endpoint.parse().unwrap(),
        public_key,
        latency_ms: 24,
        load: 45,
        premium: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Ok,
    Slow(Duration),
    WrongKey,
    Unauthorized,
}

/// Control plane answering with the descriptor's own key
pub struct MockControl {
    mode: Mutex<ControlMode>,
    calls: AtomicU32,
}

impl MockControl {
    pub fn new(mode: ControlMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            calls: AtomicU32::new(0),
        })
    }

    pub fn set_mode(&self, mode: ControlMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for MockControl {
    async fn request_config(
        &self,
        server: &ServerDescriptor,
        _token: &BearerToken,
        _client_public_key: &PublicKey,
    ) -> Result<ConfigResponse, ControlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();

        let server_public_key = match mode {
            ControlMode::Slow(delay) => {
                tokio::time::sleep(delay).await;
                server.public_key.to_base64()
            }
            ControlMode::WrongKey => KeyPair::generate().unwrap().public.to_base64(),
            ControlMode::Unauthorized => return Err(ControlError::Unauthorized),
            ControlMode::Ok => server.public_key.to_base64(),
        };

        Ok(ConfigResponse {
            server_public_key,
            allowed_ips: vec!["0.0.0.0/0".to_string()],
            dns: vec![],
            address: Some("10.0.0.2/32".to_string()),
        })
    }
}

/// Link whose liveness and traffic are driven by the test
#[derive(Default)]
pub struct MockLink {
    dead: AtomicBool,
    closed: AtomicBool,
    bytes: AtomicU64,
    keepalives: AtomicU32,
}

impl MockLink {
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn add_traffic(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn keepalives(&self) -> u32 {
        self.keepalives.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for MockLink {
    async fn keepalive(&self, timeout: Duration) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        if self.dead.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            return Err(LinkError::Timeout);
        }
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<usize, LinkError> {
        self.add_traffic(payload.len() as u64);
        Ok(payload.len())
    }

    fn stats(&self) -> TunnelStats {
        TunnelStats {
            bytes_sent: self.bytes.load(Ordering::SeqCst),
            ..TunnelStats::default()
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Ok,
    Timeout,
    Forged,
}

/// Connector handing out [`MockLink`]s
pub struct MockConnector {
    mode: Mutex<ConnectMode>,
    links: Mutex<Vec<Arc<MockLink>>>,
    client_keys: Mutex<Vec<PublicKey>>,
}

impl MockConnector {
    pub fn new(mode: ConnectMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            links: Mutex::new(Vec::new()),
            client_keys: Mutex::new(Vec::new()),
        })
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().unwrap().clone()
    }

    pub fn last_link(&self) -> Arc<MockLink> {
        self.links().pop().expect("no link established")
    }

    pub fn client_keys(&self) -> Vec<PublicKey> {
        self.client_keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn establish(&self, config: TunnelConfiguration, timeout: Duration) -> Result<Arc<dyn Link>, LinkError> {
        self.client_keys.lock().unwrap().push(*config.client_public_key());
        let mode = *self.mode.lock().unwrap();
        match mode {
            ConnectMode::Timeout => {
                tokio::time::sleep(timeout).await;
                Err(LinkError::Timeout)
            }
            ConnectMode::Forged => Err(LinkError::Protocol("Peer failed to prove possession of its key".into())),
            ConnectMode::Ok => {
                let link = Arc::new(MockLink::default());
                self.links.lock().unwrap().push(link.clone());
                Ok(link)
            }
        }
    }
}

/// Session reporter recording every call
#[derive(Default)]
pub struct MockReporter {
    failing: AtomicBool,
    started: Mutex<Vec<String>>,
    ended: Mutex<Vec<String>>,
}

impl MockReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Server ids reported as started
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Remote session ids reported as ended
    pub fn ended(&self) -> Vec<String> {
        self.ended.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionReporter for MockReporter {
    async fn session_started(&self, server_id: &str, _token: &BearerToken) -> Result<String, ControlError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControlError::Unreachable("reporting endpoint down".into()));
        }
        let mut started = self.started.lock().unwrap();
        started.push(server_id.to_string());
        Ok(format!("remote-{}", started.len()))
    }

    async fn session_ended(&self, remote_id: &str, _token: &BearerToken) -> Result<(), ControlError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControlError::Unreachable("reporting endpoint down".into()));
        }
        self.ended.lock().unwrap().push(remote_id.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub supervisor: TunnelSupervisor,
    pub control: Arc<MockControl>,
    pub connector: Arc<MockConnector>,
    pub reporter: Arc<MockReporter>,
    pub server: ServerDescriptor,
}

pub fn harness(token: BearerToken, control: ControlMode, connect: ConnectMode) -> Harness {
    harness_with_store(token, control, connect, SessionStore::new())
}

pub fn harness_with_store(token: BearerToken, control: ControlMode, connect: ConnectMode, store: SessionStore) -> Harness {
    let server = descriptor("us-east-1", KeyPair::generate().unwrap().public, "1.2.3.4:51820");
    let control = MockControl::new(control);
    let connector = MockConnector::new(connect);
    let reporter = MockReporter::new();

    let resolver = ConfigurationResolver::new(control.clone()).with_retry(RetryPolicy::none());
    let supervisor = TunnelSupervisor::new(
        Collaborators {
            auth: Arc::new(StaticGateway::new(USER, token, Duration::from_secs(3600))),
            directory: Arc::new(StaticDirectory::new(vec![server.clone()]).unwrap()),
            resolver,
            connector: connector.clone(),
            reporter: Some(reporter.clone() as Arc<dyn SessionReporter>),
        },
        store,
        Timings::default(),
    );

    Harness {
        supervisor,
        control,
        connector,
        reporter,
        server,
    }
}

pub fn valid_token() -> BearerToken {
    BearerToken::valid_for("token", Duration::from_secs(3600))
}

/// Next status event, failing the test if none arrives in time
pub async fn next_event(rx: &mut broadcast::Receiver<StatusEvent>) -> StatusEvent {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("no status event")
        .expect("status feed closed")
}

/// Received request head and body
#[derive(Debug, Clone)]
pub struct Captured {
    pub head: String,
    pub body: String,
}

/// HTTP server answering each connection with the next canned `(status, body)`
pub async fn canned_server(replies: Vec<(u16, String)>) -> (SocketAddr, Arc<Mutex<Vec<Captured>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(Vec::new()));

    let log = captured.clone();
    tokio::spawn(async move {
        for (status, body) in replies {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            log.lock().unwrap().push(request);

            let response = format!(
                "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
        }
    });

    (addr, captured)
}

async fn read_request(stream: &mut TcpStream) -> Captured {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending a request");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);

    while buf.len() < head_end + length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }

    Captured {
        head,
        body: String::from_utf8_lossy(&buf[head_end..head_end + length]).to_string(),
    }
}

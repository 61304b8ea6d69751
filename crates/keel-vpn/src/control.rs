//! Control-plane exchanges
//!
//! The client announces its fresh public key to the control plane and gets
//! back the server key, the assigned address ranges and DNS resolvers.
//!
//! ```text
//! POST {control_url}/servers/{server_id}/config
//! Authorization: Bearer <token>
//! {"client_public_key": "<base64>"}
//!
//! 200 {"server_public_key": "<base64>", "allowed_ips": ["0.0.0.0/0"],
//!      "dns": ["1.1.1.1"], "address": "10.0.0.2/32"}
//! ```
//!
//! The same client lists servers (`GET /servers`) and registers sessions
//! (`POST /sessions` returning `{"session_id": ..}`, `DELETE /sessions/{id}`).
//!
//! The HTTP client uses hyper over a tokio socket, with rustls for `https`
//! control URLs.

use crate::auth::BearerToken;
use crate::directory::ServerDescriptor;
use crate::keys::PublicKey;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, Response, StatusCode};
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// Largest control-plane payload accepted
const MAX_BODY_SIZE: usize = 256 * 1024;

/// Request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub client_public_key: String,
}

/// Response body, unvalidated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub server_public_key: String,
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    #[serde(alias = "sessionId")]
    pub session_id: String,
}

/// Issues authorized configuration requests
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn request_config(
        &self,
        server: &ServerDescriptor,
        token: &BearerToken,
        client_public_key: &PublicKey,
    ) -> Result<ConfigResponse, ControlError>;
}

/// Registers sessions with the control plane
#[async_trait]
pub trait SessionReporter: Send + Sync {
    /// Announce a new session; returns the control plane's id for it
    async fn session_started(&self, server_id: &str, token: &BearerToken) -> Result<String, ControlError>;

    async fn session_ended(&self, remote_id: &str, token: &BearerToken) -> Result<(), ControlError>;
}

/// Control-plane errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Token rejected by control plane")]
    Unauthorized,

    #[error("Control plane unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed control-plane response: {0}")]
    Malformed(String),
}

impl ControlError {
    /// Only transport faults are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControlError::Unreachable(_))
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ControlError::Unauthorized,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                ControlError::Unreachable(format!("HTTP {}", status))
            }
            s if s.is_server_error() => ControlError::Unreachable(format!("HTTP {}", s)),
            s => ControlError::Malformed(format!("unexpected HTTP {}", s)),
        }
    }
}

/// HTTP/1.1 control-plane client
pub struct HttpControlPlane {
    base: Url,
    user_agent: String,
    tls: Arc<ClientConfig>,
}

impl HttpControlPlane {
    /// Create a client for `control_url` (http or https)
    pub fn new(control_url: &str) -> Result<Self, ControlError> {
        let base = Url::parse(control_url)
            .map_err(|e| ControlError::Unreachable(format!("invalid control URL: {}", e)))?;

        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ControlError::Unreachable(format!(
                    "unsupported scheme: {}",
                    other
                )));
            }
        }
        if base.host_str().is_none() {
            return Err(ControlError::Unreachable("control URL has no host".into()));
        }

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            base,
            user_agent: format!("keel/{}", env!("CARGO_PKG_VERSION")),
            tls: Arc::new(tls),
        })
    }

    /// URL of the configuration resource for a server
    pub fn config_url(&self, server_id: &str) -> Result<Url, ControlError> {
        self.url_for(&["servers", server_id, "config"])
    }

    pub fn servers_url(&self) -> Result<Url, ControlError> {
        self.url_for(&["servers"])
    }

    /// `/sessions`, or `/sessions/{id}` for one registered session
    pub fn sessions_url(&self, remote_id: Option<&str>) -> Result<Url, ControlError> {
        match remote_id {
            Some(id) => self.url_for(&["sessions", id]),
            None => self.url_for(&["sessions"]),
        }
    }

    fn url_for(&self, segments: &[&str]) -> Result<Url, ControlError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ControlError::Unreachable("control URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Fetch the server list
    pub async fn list_servers(&self, token: &BearerToken) -> Result<Vec<ServerDescriptor>, ControlError> {
        let url = self.servers_url()?;
        debug!("GET {}", url);
        let response = self.send(Method::GET, &url, token, None).await?;
        read_json(response).await
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        token: &BearerToken,
        body: Option<Vec<u8>>,
    ) -> Result<Response<Incoming>, ControlError> {
        let host = url
            .host_str()
            .ok_or_else(|| ControlError::Unreachable("control URL has no host".into()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ControlError::Unreachable("control URL has no port".into()))?;
        let authority = match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        };
        let target = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(target)
            .header(HOST, authority)
            .header(USER_AGENT, &self.user_agent)
            .header(AUTHORIZATION, format!("Bearer {}", token.value()));
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ControlError::Malformed(format!("request build failed: {}", e)))?;

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;

        if url.scheme() == "https" {
            let connector = TlsConnector::from(self.tls.clone());
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| ControlError::Unreachable("invalid TLS server name".into()))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ControlError::Unreachable(format!("TLS: {}", e)))?;
            send_over(tls_stream, request).await
        } else {
            send_over(stream, request).await
        }
    }
}

/// Check the status and decode a JSON body
async fn read_json<T: DeserializeOwned>(response: Response<Incoming>) -> Result<T, ControlError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ControlError::from_status(status));
    }

    let collected = Limited::new(response.into_body(), MAX_BODY_SIZE)
        .collect()
        .await
        .map_err(|e| ControlError::Malformed(format!("body: {}", e)))?;

    serde_json::from_slice(&collected.to_bytes()).map_err(|e| ControlError::Malformed(e.to_string()))
}

async fn send_over<S>(io: S, request: Request<Full<Bytes>>) -> Result<Response<Incoming>, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(io);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ControlError::Unreachable(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Control-plane connection error: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| ControlError::Unreachable(e.to_string()))
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn request_config(
        &self,
        server: &ServerDescriptor,
        token: &BearerToken,
        client_public_key: &PublicKey,
    ) -> Result<ConfigResponse, ControlError> {
        let url = self.config_url(&server.id)?;
        let body = serde_json::to_vec(&ConfigRequest {
            client_public_key: client_public_key.to_base64(),
        })
        .map_err(|e| ControlError::Malformed(e.to_string()))?;

        debug!("POST {}", url);
        let response = self.send(Method::POST, &url, token, Some(body)).await?;
        read_json(response).await
    }
}

#[async_trait]
impl SessionReporter for HttpControlPlane {
    async fn session_started(&self, server_id: &str, token: &BearerToken) -> Result<String, ControlError> {
        let url = self.sessions_url(None)?;
        let body = serde_json::to_vec(&SessionRequest {
            server_id: server_id.to_string(),
        })
        .map_err(|e| ControlError::Malformed(e.to_string()))?;

        debug!("POST {}", url);
        let response = self.send(Method::POST, &url, token, Some(body)).await?;
        let registered: SessionResponse = read_json(response).await?;
        Ok(registered.session_id)
    }

    async fn session_ended(&self, remote_id: &str, token: &BearerToken) -> Result<(), ControlError> {
        let url = self.sessions_url(Some(remote_id))?;
        debug!("DELETE {}", url);

        let status = self.send(Method::DELETE, &url, token, None).await?.status();
        if !status.is_success() {
            return Err(ControlError::from_status(status));
        }
        Ok(())
    }
}

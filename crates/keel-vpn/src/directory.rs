//! Server Directory
//!
//! Candidate servers and their live health metrics. The directory is
//! read-only to the session manager; refreshed lists replace the old one
//! wholesale.
//!
//! [`StaticDirectory`] serves a list from settings; [`HttpDirectory`] fetches
//! `GET {control_url}/servers` on every lookup.

use crate::auth::AuthGateway;
use crate::config::Endpoint;
use crate::control::{ControlError, HttpControlPlane};
use crate::keys::PublicKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Server descriptor as issued by the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Opaque identity (e.g. `us-east-1`)
    pub id: String,
    /// Display name
    pub name: String,
    /// Human-readable location
    #[serde(default)]
    pub location: String,
    /// ISO country code
    #[serde(default)]
    pub country: String,
    /// UDP endpoint of the tunnel
    pub endpoint: Endpoint,
    /// Server's long-term public key (base64)
    #[serde(alias = "publicKey")]
    pub public_key: PublicKey,
    /// Observed latency
    #[serde(default, alias = "latency")]
    pub latency_ms: u32,
    /// Observed load, 0-100
    #[serde(default)]
    pub load: u8,
    #[serde(default)]
    pub premium: bool,
}

impl ServerDescriptor {
    /// Check directory-supplied fields
    pub fn validate(&self) -> Result<(), DirectoryError> {
        if self.id.trim().is_empty() {
            return Err(DirectoryError::InvalidDescriptor("empty id".into()));
        }
        if self.load > 100 {
            return Err(DirectoryError::InvalidDescriptor(format!(
                "{}: load {} exceeds 100",
                self.id, self.load
            )));
        }
        Ok(())
    }

    /// Ranking score, lower is better: latency plus a load penalty
    pub fn score(&self) -> u32 {
        self.latency_ms.saturating_add(self.load as u32 * 2)
    }
}

/// Pick the best server by score; premium servers only when allowed
pub fn recommend(servers: &[ServerDescriptor], allow_premium: bool) -> Option<&ServerDescriptor> {
    servers
        .iter()
        .filter(|s| allow_premium || !s.premium)
        .min_by_key(|s| (s.score(), s.latency_ms))
}

/// Source of candidate servers
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn list_servers(&self) -> Result<Vec<ServerDescriptor>, DirectoryError>;

    /// Look up one server by id
    async fn find(&self, id: &str) -> Result<Option<ServerDescriptor>, DirectoryError> {
        let servers = self.list_servers().await?;
        Ok(servers.into_iter().find(|s| s.id == id))
    }
}

/// Directory backed by an in-memory list (loaded from settings)
pub struct StaticDirectory {
    servers: RwLock<Arc<Vec<ServerDescriptor>>>,
}

impl StaticDirectory {
    pub fn new(servers: Vec<ServerDescriptor>) -> Result<Self, DirectoryError> {
        check_servers(&servers)?;
        info!("Server directory loaded with {} servers", servers.len());
        Ok(Self {
            servers: RwLock::new(Arc::new(servers)),
        })
    }

    /// Replace the whole list
    pub fn replace(&self, servers: Vec<ServerDescriptor>) -> Result<(), DirectoryError> {
        check_servers(&servers)?;
        debug!("Replacing server list ({} servers)", servers.len());

        let mut guard = self
            .servers
            .write()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?;
        *guard = Arc::new(servers);
        Ok(())
    }
}

fn check_servers(servers: &[ServerDescriptor]) -> Result<(), DirectoryError> {
    for server in servers {
        server.validate()?;
    }
    for (i, server) in servers.iter().enumerate() {
        if servers[..i].iter().any(|s| s.id == server.id) {
            return Err(DirectoryError::InvalidDescriptor(format!(
                "duplicate id {}",
                server.id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl ServerDirectory for StaticDirectory {
    async fn list_servers(&self) -> Result<Vec<ServerDescriptor>, DirectoryError> {
        let snapshot = self
            .servers
            .read()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?
            .clone();
        Ok(snapshot.as_ref().clone())
    }
}

/// Directory served by the control plane
pub struct HttpDirectory {
    control: Arc<HttpControlPlane>,
    auth: Arc<dyn AuthGateway>,
}

impl HttpDirectory {
    pub fn new(control: Arc<HttpControlPlane>, auth: Arc<dyn AuthGateway>) -> Self {
        Self { control, auth }
    }
}

#[async_trait]
impl ServerDirectory for HttpDirectory {
    async fn list_servers(&self) -> Result<Vec<ServerDescriptor>, DirectoryError> {
        let token = self
            .auth
            .acquire_token()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if token.is_expired() {
            return Err(DirectoryError::Unauthorized);
        }

        let servers = self.control.list_servers(&token).await?;
        check_servers(&servers)?;
        debug!("Fetched {} servers from control plane", servers.len());
        Ok(servers)
    }
}

/// Directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Invalid server descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Directory rejected the token")]
    Unauthorized,

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

impl From<ControlError> for DirectoryError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Unauthorized => DirectoryError::Unauthorized,
            ControlError::Unreachable(msg) => DirectoryError::Unavailable(msg),
            ControlError::Malformed(msg) => DirectoryError::InvalidDescriptor(msg),
        }
    }
}

//! Configuration Resolver
//!
//! Turns a server descriptor and a bearer token into a complete
//! [`TunnelConfiguration`]:
//!
//! 1. Reject expired tokens locally (no request is sent)
//! 2. Generate a fresh key pair for the attempt
//! 3. Announce the public key to the control plane, retrying transport
//!    faults with bounded exponential backoff
//! 4. Validate the response and assemble the configuration
//!
//! The resolver holds no mutable state; concurrent attempts are the
//! supervisor's concern.

use crate::auth::BearerToken;
use crate::backoff::{Retry, RetryPolicy, retry_with_backoff};
use crate::cancel::CancelToken;
use crate::config::{Cidr, RoutingPolicy, TunnelConfiguration, default_dns};
use crate::control::{ConfigResponse, ControlError, ControlPlane};
use crate::directory::ServerDescriptor;
use crate::keys::{KeyError, KeyPair, PublicKey};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolver errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("Token rejected or expired; refresh it and reconnect")]
    Unauthorized,

    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(KeyError),

    #[error("Resolution cancelled")]
    Cancelled,
}

impl From<ControlError> for ResolveError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Unauthorized => ResolveError::Unauthorized,
            ControlError::Unreachable(msg) => ResolveError::ServerUnreachable(msg),
            ControlError::Malformed(msg) => ResolveError::MalformedResponse(msg),
        }
    }
}

/// Per-request timeout unless overridden
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration resolver
pub struct ConfigurationResolver {
    control: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
    request_timeout: Duration,
    routing: RoutingPolicy,
    fallback_dns: Vec<IpAddr>,
}

impl ConfigurationResolver {
    /// Create a resolver with default retry, timeout and routing
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self {
            control,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            routing: RoutingPolicy::Full,
            fallback_dns: default_dns(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_routing(mut self, routing: RoutingPolicy) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_fallback_dns(mut self, dns: Vec<IpAddr>) -> Self {
        self.fallback_dns = dns;
        self
    }

    /// Resolve a configuration with a freshly generated key pair
    pub async fn resolve(
        &self,
        server: &ServerDescriptor,
        token: &BearerToken,
        cancel: &CancelToken,
    ) -> Result<TunnelConfiguration, ResolveError> {
        if token.is_expired() {
            warn!("Token expired, not contacting control plane");
            return Err(ResolveError::Unauthorized);
        }

        let keys = KeyPair::generate().map_err(ResolveError::KeyGeneration)?;
        self.resolve_with_keys(server, token, keys, cancel).await
    }

    /// Resolve a configuration around a caller-supplied key pair.
    ///
    /// On any error the key pair is dropped (and wiped) here.
    pub async fn resolve_with_keys(
        &self,
        server: &ServerDescriptor,
        token: &BearerToken,
        keys: KeyPair,
        cancel: &CancelToken,
    ) -> Result<TunnelConfiguration, ResolveError> {
        if token.is_expired() {
            warn!("Token expired, not contacting control plane");
            return Err(ResolveError::Unauthorized);
        }

        let client_public = keys.public;
        let control = &self.control;
        let timeout = self.request_timeout;

        info!("Resolving tunnel configuration for {}", server.id);

        let response = retry_with_backoff(
            &self.retry,
            cancel,
            move |attempt| async move {
                debug!("Configuration request for {} (attempt {})", server.id, attempt);
                match tokio::time::timeout(timeout, control.request_config(server, token, &client_public)).await {
                    Ok(result) => result,
                    Err(_) => Err(ControlError::Unreachable(format!("request timed out after {:?}", timeout))),
                }
            },
            ControlError::is_retryable,
        )
        .await
        .map_err(|err| match err {
            Retry::Cancelled => ResolveError::Cancelled,
            Retry::Failed(e) => ResolveError::from(e),
        })?;

        self.assemble(server, keys, response)
    }

    fn assemble(
        &self,
        server: &ServerDescriptor,
        keys: KeyPair,
        response: ConfigResponse,
    ) -> Result<TunnelConfiguration, ResolveError> {
        let malformed = |what: String| ResolveError::MalformedResponse(what);

        let server_key = PublicKey::from_base64(&response.server_public_key)
            .map_err(|e| malformed(format!("server_public_key: {}", e)))?;
        if server_key != server.public_key {
            return Err(malformed(format!(
                "server key for {} does not match the directory",
                server.id
            )));
        }

        let assigned = response
            .allowed_ips
            .iter()
            .map(|s| s.parse::<Cidr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| malformed(e.to_string()))?;
        if assigned.is_empty() {
            return Err(malformed("allowed_ips is empty".into()));
        }
        let allowed_ips = self.routing.apply(assigned);

        let mut dns = response
            .dns
            .iter()
            .map(|s| s.trim().parse::<IpAddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| malformed(format!("dns: {}", e)))?;
        if dns.is_empty() {
            dns = self.fallback_dns.clone();
        }

        let address = response
            .address
            .as_deref()
            .map(str::parse::<Cidr>)
            .transpose()
            .map_err(|e| malformed(e.to_string()))?;

        let config = TunnelConfiguration::new(
            server.id.clone(),
            server_key,
            keys,
            server.endpoint.clone(),
            allowed_ips,
            dns,
            address,
        )
        .map_err(|e| malformed(e.to_string()))?;

        info!(
            "Resolved configuration for {} ({} allowed ranges, {} resolvers)",
            server.id,
            config.allowed_ips().len(),
            config.dns().len()
        );
        Ok(config)
    }
}

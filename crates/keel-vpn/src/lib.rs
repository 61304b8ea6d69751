//! Keel VPN - Client-side tunnel session manager
//!
//! Negotiates a tunnel configuration with a control plane, proves the
//! server's identity with a one-round-trip handshake over UDP, supervises
//! the link with keepalives and records each session.
//!
//! # Architecture
//!
//! ```text
//!  AuthGateway ──token──┐
//!                       ▼
//!  ServerDirectory ─▶ ConfigurationResolver ──▶ TunnelSupervisor ──▶ status feed
//!                       │  (KeyExchange)            │
//!                       ▼                           ├──▶ Connector / Link (UDP)
//!                   control plane (HTTP)            └──▶ SessionStore ──▶ session log
//! ```
//!
//! # Security
//!
//! - A fresh X25519 key pair per attempt, wiped when the attempt ends
//! - Low-order peer keys are rejected
//! - Keepalives sealed with ChaCha20-Poly1305
//! - No automatic reconnect: a failure stays until acknowledged

mod auth;
mod backoff;
mod cancel;
mod config;
mod control;
mod directory;
mod handshake;
mod keys;
mod resolver;
mod session;
mod settings;
mod state;
mod supervisor;
mod tunnel;

pub use auth::{AuthError, AuthGateway, BearerToken, StaticGateway};
pub use backoff::{Retry, RetryPolicy, retry_with_backoff};
pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use config::{Cidr, ConfigError, Endpoint, RoutingPolicy, Timings, TunnelConfiguration, default_dns};
pub use control::{
    ConfigRequest, ConfigResponse, ControlError, ControlPlane, HttpControlPlane, SessionReporter, SessionRequest,
    SessionResponse,
};
pub use directory::{DirectoryError, HttpDirectory, ServerDescriptor, ServerDirectory, StaticDirectory, recommend};
pub use handshake::{HandshakeError, Initiation, Responder, SessionKeys};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey, SharedSecret, derive_shared_secret, generate_key_pair};
pub use resolver::{ConfigurationResolver, DEFAULT_REQUEST_TIMEOUT, ResolveError};
pub use session::{Session, SessionError, SessionId, SessionLog, SessionStatus, SessionStore};
pub use settings::{ClientSettings, ConfigFormat, RetrySettings, SettingsError, TimeoutSettings};
pub use state::{ConnectionState, FailureReason, StatusEvent, StatusFeed};
pub use supervisor::{Collaborators, TunnelSupervisor};
pub use tunnel::{Connector, Link, LinkError, TunnelStats, UdpConnector, UdpResponder, UdpTunnel};

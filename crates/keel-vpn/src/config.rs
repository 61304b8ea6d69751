//! Tunnel Configuration
//!
//! Endpoint and address-range types, the immutable per-attempt
//! [`TunnelConfiguration`], the routing extension point, and the
//! supervisor's timing parameters.

use crate::keys::{KeyPair, PublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;

/// Network endpoint (host + UDP port)
///
/// The host is either an IP literal or a DNS name that is resolved when the
/// link is brought up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Create from an IP address
    pub fn from_ip(addr: IpAddr, port: u16) -> Self {
        Self::new(addr.to_string(), port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP literal, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Parse `host:port`, `a.b.c.d:port` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            (host, port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Address range in CIDR notation (e.g. `0.0.0.0/0`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Create a range, rejecting prefixes longer than the address family allows
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ConfigError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(ConfigError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { addr, prefix })
    }

    /// The unrestricted IPv4 range (full-tunnel routing)
    pub fn any_v4() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Check whether an address falls inside this range
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = ConfigError;

    /// Parse `addr/prefix`; a bare address is a single-host range
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidCidr(s.to_string());

        match s.trim().split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                Self::new(addr, prefix).map_err(|_| invalid())
            }
            None => {
                let addr: IpAddr = s.trim().parse().map_err(|_| invalid())?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                Self::new(addr, prefix)
            }
        }
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which destinations are routed through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "ranges", rename_all = "lowercase")]
pub enum RoutingPolicy {
    /// Route whatever the server assigns
    #[default]
    Full,
    /// Route only these ranges
    Split(Vec<Cidr>),
}

impl RoutingPolicy {
    /// Apply the policy to the server-assigned ranges
    pub fn apply(&self, assigned: Vec<Cidr>) -> Vec<Cidr> {
        match self {
            RoutingPolicy::Full => assigned,
            RoutingPolicy::Split(ranges) if !ranges.is_empty() => ranges.clone(),
            RoutingPolicy::Split(_) => assigned,
        }
    }
}

/// Negotiated parameters for one connection attempt.
///
/// Immutable once built. Owns the attempt's key pair, so dropping the
/// configuration wipes the client private key.
#[derive(Debug)]
pub struct TunnelConfiguration {
    server_id: String,
    server_public_key: PublicKey,
    client_keys: KeyPair,
    endpoint: Endpoint,
    allowed_ips: Vec<Cidr>,
    dns: Vec<IpAddr>,
    address: Option<Cidr>,
}

impl TunnelConfiguration {
    /// Assemble a configuration; `allowed_ips` must not be empty
    pub fn new(
        server_id: impl Into<String>,
        server_public_key: PublicKey,
        client_keys: KeyPair,
        endpoint: Endpoint,
        allowed_ips: Vec<Cidr>,
        dns: Vec<IpAddr>,
        address: Option<Cidr>,
    ) -> Result<Self, ConfigError> {
        if allowed_ips.is_empty() {
            return Err(ConfigError::EmptyAllowedIps);
        }

        Ok(Self {
            server_id: server_id.into(),
            server_public_key,
            client_keys,
            endpoint,
            allowed_ips,
            dns,
            address,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn server_public_key(&self) -> &PublicKey {
        &self.server_public_key
    }

    pub fn client_keys(&self) -> &KeyPair {
        &self.client_keys
    }

    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_keys.public
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn allowed_ips(&self) -> &[Cidr] {
        &self.allowed_ips
    }

    pub fn dns(&self) -> &[IpAddr] {
        &self.dns
    }

    /// Interface address assigned by the server, if any
    pub fn address(&self) -> Option<Cidr> {
        self.address
    }
}

/// Supervisor timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Handshake timeout (also bounds each keepalive reply)
    pub handshake_timeout: Duration,
    /// Keepalive period while connected
    pub keepalive_interval: Duration,
    /// Consecutive missed keepalives before the link is declared lost
    pub keepalive_misses: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(25),
            keepalive_misses: 3,
        }
    }
}

/// Fallback resolvers used when the server assigns none
pub fn default_dns() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
        IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
    ]
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid address range: {0}")]
    InvalidCidr(String),

    #[error("Allowed IP set is empty")]
    EmptyAllowedIps,
}

//! Connection state and the status feed

use crate::resolver::ResolveError;
use crate::tunnel::LinkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::debug;

/// Why an attempt or a live tunnel failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Unauthorized,
    ServerUnreachable,
    ProtocolError,
    HandshakeTimeout,
    LinkLost,
    UnknownServer,
    KeyGeneration,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::ServerUnreachable => "server unreachable",
            FailureReason::ProtocolError => "protocol error",
            FailureReason::HandshakeTimeout => "handshake timeout",
            FailureReason::LinkLost => "link lost",
            FailureReason::UnknownServer => "unknown server",
            FailureReason::KeyGeneration => "key generation",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ResolveError> for FailureReason {
    fn from(err: &ResolveError) -> Self {
        match err {
            ResolveError::Unauthorized => FailureReason::Unauthorized,
            ResolveError::ServerUnreachable(_) => FailureReason::ServerUnreachable,
            ResolveError::MalformedResponse(_) => FailureReason::ProtocolError,
            ResolveError::KeyGeneration(_) => FailureReason::KeyGeneration,
            // never surfaced: a cancelled attempt ends in Disconnected
            ResolveError::Cancelled => FailureReason::ServerUnreachable,
        }
    }
}

impl From<&LinkError> for FailureReason {
    fn from(err: &LinkError) -> Self {
        match err {
            LinkError::Timeout => FailureReason::HandshakeTimeout,
            LinkError::Unreachable(_) => FailureReason::ServerUnreachable,
            LinkError::Protocol(_) => FailureReason::ProtocolError,
            LinkError::KeyGeneration(_) => FailureReason::KeyGeneration,
            LinkError::Closed => FailureReason::LinkLost,
        }
    }
}

/// Connection state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed(FailureReason),
}

impl ConnectionState {
    /// Check if tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connecting or Connected: `connect` is a no-op
    pub fn is_busy(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            ConnectionState::Failed(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnecting => f.write_str("disconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// One state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Strictly increasing, starting at 1
    pub sequence: u64,
    pub timestamp: SystemTime,
    pub state: ConnectionState,
    /// Human-readable detail, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ordered broadcast of state transitions
///
/// Callers serialize `publish` (the supervisor holds its state lock), so
/// sequence numbers go out in order.
pub struct StatusFeed {
    tx: broadcast::Sender<StatusEvent>,
    sequence: u64,
}

impl StatusFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, sequence: 0 }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Sender handle for subscribing without access to the feed
    pub fn sender(&self) -> broadcast::Sender<StatusEvent> {
        self.tx.clone()
    }

    /// Sequence number of the last published event
    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    pub fn publish(&mut self, state: ConnectionState, reason: Option<String>) -> StatusEvent {
        self.sequence += 1;
        let event = StatusEvent {
            sequence: self.sequence,
            timestamp: SystemTime::now(),
            state,
            reason,
        };

        debug!("Status #{}: {}", event.sequence, event.state);
        // no receivers is fine
        let _ = self.tx.send(event.clone());
        event
    }
}

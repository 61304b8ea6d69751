//! Bearer token acquisition
//!
//! The account flow itself lives outside this crate. The session manager
//! only needs a token to authorize configuration requests, and a way to
//! ask for a fresh one.

use async_trait::async_trait;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Bearer token with expiry
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: String,
    expires_at: SystemTime,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Token valid for `ttl` from now
    pub fn valid_for(value: impl Into<String>, ttl: Duration) -> Self {
        Self::new(value, SystemTime::now() + ttl)
    }

    /// Raw token value for the `Authorization` header
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= SystemTime::now()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of bearer tokens
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Current token for the signed-in user
    async fn acquire_token(&self) -> Result<BearerToken, AuthError>;

    /// Exchange an old token for a fresh one
    async fn refresh_token(&self, old: &BearerToken) -> Result<BearerToken, AuthError>;

    /// Identity of the signed-in user, recorded on each Session
    fn user_id(&self) -> String;
}

/// Gateway serving a fixed token, e.g. one read from settings
pub struct StaticGateway {
    user_id: String,
    token: Mutex<BearerToken>,
    ttl: Duration,
}

impl StaticGateway {
    pub fn new(user_id: impl Into<String>, token: BearerToken, ttl: Duration) -> Self {
        Self {
            user_id: user_id.into(),
            token: Mutex::new(token),
            ttl,
        }
    }
}

#[async_trait]
impl AuthGateway for StaticGateway {
    async fn acquire_token(&self) -> Result<BearerToken, AuthError> {
        let token = self
            .token
            .lock()
            .map_err(|_| AuthError::Unavailable("token lock poisoned".into()))?
            .clone();
        if token.value().is_empty() {
            return Err(AuthError::NotSignedIn);
        }
        Ok(token)
    }

    async fn refresh_token(&self, old: &BearerToken) -> Result<BearerToken, AuthError> {
        let mut current = self
            .token
            .lock()
            .map_err(|_| AuthError::Unavailable("token lock poisoned".into()))?;

        if current.value().is_empty() {
            return Err(AuthError::NotSignedIn);
        }
        if current.value() != old.value() {
            return Ok(current.clone());
        }

        debug!("Extending static token for {}", self.user_id);
        *current = BearerToken::valid_for(old.value(), self.ttl);
        Ok(current.clone())
    }

    fn user_id(&self) -> String {
        self.user_id.clone()
    }
}

/// Token acquisition errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Not signed in")]
    NotSignedIn,

    #[error("Auth service unavailable: {0}")]
    Unavailable(String),
}

//! X25519 Key Exchange
//!
//! Ephemeral key pairs are generated fresh for every connection attempt and
//! combined with a server's long-term public key into the shared tunnel
//! secret.
//!
//! Private material never leaves this module in printable form: there is no
//! encoder for [`PrivateKey`], and every `Debug` impl is redacted. The
//! underlying `StaticSecret` and [`SharedSecret`] are wiped when dropped.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every X25519 key and of the shared secret
pub const KEY_LEN: usize = 32;

/// Client private key (Curve25519)
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key from the OS entropy source
    pub fn generate() -> Result<Self, KeyError> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeyError::EntropyUnavailable(e.to_string()))?;

        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Curve25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    /// Create from a slice, checking the length
    pub fn from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; KEY_LEN] = slice
            .try_into()
            .map_err(|_| KeyError::InvalidLength(slice.len()))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;
        Self::from_slice(&bytes)
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.key.to_bytes()
    }

    /// Borrow raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.key.as_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// A key pair owned by exactly one connection attempt.
///
/// Not `Clone`: dropping the pair on teardown or failure is what wipes the
/// private half.
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self, KeyError> {
        PrivateKey::generate().map(Self::from_private)
    }

    /// Create from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Diffie-Hellman with a parsed peer key.
    ///
    /// Low-order peer points yield an all-zero output and are rejected.
    pub fn shared_secret(&self, remote: &PublicKey) -> Result<SharedSecret, KeyError> {
        let shared = self.private.secret.diffie_hellman(&remote.key);
        if !shared.was_contributory() {
            return Err(KeyError::InvalidPeerKey("low-order point"));
        }

        Ok(SharedSecret {
            bytes: shared.to_bytes(),
        })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

/// Shared tunnel secret
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; KEY_LEN],
}

impl SharedSecret {
    /// Borrow the secret bytes for key derivation
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([redacted])")
    }
}

/// Generate a fresh key pair for a connection attempt
pub fn generate_key_pair() -> Result<KeyPair, KeyError> {
    KeyPair::generate()
}

/// Derive the shared secret between a local key pair and raw peer key bytes.
///
/// Pure: no I/O, no state. Any malformed or low-order peer key is reported
/// as [`KeyError::InvalidPeerKey`].
pub fn derive_shared_secret(local: &KeyPair, remote_public: &[u8]) -> Result<SharedSecret, KeyError> {
    let remote = PublicKey::from_slice(remote_public)
        .map_err(|_| KeyError::InvalidPeerKey("wrong length"))?;
    local.shared_secret(&remote)
}

/// Key errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes, got {0})")]
    InvalidLength(usize),

    #[error("Invalid peer key: {0}")]
    InvalidPeerKey(&'static str),

    #[error("Entropy source unavailable: {0}")]
    EntropyUnavailable(String),
}

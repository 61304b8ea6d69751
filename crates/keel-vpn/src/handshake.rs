//! One-round-trip handshake protocol
//!
//! A single round trip that proves both peers hold the private keys for
//! the public keys they claim, and derives transport keys for keepalives.
//!
//! # Messages
//!
//! All integers are little-endian. `K = X25519(client, server)`.
//!
//! ```text
//! Initiation (72 bytes)
//!   type=0x01 | reserved[3] | sender_index u32 | client_public[32]
//!   | challenge[16] | mac[16] = MAC(H("keel init mac" || K), bytes[0..56])
//!
//! Response (28 bytes)
//!   type=0x02 | reserved[3] | sender_index u32 | receiver_index u32
//!   | mac[16] = MAC(H("keel resp mac" || K), bytes[0..12] || challenge)
//!
//! Transport (16-byte header + ChaCha20-Poly1305 ciphertext)
//!   type=0x04 | reserved[3] | receiver_index u32 | counter u64 | sealed
//! ```
//!
//! `H` is BLAKE2s-256, `MAC` is keyed BLAKE2s with a 16-byte tag. Transport
//! keys are `H("keel c2s" || K || challenge)` and `H("keel s2c" || K ||
//! challenge)`. An empty transport payload is a keepalive.

use crate::config::TunnelConfiguration;
use crate::keys::{KEY_LEN, KeyError, KeyPair, PublicKey, SharedSecret};
use blake2::digest::KeyInit as MacKeyInit;
use blake2::digest::Mac;
use blake2::digest::consts::U16;
use blake2::{Blake2s256, Blake2sMac, Digest};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const MSG_INITIATION: u8 = 0x01;
pub const MSG_RESPONSE: u8 = 0x02;
pub const MSG_TRANSPORT: u8 = 0x04;

pub const INITIATION_LEN: usize = 72;
pub const RESPONSE_LEN: usize = 28;
pub const TRANSPORT_HEADER_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

const CHALLENGE_LEN: usize = 16;

const LABEL_INIT_MAC: &[u8] = b"keel init mac";
const LABEL_RESP_MAC: &[u8] = b"keel resp mac";
const LABEL_C2S: &[u8] = b"keel c2s";
const LABEL_S2C: &[u8] = b"keel s2c";

/// Handshake and transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("Malformed message: {0}")]
    Malformed(&'static str),

    #[error("Peer failed to prove possession of its key")]
    PeerAuthentication,

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Replayed or stale packet")]
    Replay,

    #[error("Crypto failure: {0}")]
    Crypto(&'static str),
}

fn hash(parts: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn keyed_mac(key: &[u8; KEY_LEN], parts: &[&[u8]]) -> Result<Blake2sMac<U16>, HandshakeError> {
    let mut mac = <Blake2sMac<U16> as MacKeyInit>::new_from_slice(key)
        .map_err(|_| HandshakeError::Crypto("mac key"))?;
    for part in parts {
        Mac::update(&mut mac, part);
    }
    Ok(mac)
}

fn mac_tag(key: &[u8; KEY_LEN], parts: &[&[u8]]) -> Result<[u8; TAG_LEN], HandshakeError> {
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&keyed_mac(key, parts)?.finalize().into_bytes());
    Ok(tag)
}

fn mac_verify(key: &[u8; KEY_LEN], parts: &[&[u8]], tag: &[u8]) -> Result<(), HandshakeError> {
    keyed_mac(key, parts)?
        .verify_slice(tag)
        .map_err(|_| HandshakeError::PeerAuthentication)
}

fn random_bytes<const N: usize>() -> Result<[u8; N], HandshakeError> {
    let mut out = [0u8; N];
    OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| HandshakeError::Key(KeyError::EntropyUnavailable(e.to_string())))?;
    Ok(out)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Receiver index of a transport packet, if it looks like one
pub fn transport_receiver(packet: &[u8]) -> Option<u32> {
    if packet.len() < TRANSPORT_HEADER_LEN + TAG_LEN || packet[0] != MSG_TRANSPORT {
        return None;
    }
    Some(read_u32(packet, 4))
}

/// Per-link transport keys and counters
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    send_key: [u8; KEY_LEN],
    recv_key: [u8; KEY_LEN],
    local_index: u32,
    remote_index: u32,
    send_counter: u64,
    recv_counter: Option<u64>,
}

impl SessionKeys {
    fn derive(shared: &SharedSecret, challenge: &[u8; CHALLENGE_LEN], initiator: bool, local_index: u32, remote_index: u32) -> Self {
        let c2s = hash(&[LABEL_C2S, shared.as_bytes(), challenge]);
        let s2c = hash(&[LABEL_S2C, shared.as_bytes(), challenge]);
        let (send_key, recv_key) = if initiator { (c2s, s2c) } else { (s2c, c2s) };

        Self {
            send_key,
            recv_key,
            local_index,
            remote_index,
            send_counter: 0,
            recv_counter: None,
        }
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    /// Seal a payload into a transport packet (empty payload = keepalive)
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let counter = self.send_counter;
        self.send_counter = counter
            .checked_add(1)
            .ok_or(HandshakeError::Crypto("send counter exhausted"))?;

        let mut packet = Vec::with_capacity(TRANSPORT_HEADER_LEN + payload.len() + TAG_LEN);
        packet.push(MSG_TRANSPORT);
        packet.extend_from_slice(&[0x00, 0x00, 0x00]);
        packet.extend_from_slice(&self.remote_index.to_le_bytes());
        packet.extend_from_slice(&counter.to_le_bytes());

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.send_key));
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce(counter)),
                Payload {
                    msg: payload,
                    aad: &packet[..TRANSPORT_HEADER_LEN],
                },
            )
            .map_err(|_| HandshakeError::Crypto("seal"))?;
        packet.extend_from_slice(&sealed);
        Ok(packet)
    }

    /// Authenticate and decrypt a transport packet
    pub fn open(&mut self, packet: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if packet.len() < TRANSPORT_HEADER_LEN + TAG_LEN {
            return Err(HandshakeError::Malformed("transport too short"));
        }
        if packet[0] != MSG_TRANSPORT {
            return Err(HandshakeError::Malformed("not a transport packet"));
        }
        if read_u32(packet, 4) != self.local_index {
            return Err(HandshakeError::Malformed("unknown receiver index"));
        }

        let counter = read_u64(packet, 8);
        if self.recv_counter.is_some_and(|last| counter <= last) {
            return Err(HandshakeError::Replay);
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.recv_key));
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&nonce(counter)),
                Payload {
                    msg: &packet[TRANSPORT_HEADER_LEN..],
                    aad: &packet[..TRANSPORT_HEADER_LEN],
                },
            )
            .map_err(|_| HandshakeError::PeerAuthentication)?;

        self.recv_counter = Some(counter);
        Ok(plain)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("send_counter", &self.send_counter)
            .finish_non_exhaustive()
    }
}

fn nonce(counter: u64) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[4..].copy_from_slice(&counter.to_le_bytes());
    n
}

/// Client side of an in-flight handshake
pub struct Initiation {
    sender_index: u32,
    challenge: [u8; CHALLENGE_LEN],
    shared: SharedSecret,
}

impl Initiation {
    /// Build the initiation message for a resolved configuration
    pub fn start(config: &TunnelConfiguration) -> Result<(Self, Vec<u8>), HandshakeError> {
        let shared = config.client_keys().shared_secret(config.server_public_key())?;
        let sender_index = u32::from_le_bytes(random_bytes::<4>()?);
        let challenge = random_bytes::<CHALLENGE_LEN>()?;

        let mut msg = Vec::with_capacity(INITIATION_LEN);
        msg.push(MSG_INITIATION);
        msg.extend_from_slice(&[0x00, 0x00, 0x00]);
        msg.extend_from_slice(&sender_index.to_le_bytes());
        msg.extend_from_slice(config.client_public_key().as_bytes());
        msg.extend_from_slice(&challenge);

        let mac_key = hash(&[LABEL_INIT_MAC, shared.as_bytes()]);
        let tag = mac_tag(&mac_key, &[&msg])?;
        msg.extend_from_slice(&tag);

        Ok((
            Self {
                sender_index,
                challenge,
                shared,
            },
            msg,
        ))
    }

    pub fn sender_index(&self) -> u32 {
        self.sender_index
    }

    /// Verify the responder's proof and derive transport keys
    pub fn complete(self, response: &[u8]) -> Result<SessionKeys, HandshakeError> {
        if response.len() != RESPONSE_LEN {
            return Err(HandshakeError::Malformed("response length"));
        }
        if response[0] != MSG_RESPONSE {
            return Err(HandshakeError::Malformed("not a handshake response"));
        }
        if read_u32(response, 8) != self.sender_index {
            return Err(HandshakeError::Malformed("response for another initiation"));
        }

        let mac_key = hash(&[LABEL_RESP_MAC, self.shared.as_bytes()]);
        mac_verify(&mac_key, &[&response[..12], &self.challenge], &response[12..])?;

        let responder_index = read_u32(response, 4);
        Ok(SessionKeys::derive(
            &self.shared,
            &self.challenge,
            true,
            self.sender_index,
            responder_index,
        ))
    }
}

/// Server side of the handshake
pub struct Responder {
    keys: KeyPair,
}

impl Responder {
    pub fn new(keys: KeyPair) -> Self {
        Self { keys }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    /// Validate an initiation and produce the response plus transport keys
    pub fn respond(&self, init: &[u8]) -> Result<(Vec<u8>, SessionKeys), HandshakeError> {
        if init.len() != INITIATION_LEN {
            return Err(HandshakeError::Malformed("initiation length"));
        }
        if init[0] != MSG_INITIATION {
            return Err(HandshakeError::Malformed("not a handshake initiation"));
        }

        let sender_index = read_u32(init, 4);
        let client_public = PublicKey::from_slice(&init[8..40])?;
        let mut challenge = [0u8; CHALLENGE_LEN];
        challenge.copy_from_slice(&init[40..56]);

        let shared = self.keys.shared_secret(&client_public)?;
        let init_key = hash(&[LABEL_INIT_MAC, shared.as_bytes()]);
        mac_verify(&init_key, &[&init[..56]], &init[56..])?;

        let responder_index = u32::from_le_bytes(random_bytes::<4>()?);

        let mut msg = Vec::with_capacity(RESPONSE_LEN);
        msg.push(MSG_RESPONSE);
        msg.extend_from_slice(&[0x00, 0x00, 0x00]);
        msg.extend_from_slice(&responder_index.to_le_bytes());
        msg.extend_from_slice(&sender_index.to_le_bytes());

        let resp_key = hash(&[LABEL_RESP_MAC, shared.as_bytes()]);
        let tag = mac_tag(&resp_key, &[&msg, &challenge])?;
        msg.extend_from_slice(&tag);

        let session = SessionKeys::derive(&shared, &challenge, false, responder_index, sender_index);
        Ok((msg, session))
    }
}

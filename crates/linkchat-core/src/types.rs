//! Core types for linkchat
//!
//! Newtypes for key material and time keep raw byte slices and integers from being
//! mixed up at module boundaries.

use core::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CipherError;

// ----------------------------------------------------------------------------
// Public Key
// ----------------------------------------------------------------------------

/// Length of an X25519 public key in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

/// X25519 public key of a device
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Wrap raw key bytes
    pub fn new(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key from an untrusted byte slice
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        let array: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CipherError::InvalidKeyEncoding)?;
        Ok(Self(array))
    }

    /// Parse a key from its standard base64 text form
    pub fn from_base64(text: &str) -> Result<Self, CipherError> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|_| CipherError::InvalidKeyEncoding)?;
        Self::from_bytes(&bytes)
    }

    /// Encode the key as standard base64 for out-of-band sharing
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// SHA-256 fingerprint used for out-of-band verification
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(self.0);
        Fingerprint(digest.into())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint().short())
    }
}

// ----------------------------------------------------------------------------
// Fingerprint
// ----------------------------------------------------------------------------

/// SHA-256 fingerprint of a device public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex characters, enough to tell keys apart in logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Peer Descriptor
// ----------------------------------------------------------------------------

/// A known contact: display name plus the key messages to it are sealed with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub display_name: String,
    pub public_key: PublicKey,
}

impl PeerDescriptor {
    /// Create a descriptor from an already-parsed key
    pub fn new(display_name: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            display_name: display_name.into(),
            public_key,
        }
    }

    /// Create a descriptor from the base64 key text carried by a contact code
    pub fn from_base64(display_name: impl Into<String>, key: &str) -> Result<Self, CipherError> {
        Ok(Self::new(display_name, PublicKey::from_base64(key)?))
    }
}

// ----------------------------------------------------------------------------
// Direction and Frames
// ----------------------------------------------------------------------------

/// Which way a message travelled relative to this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Ciphertext in flight between the cipher and the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub bytes: Vec<u8>,
    pub direction: Direction,
}

impl MessageFrame {
    pub fn outbound(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            direction: Direction::Outbound,
        }
    }

    pub fn inbound(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            direction: Direction::Inbound,
        }
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from milliseconds
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(millis as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Key material for beacon sealing
//
// The local node holds one long-lived X25519 key pair. Peers are known only by
// their 32-byte X25519 public key, learned at discovery time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// Length of every public key handled by this crate.
pub const PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),
}

/// Opaque peer identifier assigned by the discovery layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A peer's X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerPublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PeerPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for logs. Never used as an identifier.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerPublicKey({})", self.short())
    }
}

impl fmt::Display for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PeerPublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// The local node's long-lived X25519 key pair.
///
/// Equality compares public halves only, so two handles to the same identity
/// compare equal without ever comparing secret material.
#[derive(Clone)]
pub struct LocalKeyPair {
    secret: StaticSecret,
    public: PeerPublicKey,
}

impl LocalKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self::from_secret(secret)
    }

    /// Rebuild a key pair from its 32 secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let mut array: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        let secret = StaticSecret::from(array);
        array.zeroize();
        Ok(Self::from_secret(secret))
    }

    pub fn from_secret_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))?,
        );
        Self::from_secret_bytes(&bytes)
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PeerPublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PeerPublicKey {
        self.public
    }

    /// Secret bytes, wiped on drop. Only the CLI key file uses this.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub(crate) fn diffie_hellman(&self, peer: &PeerPublicKey) -> SharedSecret {
        self.secret.diffie_hellman(&peer.to_x25519())
    }
}

impl PartialEq for LocalKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for LocalKeyPair {}

impl fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

// Per-peer beacon sealing: X25519 ECDH + XChaCha20-Poly1305
//
// Seal flow:
// 1. Generate a fresh ephemeral X25519 keypair for this one beacon
// 2. ECDH: ephemeral_secret × recipient_public → unlock secret
// 3. KDF: Blake3::derive_key(UNLOCK_CONTEXT, unlock secret) → symmetric key
// 4. ECDH: local_secret × recipient_public → proof key (authenticates sender)
// 5. Encrypt: XChaCha20-Poly1305(key, random nonce, flags || expiry || sender || proof)
// 6. Output: ephemeral_pub (32) || nonce (24) || ciphertext (57 + 16 tag)
//
// Recipient reverses with its own static secret and the ephemeral public key,
// then recomputes the proof from the sender key found inside the plaintext.
// Every blob has the same length and a fresh ephemeral key, so an observer
// cannot tell which peer a blob targets or link two blobs to one peer.

use crate::identity::{LocalKeyPair, PeerPublicKey, PUBLIC_KEY_LEN};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroize;

/// KDF context for the per-beacon unlock key.
/// Changing this breaks compatibility with every deployed reader.
const UNLOCK_CONTEXT: &str = "meshbeacon v1 beacon unlock 2026-10-01";

/// KDF context for the static sender proof key.
const PROOF_CONTEXT: &str = "meshbeacon v1 beacon sender proof 2026-10-01";

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const PROOF_LEN: usize = 16;

/// flags (1) + expires_at (8) + sender key (32) + proof (16)
const PLAINTEXT_LEN: usize = 1 + 8 + PUBLIC_KEY_LEN + PROOF_LEN;

/// Total size of one sealed beacon on the wire.
pub const SEALED_BEACON_LEN: usize = PUBLIC_KEY_LEN + NONCE_LEN + PLAINTEXT_LEN + TAG_LEN;

/// Flag bit announcing that the sender holds data for the recipient.
pub const FLAG_DATA_AVAILABLE: u8 = 0x01;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid beacon length: {0}")]
    InvalidLength(usize),
    #[error("Key agreement produced a non-contributory secret")]
    WeakKey,
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Sender proof mismatch")]
    ProofMismatch,
}

/// What a recipient learns after opening a beacon addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconPlaintext {
    pub flags: u8,
    /// Unix milliseconds after which the beacon must be ignored
    pub expires_at: u64,
    /// Public key of the node that issued the beacon
    pub sender: PeerPublicKey,
}

impl BeaconPlaintext {
    pub fn data_available(&self) -> bool {
        self.flags & FLAG_DATA_AVAILABLE != 0
    }
}

fn sender_proof(
    local: &LocalKeyPair,
    other: &PeerPublicKey,
    ephemeral_public: &[u8; PUBLIC_KEY_LEN],
    expires_at: u64,
) -> [u8; PROOF_LEN] {
    let static_secret = local.diffie_hellman(other);
    let mut proof_key = blake3::derive_key(PROOF_CONTEXT, static_secret.as_bytes());

    let mut hasher = blake3::Hasher::new_keyed(&proof_key);
    hasher.update(ephemeral_public);
    hasher.update(&expires_at.to_be_bytes());
    let hash = hasher.finalize();
    proof_key.zeroize();

    let mut proof = [0u8; PROOF_LEN];
    proof.copy_from_slice(&hash.as_bytes()[..PROOF_LEN]);
    proof
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Seal a beacon for one recipient.
///
/// # Arguments
/// * `local` - The issuing node's static key pair
/// * `recipient` - The recipient peer's public key
/// * `flags` - Beacon flags (see [`FLAG_DATA_AVAILABLE`])
/// * `expires_at` - Expiration in Unix milliseconds
pub fn seal_beacon(
    local: &LocalKeyPair,
    recipient: &PeerPublicKey,
    flags: u8,
    expires_at: u64,
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret).to_bytes();

    let shared_secret = ephemeral_secret.diffie_hellman(&recipient.to_x25519());
    if !shared_secret.was_contributory() {
        return Err(CryptoError::WeakKey);
    }
    let mut unlock_key = blake3::derive_key(UNLOCK_CONTEXT, shared_secret.as_bytes());

    let proof = sender_proof(local, recipient, &ephemeral_public, expires_at);

    let mut plaintext = [0u8; PLAINTEXT_LEN];
    plaintext[0] = flags;
    plaintext[1..9].copy_from_slice(&expires_at.to_be_bytes());
    plaintext[9..9 + PUBLIC_KEY_LEN].copy_from_slice(local.public_key().as_bytes());
    plaintext[9 + PUBLIC_KEY_LEN..].copy_from_slice(&proof);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(&unlock_key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    unlock_key.zeroize();

    // Ephemeral key is bound as AAD so it cannot be swapped onto another ciphertext
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: &plaintext,
                aad: &ephemeral_public,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    plaintext.zeroize();

    let mut sealed = Vec::with_capacity(SEALED_BEACON_LEN);
    sealed.extend_from_slice(&ephemeral_public);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Try to open a sealed beacon with the local key.
///
/// Any error means "not addressed to me"; callers should not treat it as fatal.
pub fn open_beacon(local: &LocalKeyPair, sealed: &[u8]) -> Result<BeaconPlaintext, CryptoError> {
    if sealed.len() != SEALED_BEACON_LEN {
        return Err(CryptoError::InvalidLength(sealed.len()));
    }

    let mut ephemeral_public = [0u8; PUBLIC_KEY_LEN];
    ephemeral_public.copy_from_slice(&sealed[..PUBLIC_KEY_LEN]);
    let nonce = XNonce::from_slice(&sealed[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + NONCE_LEN]);
    let ciphertext = &sealed[PUBLIC_KEY_LEN + NONCE_LEN..];

    let shared_secret = local.diffie_hellman(&PeerPublicKey(ephemeral_public));
    if !shared_secret.was_contributory() {
        return Err(CryptoError::WeakKey);
    }
    let mut unlock_key = blake3::derive_key(UNLOCK_CONTEXT, shared_secret.as_bytes());

    let cipher = XChaCha20Poly1305::new_from_slice(&unlock_key)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    unlock_key.zeroize();

    let mut plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &ephemeral_public,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    if plaintext.len() != PLAINTEXT_LEN {
        plaintext.zeroize();
        return Err(CryptoError::DecryptionFailed);
    }

    let flags = plaintext[0];
    let mut expires = [0u8; 8];
    expires.copy_from_slice(&plaintext[1..9]);
    let expires_at = u64::from_be_bytes(expires);
    let sender = PeerPublicKey::from_bytes(&plaintext[9..9 + PUBLIC_KEY_LEN])
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let expected = sender_proof(local, &sender, &ephemeral_public, expires_at);
    let proof_ok = constant_time_eq(&expected, &plaintext[9 + PUBLIC_KEY_LEN..]);
    plaintext.zeroize();
    if !proof_ok {
        return Err(CryptoError::ProofMismatch);
    }

    Ok(BeaconPlaintext {
        flags,
        expires_at,
        sender,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let sender = LocalKeyPair::generate();
        let recipient = LocalKeyPair::generate();

        let sealed =
            seal_beacon(&sender, &recipient.public_key(), FLAG_DATA_AVAILABLE, 1_000).unwrap();
        assert_eq!(sealed.len(), SEALED_BEACON_LEN);

        let opened = open_beacon(&recipient, &sealed).unwrap();
        assert_eq!(opened.sender, sender.public_key());
        assert_eq!(opened.expires_at, 1_000);
        assert!(opened.data_available());
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let sender = LocalKeyPair::generate();
        let recipient = LocalKeyPair::generate();
        let other = LocalKeyPair::generate();

        let sealed = seal_beacon(&sender, &recipient.public_key(), 1, 1_000).unwrap();
        assert_eq!(
            open_beacon(&other, &sealed),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let sender = LocalKeyPair::generate();
        let recipient = LocalKeyPair::generate();

        let mut sealed = seal_beacon(&sender, &recipient.public_key(), 1, 1_000).unwrap();
        if let Some(byte) = sealed.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(open_beacon(&recipient, &sealed).is_err());
    }

    #[test]
    fn test_swapped_ephemeral_key_fails() {
        let sender = LocalKeyPair::generate();
        let recipient = LocalKeyPair::generate();

        let a = seal_beacon(&sender, &recipient.public_key(), 1, 1_000).unwrap();
        let b = seal_beacon(&sender, &recipient.public_key(), 1, 1_000).unwrap();
        let mut spliced = b[..PUBLIC_KEY_LEN].to_vec();
        spliced.extend_from_slice(&a[PUBLIC_KEY_LEN..]);

        assert!(open_beacon(&recipient, &spliced).is_err());
    }

    #[test]
    fn test_same_recipient_beacons_do_not_repeat() {
        let sender = LocalKeyPair::generate();
        let recipient = LocalKeyPair::generate();

        let a = seal_beacon(&sender, &recipient.public_key(), 1, 1_000).unwrap();
        let b = seal_beacon(&sender, &recipient.public_key(), 1, 1_000).unwrap();

        // Fresh ephemeral key and nonce every time: no shared bytes to link on
        assert_ne!(a[..PUBLIC_KEY_LEN], b[..PUBLIC_KEY_LEN]);
        assert_ne!(a[PUBLIC_KEY_LEN..], b[PUBLIC_KEY_LEN..]);
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn test_short_input_rejected() {
        let recipient = LocalKeyPair::generate();
        assert_eq!(
            open_beacon(&recipient, &[0u8; 10]),
            Err(CryptoError::InvalidLength(10))
        );
    }

    #[test]
    fn test_all_zero_ephemeral_key_rejected() {
        let recipient = LocalKeyPair::generate();
        let blob = vec![0u8; SEALED_BEACON_LEN];
        assert_eq!(open_beacon(&recipient, &blob), Err(CryptoError::WeakKey));
    }
}

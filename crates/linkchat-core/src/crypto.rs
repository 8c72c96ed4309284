//! Sealed-box cipher for message frames
//!
//! Every call to [`Cipher::encrypt`] generates a fresh ephemeral X25519 key, agrees a
//! shared secret with the recipient's static key, and derives a ChaCha20-Poly1305 key
//! and nonce from it with HKDF-SHA256. Only the holder of the recipient's secret can
//! open the frame, and any modification is rejected by the AEAD tag.
//!
//! Frame layout:
//!
//! ```text
//! +---------+----------------------+------------------------------+
//! | version | ephemeral public key | ciphertext || poly1305 tag  |
//! | 1 byte  | 32 bytes             | plaintext len + 16 bytes     |
//! +---------+----------------------+------------------------------+
//! ```

use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret};
use zeroize::Zeroizing;

use crate::errors::CipherError;
use crate::identity::Identity;
use crate::types::{PublicKey, PUBLIC_KEY_LEN};

/// Frame format version
pub const SEAL_VERSION: u8 = 0x01;

/// Largest plaintext accepted by a single encrypt call
pub const MAX_PLAINTEXT_LEN: usize = 245;

const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + PUBLIC_KEY_LEN;

/// Bytes a sealed frame adds on top of its plaintext
pub const SEAL_OVERHEAD: usize = HEADER_LEN + TAG_LEN;

/// Largest frame the cipher will ever produce
pub const MAX_SEALED_LEN: usize = MAX_PLAINTEXT_LEN + SEAL_OVERHEAD;

const KDF_INFO: &[u8] = b"linkchat-seal-v1";

/// Encrypts to peers and decrypts with the local identity
#[derive(Debug, Clone)]
pub struct Cipher {
    identity: Arc<Identity>,
}

impl Cipher {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self { identity }
    }

    /// Public key frames must be sealed to for this cipher to open them
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Seal `plaintext` so only the owner of `recipient_public_key` can read it
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        recipient_public_key: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CipherError::PlaintextTooLarge {
                size: plaintext.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }
        let recipient = PublicKey::from_bytes(recipient_public_key)?;
        let recipient_point = X25519PublicKey::from(*recipient.as_bytes());

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient_point);
        if !shared.was_contributory() {
            return Err(CipherError::InvalidKeyEncoding);
        }

        let (key, nonce) =
            derive_key_nonce(&shared, ephemeral_public.as_bytes(), recipient.as_bytes())
                .ok_or(CipherError::EncryptionFailed)?;

        let mut frame = Vec::with_capacity(plaintext.len() + SEAL_OVERHEAD);
        frame.push(SEAL_VERSION);
        frame.extend_from_slice(ephemeral_public.as_bytes());

        let aead = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let sealed = aead
            .encrypt(
                Nonce::from_slice(nonce.as_slice()),
                Payload {
                    msg: plaintext,
                    aad: &frame[..HEADER_LEN],
                },
            )
            .map_err(|_| CipherError::EncryptionFailed)?;
        frame.extend_from_slice(&sealed);

        debug!(
            "Sealed {} bytes for {}",
            plaintext.len(),
            recipient.fingerprint().short()
        );
        Ok(frame)
    }

    /// Seal to a parsed public key
    pub fn encrypt_for(
        &self,
        plaintext: &[u8],
        recipient: &PublicKey,
    ) -> Result<Vec<u8>, CipherError> {
        self.encrypt(plaintext, recipient.as_bytes())
    }

    /// Open a frame sealed to the local identity
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < SEAL_OVERHEAD || ciphertext[0] != SEAL_VERSION {
            return Err(CipherError::DecryptionFailed);
        }
        let (header, sealed) = ciphertext.split_at(HEADER_LEN);

        let mut ephemeral_bytes = [0u8; PUBLIC_KEY_LEN];
        ephemeral_bytes.copy_from_slice(&header[1..]);
        let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);

        let shared = self.identity.secret().diffie_hellman(&ephemeral_public);
        if !shared.was_contributory() {
            return Err(CipherError::DecryptionFailed);
        }

        let local = self.identity.public_key();
        let (key, nonce) = derive_key_nonce(&shared, &ephemeral_bytes, local.as_bytes())
            .ok_or(CipherError::DecryptionFailed)?;

        let aead = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        aead.decrypt(
            Nonce::from_slice(nonce.as_slice()),
            Payload {
                msg: sealed,
                aad: header,
            },
        )
        .map_err(|_| CipherError::DecryptionFailed)
    }
}

/// HKDF-SHA256 over the shared secret, salted with both public keys
fn derive_key_nonce(
    shared: &SharedSecret,
    ephemeral_public: &[u8; PUBLIC_KEY_LEN],
    recipient_public: &[u8; PUBLIC_KEY_LEN],
) -> Option<(Zeroizing<[u8; 32]>, [u8; 12])> {
    let mut salt = [0u8; PUBLIC_KEY_LEN * 2];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(ephemeral_public);
    salt[PUBLIC_KEY_LEN..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; 44]);
    hk.expand(KDF_INFO, &mut okm[..]).ok()?;

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&okm[..32]);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&okm[32..]);
    Some((key, nonce))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(seed: u8) -> Cipher {
        Cipher::new(Arc::new(Identity::from_secret_bytes([seed; 32])))
    }

    #[test]
    fn test_seal_and_open() {
        let alice = cipher(1);
        let bob = cipher(2);

        let frame = alice
            .encrypt(b"hello", bob.public_key().as_bytes())
            .unwrap();
        assert_eq!(frame.len(), 5 + SEAL_OVERHEAD);
        assert_eq!(frame[0], SEAL_VERSION);
        assert_eq!(bob.decrypt(&frame).unwrap(), b"hello");
    }

    #[test]
    fn test_frames_are_randomized() {
        let alice = cipher(1);
        let bob = cipher(2);
        let first = alice.encrypt_for(b"same", &bob.public_key()).unwrap();
        let second = alice.encrypt_for(b"same", &bob.public_key()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_plaintext_bound() {
        let alice = cipher(1);
        let bob = cipher(2);

        let max = vec![0xAB; MAX_PLAINTEXT_LEN];
        let frame = alice.encrypt_for(&max, &bob.public_key()).unwrap();
        assert_eq!(frame.len(), MAX_SEALED_LEN);
        assert_eq!(bob.decrypt(&frame).unwrap(), max);

        let over = vec![0xAB; MAX_PLAINTEXT_LEN + 1];
        assert_eq!(
            alice.encrypt_for(&over, &bob.public_key()),
            Err(CipherError::PlaintextTooLarge {
                size: MAX_PLAINTEXT_LEN + 1,
                max: MAX_PLAINTEXT_LEN,
            })
        );
    }

    #[test]
    fn test_invalid_recipient_key() {
        let alice = cipher(1);
        assert_eq!(
            alice.encrypt(b"x", &[1u8; 31]),
            Err(CipherError::InvalidKeyEncoding)
        );
        // The all-zero point yields a non-contributory shared secret
        assert_eq!(
            alice.encrypt(b"x", &[0u8; 32]),
            Err(CipherError::InvalidKeyEncoding)
        );
    }

    #[test]
    fn test_decrypt_failures_are_uniform() {
        let alice = cipher(1);
        let bob = cipher(2);
        let eve = cipher(3);
        let frame = alice.encrypt_for(b"secret", &bob.public_key()).unwrap();

        assert_eq!(eve.decrypt(&frame), Err(CipherError::DecryptionFailed));
        assert_eq!(
            bob.decrypt(&frame[..frame.len() - 1]),
            Err(CipherError::DecryptionFailed)
        );
        assert_eq!(bob.decrypt(&[]), Err(CipherError::DecryptionFailed));

        let mut tampered = frame.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert_eq!(bob.decrypt(&tampered), Err(CipherError::DecryptionFailed));

        let mut wrong_version = frame;
        wrong_version[0] = 0x02;
        assert_eq!(
            bob.decrypt(&wrong_version),
            Err(CipherError::DecryptionFailed)
        );
    }
}

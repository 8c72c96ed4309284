//! Key store: create the device keypair once, then keep returning it

use core::fmt;
use std::sync::Arc;

use rand_core::{CryptoRng, OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::config::KeyStoreConfig;
use crate::crypto::Cipher;
use crate::errors::KeyStoreError;
use crate::identity::storage::{FileStorage, MemoryStorage, SecureStorage};
use crate::types::PublicKey;

const IDENTITY_FORMAT_VERSION: u8 = 1;

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// The device keypair. The secret half never leaves this type except to persist it.
pub struct Identity {
    secret: StaticSecret,
    public_key: PublicKey,
}

impl Identity {
    /// Generate a new identity from the OS random source
    pub fn generate() -> Result<Self, KeyStoreError> {
        Self::generate_with_rng(&mut OsRng)
    }

    /// Generate a new identity with a caller-supplied RNG
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self, KeyStoreError> {
        let mut secret_bytes = Zeroizing::new([0u8; 32]);
        rng.try_fill_bytes(&mut secret_bytes[..])
            .map_err(|e| KeyStoreError::KeyGenerationFailed {
                reason: e.to_string(),
            })?;
        Ok(Self::from_secret_bytes(*secret_bytes))
    }

    /// Rebuild an identity from raw secret bytes
    pub fn from_secret_bytes(secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public_key = PublicKey::new(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public_key }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// On-disk form of an identity
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    version: u8,
    secret: [u8; 32],
    public: [u8; 32],
}

impl Drop for StoredIdentity {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

// ----------------------------------------------------------------------------
// Key Store
// ----------------------------------------------------------------------------

/// Owns the device identity and its persistence
pub struct KeyStore {
    storage: Box<dyn SecureStorage>,
    identity_key: String,
    identity: Option<Arc<Identity>>,
}

impl KeyStore {
    /// Create a key store over the given storage backend
    pub fn new(storage: Box<dyn SecureStorage>) -> Self {
        Self {
            storage,
            identity_key: KeyStoreConfig::default().identity_key,
            identity: None,
        }
    }

    /// Create a key store from configuration (file-backed when a directory is set)
    pub fn with_config(config: &KeyStoreConfig) -> Result<Self, KeyStoreError> {
        let storage: Box<dyn SecureStorage> = match &config.storage_dir {
            Some(dir) => Box::new(FileStorage::open(dir.clone())?),
            None => Box::new(MemoryStorage::new()),
        };
        Ok(Self {
            storage,
            identity_key: config.identity_key.clone(),
            identity: None,
        })
    }

    /// Whether an identity has already been persisted
    pub fn has_identity(&self) -> Result<bool, KeyStoreError> {
        if self.identity.is_some() {
            return Ok(true);
        }
        Ok(self.storage.retrieve(&self.identity_key)?.is_some())
    }

    /// Return the device identity, generating and persisting it on first use
    pub fn ensure_identity(&mut self) -> Result<Arc<Identity>, KeyStoreError> {
        self.ensure_identity_with_rng(&mut OsRng)
    }

    /// `ensure_identity` with a caller-supplied RNG
    pub fn ensure_identity_with_rng<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<Arc<Identity>, KeyStoreError> {
        if let Some(identity) = &self.identity {
            return Ok(Arc::clone(identity));
        }

        let identity = match self.load()? {
            Some(identity) => identity,
            None => {
                let identity = Identity::generate_with_rng(rng)?;
                self.persist(&identity)?;
                info!(
                    "Generated new device identity {}",
                    identity.public_key().fingerprint().short()
                );
                identity
            }
        };

        let identity = Arc::new(identity);
        self.identity = Some(Arc::clone(&identity));
        Ok(identity)
    }

    /// Public key of the device identity
    pub fn public_key(&self) -> Result<PublicKey, KeyStoreError> {
        self.identity
            .as_ref()
            .map(|identity| identity.public_key())
            .ok_or(KeyStoreError::IdentityMissing)
    }

    /// Base64 text of the public key, as carried in contact codes
    pub fn public_key_base64(&self) -> Result<String, KeyStoreError> {
        Ok(self.public_key()?.to_base64())
    }

    /// Build a cipher bound to the device identity
    pub fn cipher(&mut self) -> Result<Cipher, KeyStoreError> {
        Ok(Cipher::new(self.ensure_identity()?))
    }

    fn load(&self) -> Result<Option<Identity>, KeyStoreError> {
        let Some(blob) = self.storage.retrieve(&self.identity_key)? else {
            return Ok(None);
        };
        let blob = Zeroizing::new(blob);

        let stored: StoredIdentity = bincode::deserialize(&blob).map_err(|e| {
            warn!("Stored identity could not be decoded");
            KeyStoreError::CorruptIdentity {
                reason: e.to_string(),
            }
        })?;

        if stored.version != IDENTITY_FORMAT_VERSION {
            return Err(KeyStoreError::CorruptIdentity {
                reason: format!("unsupported identity version {}", stored.version),
            });
        }

        let identity = Identity::from_secret_bytes(stored.secret);
        if identity.public_key().as_bytes() != &stored.public {
            return Err(KeyStoreError::CorruptIdentity {
                reason: "public key does not match secret".to_string(),
            });
        }

        info!(
            "Loaded device identity {}",
            identity.public_key().fingerprint().short()
        );
        Ok(Some(identity))
    }

    fn persist(&mut self, identity: &Identity) -> Result<(), KeyStoreError> {
        let stored = StoredIdentity {
            version: IDENTITY_FORMAT_VERSION,
            secret: identity.secret().to_bytes(),
            public: *identity.public_key().as_bytes(),
        };
        let blob = Zeroizing::new(bincode::serialize(&stored)?);
        self.storage.store(&self.identity_key, blob.to_vec())?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use core::num::NonZeroU32;

    /// RNG whose every draw fails
    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand_core::Error> {
            let code = NonZeroU32::new(rand_core::Error::CUSTOM_START).unwrap();
            Err(rand_core::Error::from(code))
        }
    }

    impl CryptoRng for BrokenRng {}

    #[test]
    fn test_ensure_identity_is_idempotent() {
        let mut store = KeyStore::new(Box::new(MemoryStorage::new()));
        assert!(!store.has_identity().unwrap());
        assert!(matches!(
            store.public_key(),
            Err(KeyStoreError::IdentityMissing)
        ));

        let first = store.ensure_identity().unwrap();
        let second = store.ensure_identity().unwrap();
        assert_eq!(first.public_key(), second.public_key());
        assert!(store.has_identity().unwrap());
        assert_eq!(store.public_key().unwrap(), first.public_key());
    }

    #[test]
    fn test_identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeyStoreConfig::new().with_storage_dir(dir.path());

        let original = KeyStore::with_config(&config)
            .unwrap()
            .ensure_identity()
            .unwrap()
            .public_key();

        let mut reopened = KeyStore::with_config(&config).unwrap();
        assert!(reopened.has_identity().unwrap());
        assert_eq!(reopened.ensure_identity().unwrap().public_key(), original);
        assert_eq!(
            reopened.public_key_base64().unwrap(),
            original.to_base64()
        );
    }

    #[test]
    fn test_key_generation_failure_is_surfaced() {
        let mut store = KeyStore::new(Box::new(MemoryStorage::new()));
        let result = store.ensure_identity_with_rng(&mut BrokenRng);
        assert!(matches!(
            result,
            Err(KeyStoreError::KeyGenerationFailed { .. })
        ));
        // Nothing half-created was persisted
        assert!(!store.has_identity().unwrap());
        assert!(store.cipher().is_ok());
    }

    #[test]
    fn test_storage_failure_is_surfaced() {
        let mut store = KeyStore::new(Box::new(MemoryStorage::unavailable()));
        assert!(matches!(
            store.ensure_identity(),
            Err(KeyStoreError::Storage(_))
        ));
    }

    #[test]
    fn test_corrupt_identity_detected() {
        let mut storage = MemoryStorage::new();
        storage.store("identity.v1", vec![1, 2, 3]).unwrap();
        let mut store = KeyStore::new(Box::new(storage));
        assert!(matches!(
            store.ensure_identity(),
            Err(KeyStoreError::CorruptIdentity { .. })
        ));
    }

    #[test]
    fn test_mismatched_public_key_detected() {
        let stored = StoredIdentity {
            version: IDENTITY_FORMAT_VERSION,
            secret: [5u8; 32],
            public: [6u8; 32],
        };
        let mut storage = MemoryStorage::new();
        storage
            .store("identity.v1", bincode::serialize(&stored).unwrap())
            .unwrap();

        let mut store = KeyStore::new(Box::new(storage));
        assert!(matches!(
            store.ensure_identity(),
            Err(KeyStoreError::CorruptIdentity { .. })
        ));
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let identity = Identity::from_secret_bytes([0x42; 32]);
        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("PublicKey"));
        assert!(!rendered.contains("4242"));
    }
}

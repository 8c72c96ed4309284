//! Device identity: the long-lived X25519 keypair and where it is kept

mod keystore;
mod storage;

pub use keystore::{Identity, KeyStore};
pub use storage::{FileStorage, MemoryStorage, SecureStorage};

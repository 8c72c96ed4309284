//! Linkchat Core
//!
//! Identity, sealed-box encryption, message chunking and session coordination for a
//! two-party messenger that talks over a single BLE GATT link. Nothing in this crate
//! touches the radio: the link is reached through the [`Transport`] trait, which the
//! `linkchat-ble` crate implements.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod contacts;
pub mod crypto;
pub mod errors;
pub mod fragmentation;
pub mod identity;
pub mod message_log;
pub mod session;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{KeyStoreConfig, SessionConfig};
pub use contacts::{ContactCode, ContactRegistry};
pub use crypto::{Cipher, MAX_PLAINTEXT_LEN, SEAL_OVERHEAD};
pub use errors::{
    CipherError, ContactError, ErrorCategory, KeyStoreError, LinkChatError, LinkChatResult,
    LogError, ReassemblyError, Result, StorageError, TransportError,
};
pub use fragmentation::{split_message, ChunkHeader, Reassembler, MAX_CHUNK_PAYLOAD};
pub use identity::{FileStorage, Identity, KeyStore, MemoryStorage, SecureStorage};
pub use message_log::{MemoryMessageLog, MessageLog, MessageRecord};
pub use session::{DropReason, SendFailure, SendReport, SessionCoordinator, SessionEvent};
pub use transport::{InboundHandler, Transport};
pub use types::{Direction, Fingerprint, MessageFrame, PeerDescriptor, PublicKey, Timestamp};

//! Error types for the linkchat core
//!
//! Each concern gets its own error enum (cipher, transport, key store, storage,
//! reassembly, message log). `LinkChatError` unifies them so callers that glue the
//! pieces together can use a single `Result` type.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors produced by the sealed-box cipher
///
/// `DecryptionFailed` deliberately covers truncated input, unknown versions, tag
/// mismatches and wrong keys alike.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("Invalid public key encoding")]
    InvalidKeyEncoding,
    #[error("Plaintext too large: {size} bytes (max: {max})")]
    PlaintextTooLarge { size: usize, max: usize },
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
}

/// Errors raised while reading a shared contact code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContactError {
    #[error("Invalid contact code: {0}")]
    InvalidCode(String),
    #[error("Contact code has no name")]
    EmptyName,
    #[error("Invalid contact key: {0}")]
    InvalidKey(#[from] CipherError),
}

/// Errors produced by a message transport bound to a link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Link is not ready")]
    LinkNotReady,
    #[error("Characteristic missing on peer: {characteristic}")]
    CharacteristicMissing { characteristic: String },
    #[error("Write rejected by link layer: {reason}")]
    WriteRejected { reason: String },
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Transport closed")]
    Closed,
}

/// Errors related to secure storage operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Secure storage not available")]
    NotAvailable,
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
    #[error("Storage I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Errors raised while creating or loading the device identity
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Key generation failed: {reason}")]
    KeyGenerationFailed { reason: String },
    #[error("Stored identity is corrupt: {reason}")]
    CorruptIdentity { reason: String },
    #[error("No identity has been created yet")]
    IdentityMissing,
    #[error("Identity storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Identity serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Errors raised while reassembling chunked messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("Chunk too short: {size} bytes")]
    ChunkTooShort { size: usize },
    #[error("Invalid chunk header: index {index} of {total}")]
    InvalidHeader { index: u16, total: u16 },
    #[error("Chunk total changed for message {message_id:08x}: expected {expected}, got {actual}")]
    TotalMismatch {
        message_id: u32,
        expected: u16,
        actual: u16,
    },
    #[error("Message exceeds chunk limit: {size} bytes needs more than {max_chunks} chunks")]
    MessageTooLarge { size: usize, max_chunks: usize },
    #[error("Reassembled message is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors raised by a message log implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("Message log unavailable: {0}")]
    Unavailable(String),
    #[error("Message log write failed: {0}")]
    WriteFailed(String),
}

// ----------------------------------------------------------------------------
// Error Taxonomy
// ----------------------------------------------------------------------------

/// How an error should be treated by a host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Discovery or connection problem; restart discovery
    Recoverable,
    /// Peer exposes an unexpected GATT layout; disconnect
    ProtocolMismatch,
    /// Crypto failure on data or key material
    Cryptographic,
    /// Messaging cannot work at all (identity or storage failure)
    Fatal,
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for linkchat
#[derive(Debug, Error)]
pub enum LinkChatError {
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    #[error("Message log error: {0}")]
    Log(#[from] LogError),

    #[error("Contact error: {0}")]
    Contact(#[from] ContactError),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Background task failed or channel closed
    #[error("Task error: {message}")]
    Task { message: String },
}

impl LinkChatError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        LinkChatError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a task error with a message
    pub fn task_error<T: Into<String>>(message: T) -> Self {
        LinkChatError::Task {
            message: message.into(),
        }
    }

    /// Classify the error for user-facing handling
    pub fn category(&self) -> ErrorCategory {
        match self {
            LinkChatError::Transport(TransportError::CharacteristicMissing { .. }) => {
                ErrorCategory::ProtocolMismatch
            }
            LinkChatError::Transport(TransportError::Closed) => ErrorCategory::Fatal,
            LinkChatError::Transport(_) | LinkChatError::Contact(_) => ErrorCategory::Recoverable,
            LinkChatError::Cipher(_) | LinkChatError::Reassembly(_) => {
                ErrorCategory::Cryptographic
            }
            LinkChatError::KeyStore(_)
            | LinkChatError::Storage(_)
            | LinkChatError::Log(_)
            | LinkChatError::Configuration { .. }
            | LinkChatError::Task { .. } => ErrorCategory::Fatal,
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, LinkChatError>;
pub type LinkChatResult<T> = Result<T>;

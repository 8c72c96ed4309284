//! Configuration for the linkchat core
//!
//! Plain serde structs with builder-style setters. Layered loading (file and
//! environment) lives with the aggregate config in the BLE crate.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for the session coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a partially received message is kept before it is dropped
    pub reassembly_timeout: Duration,
    /// Maximum number of partially received messages held at once
    pub max_pending_messages: usize,
    /// Capacity of the session event broadcast channel
    pub event_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reassembly_timeout: Duration::from_secs(60),
            max_pending_messages: 16,
            event_buffer_size: 64,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set reassembly timeout
    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Set the maximum number of partial messages
    pub fn with_max_pending_messages(mut self, max: usize) -> Self {
        self.max_pending_messages = max;
        self
    }

    /// Set event channel capacity
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }
}

// ----------------------------------------------------------------------------
// Key Store Configuration
// ----------------------------------------------------------------------------

/// Where and under which name the device identity is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Directory for file-backed storage; `None` keeps the identity in memory
    pub storage_dir: Option<PathBuf>,
    /// Storage key of the identity blob
    pub identity_key: String,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            identity_key: "identity.v1".to_string(),
        }
    }
}

impl KeyStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist the identity under the given directory
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Override the storage key of the identity blob
    pub fn with_identity_key(mut self, key: impl Into<String>) -> Self {
        self.identity_key = key.into();
        self
    }
}

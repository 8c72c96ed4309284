//! BLE link configuration and layered application config
//!
//! `LinkChatConfig` gathers the core and BLE settings and loads them with figment:
//! defaults first, then `linkchat.toml`, then `LINKCHAT_*` environment variables
//! (nested keys use a double underscore, e.g. `LINKCHAT_BLE__SCAN_MODE=unfiltered`).

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use linkchat_core::crypto::MAX_SEALED_LEN;
use linkchat_core::{KeyStoreConfig, LinkChatError, PublicKey, SessionConfig};
use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::protocol::{generate_device_name, ATT_MAX_ATTRIBUTE_LEN, DEFAULT_DEVICE_NAME};

// ----------------------------------------------------------------------------
// BLE Link Configuration
// ----------------------------------------------------------------------------

/// How the initiator scans for peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Ask the platform to report only advertisements carrying the service id
    Filtered,
    /// Receive every advertisement and check each one
    Unfiltered,
}

/// Configuration for a BLE link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleLinkConfig {
    /// Maximum time to discover a peer (or, as acceptor, to be found)
    pub discovery_timeout: Duration,
    /// Maximum time from connect to ready
    pub connection_timeout: Duration,
    /// Largest frame the transport accepts
    pub max_payload_size: usize,
    /// Scan strategy for the initiator
    pub scan_mode: ScanMode,
    /// Advertised name prefix for the acceptor
    pub device_name: String,
    /// Capacity of the link driver's event queue
    pub event_queue_capacity: usize,
}

impl Default for BleLinkConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            max_payload_size: ATT_MAX_ATTRIBUTE_LEN,
            scan_mode: ScanMode::Filtered,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            event_queue_capacity: 64,
        }
    }
}

impl BleLinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set discovery timeout
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set maximum payload size
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set scan mode
    pub fn with_scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode = mode;
        self
    }

    /// Set advertised device name prefix
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Suffix the advertised name with the identity's short fingerprint
    pub fn with_identity_name(mut self, public_key: &PublicKey) -> Self {
        self.device_name = generate_device_name(&self.device_name, public_key);
        self
    }

    /// Set event queue capacity
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<(), LinkError> {
        let invalid = |reason: String| Err(LinkError::Configuration { reason });

        if self.discovery_timeout.is_zero() || self.connection_timeout.is_zero() {
            return invalid("timeouts must be non-zero".to_string());
        }
        if self.max_payload_size < MAX_SEALED_LEN || self.max_payload_size > ATT_MAX_ATTRIBUTE_LEN
        {
            return invalid(format!(
                "max_payload_size must be between {} and {}",
                MAX_SEALED_LEN, ATT_MAX_ATTRIBUTE_LEN
            ));
        }
        if self.event_queue_capacity == 0 {
            return invalid("event_queue_capacity must be at least 1".to_string());
        }
        if self.device_name.is_empty() {
            return invalid("device_name must not be empty".to_string());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for a linkchat host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkChatConfig {
    pub session: SessionConfig,
    pub key_store: KeyStoreConfig,
    pub ble: BleLinkConfig,
}

impl LinkChatConfig {
    /// Load configuration: defaults, then `linkchat.toml`, then `LINKCHAT_*` env vars
    pub fn load() -> linkchat_core::Result<Self> {
        Self::extract(
            Self::base()
                .merge(Toml::file("linkchat.toml"))
                .merge(Env::prefixed("LINKCHAT_").split("__")),
        )
    }

    /// Load configuration from a specific file on top of the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> linkchat_core::Result<Self> {
        Self::extract(Self::base().merge(Toml::file(path.as_ref())))
    }

    /// Check every section
    pub fn validate(&self) -> linkchat_core::Result<()> {
        self.ble.validate()?;
        if self.session.max_pending_messages == 0 {
            return Err(LinkChatError::config_error(
                "session.max_pending_messages must be at least 1",
            ));
        }
        if self.session.reassembly_timeout.is_zero() {
            return Err(LinkChatError::config_error(
                "session.reassembly_timeout must be non-zero",
            ));
        }
        Ok(())
    }

    fn base() -> Figment {
        Figment::new().merge(Serialized::defaults(Self::default()))
    }

    fn extract(figment: Figment) -> linkchat_core::Result<Self> {
        let config: LinkChatConfig = figment.extract().map_err(|e| {
            LinkChatError::config_error(format!("Failed to load configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BleLinkConfig::default();
        assert_eq!(config.discovery_timeout, Duration::from_secs(30));
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.max_payload_size, 512);
        assert_eq!(config.scan_mode, ScanMode::Filtered);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_identity_name() {
        let key = PublicKey::new([9u8; 32]);
        let config = BleLinkConfig::new().with_identity_name(&key);
        assert_eq!(
            config.device_name,
            format!("linkchat-{}", key.fingerprint().short())
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(BleLinkConfig::new()
            .with_discovery_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BleLinkConfig::new()
            .with_max_payload_size(100)
            .validate()
            .is_err());
        assert!(BleLinkConfig::new()
            .with_max_payload_size(1024)
            .validate()
            .is_err());
        assert!(BleLinkConfig::new()
            .with_event_queue_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[ble]
scan_mode = "unfiltered"
device_name = "bench"
max_payload_size = 300

[ble.discovery_timeout]
secs = 5
nanos = 0

[session]
max_pending_messages = 4
"#
        )
        .unwrap();

        let config = LinkChatConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.ble.scan_mode, ScanMode::Unfiltered);
        assert_eq!(config.ble.device_name, "bench");
        assert_eq!(config.ble.max_payload_size, 300);
        assert_eq!(config.ble.discovery_timeout, Duration::from_secs(5));
        assert_eq!(config.ble.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.session.max_pending_messages, 4);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ble]\nmax_payload_size = 10").unwrap();
        let err = LinkChatConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, LinkChatError::Configuration { .. }));
    }
}

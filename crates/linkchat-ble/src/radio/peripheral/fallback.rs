//! Fallback peripheral for platforms without GATT server support

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::config::ScanMode;
use crate::error::RadioError;
use crate::protocol::Role;
use crate::radio::{PeerAddress, Radio, RadioEventSink};

// ----------------------------------------------------------------------------
// Fallback Implementation
// ----------------------------------------------------------------------------

/// Acceptor that can never be discovered
pub struct FallbackPeripheral {
    device_name: String,
}

impl FallbackPeripheral {
    pub fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
        }
    }
}

#[async_trait]
impl Radio for FallbackPeripheral {
    fn role(&self) -> Role {
        Role::Acceptor
    }

    async fn attach(&self, _events: RadioEventSink) -> Result<(), RadioError> {
        Ok(())
    }

    async fn start_discovery(&self, _mode: ScanMode) -> Result<(), RadioError> {
        warn!(
            "BLE advertising not supported on this platform. Device '{}' will not be discoverable.",
            self.device_name
        );
        Err(RadioError::Unsupported("advertising"))
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn write(
        &self,
        _address: Option<&PeerAddress>,
        _characteristic: Uuid,
        _value: &[u8],
    ) -> Result<(), RadioError> {
        Err(RadioError::NotConnected)
    }

    async fn disconnect(&self, _address: Option<&PeerAddress>) -> Result<(), RadioError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_refuses_to_advertise() {
        let radio = FallbackPeripheral::new("linkchat-test");
        assert_eq!(radio.role(), Role::Acceptor);
        assert!(matches!(
            radio.start_discovery(ScanMode::Filtered).await,
            Err(RadioError::Unsupported("advertising"))
        ));
        assert!(matches!(
            radio.write(None, Uuid::nil(), b"x").await,
            Err(RadioError::NotConnected)
        ));
        assert!(radio.stop_discovery().await.is_ok());
    }
}

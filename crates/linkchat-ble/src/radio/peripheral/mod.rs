//! Acceptor radios
//!
//! Advertising and serving GATT need the platform stack: BlueZ via bluer on
//! Linux. Other platforms get a fallback that reports advertising as
//! unsupported, so discovery fails instead of silently never finding a peer.

pub mod fallback;
#[cfg(target_os = "linux")]
pub mod linux;

pub use fallback::FallbackPeripheral;
#[cfg(target_os = "linux")]
pub use linux::BluerPeripheral;

use std::sync::Arc;

use crate::config::BleLinkConfig;
use crate::error::RadioError;

use super::Radio;

// ----------------------------------------------------------------------------
// Platform Detection and Factory
// ----------------------------------------------------------------------------

/// Create the acceptor radio for the current platform
pub async fn platform_peripheral(config: &BleLinkConfig) -> Result<Arc<dyn Radio>, RadioError> {
    #[cfg(target_os = "linux")]
    {
        let radio = BluerPeripheral::new(&config.device_name).await?;
        Ok(Arc::new(radio))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(Arc::new(FallbackPeripheral::new(&config.device_name)))
    }
}

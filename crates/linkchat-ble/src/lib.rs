//! Bluetooth Low Energy link for linkchat
//!
//! This crate drives a single BLE GATT link between two linkchat devices and
//! exposes it as a `Transport` from `linkchat-core`.
//!
//! ## Architecture
//!
//! - [`state`] - Link state machine: pure transitions, failure causes and commands
//! - [`driver`] - Event loop that owns the state machine, timers and radio calls
//! - [`radio`] - Radio trait plus btleplug, bluer and in-memory loopback backends
//! - [`transport`] - Frame send/receive over the driven link
//! - [`config`] - Link settings and layered application configuration
//! - [`protocol`] - Service and characteristic UUIDs, roles, device naming
//! - [`error`] - Radio and link errors
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use linkchat_ble::{BleLinkConfig, BleTransport, BtleplugCentral, LinkDriver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BleLinkConfig::new();
//! let radio = Arc::new(BtleplugCentral::new().await?);
//!
//! let link = LinkDriver::spawn(radio, &config).await?;
//! link.start_discovery().await?;
//!
//! // Frames can be sent once the link reports Ready
//! let transport = BleTransport::new(link, &config);
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Initiator** (scan, connect, subscribe): every platform btleplug supports
//! - **Acceptor** (advertise, serve GATT): Linux via `bluer` and BlueZ; other
//!   platforms fall back to a peripheral whose discovery fails as unsupported

pub mod config;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod radio;
pub mod state;
pub mod transport;

// Public API exports
pub use config::{BleLinkConfig, LinkChatConfig, ScanMode};
pub use driver::{LinkDriver, LinkHandle, LinkSnapshot, LinkStateChange};
pub use error::{LinkError, RadioError};
pub use protocol::{
    generate_device_name, Role, LINKCHAT_NOTIFY_CHARACTERISTIC_UUID, LINKCHAT_SERVICE_UUID,
    LINKCHAT_WRITE_CHARACTERISTIC_UUID,
};
pub use radio::{
    platform_peripheral, BtleplugCentral, GattHandles, LoopbackAir, LoopbackRadio, PeerAddress,
    PeripheralBehavior, Radio, RadioEvent, RadioEventSink,
};
pub use state::{FailureCategory, FailureCause, LinkState};
pub use transport::BleTransport;

// Re-export Transport trait for convenience
pub use linkchat_core::transport::Transport;

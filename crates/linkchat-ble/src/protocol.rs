//! GATT protocol constants and utilities for linkchat

use linkchat_core::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Linkchat BLE service UUID
pub const LINKCHAT_SERVICE_UUID: Uuid = Uuid::from_u128(0x4C4B0001_7A3E_4F61_9C2D_5B8E1F0A6D37);

/// Characteristic the initiator writes to (write, write without response)
pub const LINKCHAT_WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x4C4B0002_7A3E_4F61_9C2D_5B8E1F0A6D37);

/// Characteristic the acceptor notifies on (notify)
pub const LINKCHAT_NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x4C4B0003_7A3E_4F61_9C2D_5B8E1F0A6D37);

/// Largest value a single ATT attribute can hold
pub const ATT_MAX_ATTRIBUTE_LEN: usize = 512;

/// Default advertised name prefix
pub const DEFAULT_DEVICE_NAME: &str = "linkchat";

// ----------------------------------------------------------------------------
// Roles
// ----------------------------------------------------------------------------

/// Which side of the link this device plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Scans, connects and writes (GATT client)
    Initiator,
    /// Advertises, serves GATT and notifies (GATT server)
    Acceptor,
}

impl Role {
    /// Characteristic this role sends on
    pub fn tx_characteristic(&self) -> Uuid {
        match self {
            Role::Initiator => LINKCHAT_WRITE_CHARACTERISTIC_UUID,
            Role::Acceptor => LINKCHAT_NOTIFY_CHARACTERISTIC_UUID,
        }
    }

    /// Characteristic this role receives on
    pub fn rx_characteristic(&self) -> Uuid {
        match self {
            Role::Initiator => LINKCHAT_NOTIFY_CHARACTERISTIC_UUID,
            Role::Acceptor => LINKCHAT_WRITE_CHARACTERISTIC_UUID,
        }
    }
}

// ----------------------------------------------------------------------------
// Protocol Utilities
// ----------------------------------------------------------------------------

/// Whether an advertisement's service list identifies a linkchat peer
///
/// Filtered and unfiltered scans both gate on this predicate.
pub fn advertises_service(services: &[Uuid]) -> bool {
    services.contains(&LINKCHAT_SERVICE_UUID)
}

/// Generate a BLE-compatible device name for this identity
pub fn generate_device_name(prefix: &str, public_key: &PublicKey) -> String {
    format!("{}-{}", prefix, public_key.fingerprint().short())
}

//! Radio abstraction
//!
//! The link driver talks to the BLE stack only through the [`Radio`] trait. Each
//! backend plays one [`Role`]: [`BtleplugCentral`] scans and connects, the
//! platform peripheral advertises and serves GATT, and [`LoopbackAir`] pairs
//! in-memory radios for tests and simulations.
//!
//! Asynchronous stack callbacks are reported through a [`RadioEventSink`], which
//! feeds the driver's single event queue.

pub mod central;
pub mod loopback;
pub mod peripheral;

pub use central::BtleplugCentral;
pub use loopback::{LoopbackAir, LoopbackRadio, PeripheralBehavior};
pub use peripheral::platform_peripheral;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::config::ScanMode;
use crate::driver::DriverInput;
use crate::error::RadioError;
use crate::protocol::{
    Role, LINKCHAT_NOTIFY_CHARACTERISTIC_UUID, LINKCHAT_SERVICE_UUID,
    LINKCHAT_WRITE_CHARACTERISTIC_UUID,
};

// ----------------------------------------------------------------------------
// Addresses and Handles
// ----------------------------------------------------------------------------

/// Backend-specific identifier of a remote device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved GATT attributes of the linkchat service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattHandles {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl GattHandles {
    /// The well-known service layout both peers agree on
    pub fn standard() -> Self {
        Self {
            service: LINKCHAT_SERVICE_UUID,
            write: LINKCHAT_WRITE_CHARACTERISTIC_UUID,
            notify: LINKCHAT_NOTIFY_CHARACTERISTIC_UUID,
        }
    }

    /// Characteristic the given role sends on
    pub fn tx_for(&self, role: Role) -> Uuid {
        match role {
            Role::Initiator => self.write,
            Role::Acceptor => self.notify,
        }
    }

    /// Characteristic the given role receives on
    pub fn rx_for(&self, role: Role) -> Uuid {
        match role {
            Role::Initiator => self.notify,
            Role::Acceptor => self.write,
        }
    }
}

// ----------------------------------------------------------------------------
// Radio Events
// ----------------------------------------------------------------------------

/// Unsolicited callbacks from the BLE stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    AdvertisementSeen {
        address: PeerAddress,
        local_name: Option<String>,
        services: Vec<Uuid>,
        rssi: Option<i16>,
    },
    /// A central connected to our GATT server
    Connected { address: PeerAddress },
    /// The remote side enabled notifications on our notify characteristic
    Subscribed { address: Option<PeerAddress> },
    Disconnected { address: Option<PeerAddress> },
    /// A value arrived on a characteristic (write to us, or notification from peer)
    ValueReceived {
        address: Option<PeerAddress>,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ScanFailed { reason: String },
}

/// Delivers radio events to a link driver
///
/// Holds only a weak reference to the driver queue, so a radio that outlives its
/// driver silently drops events.
#[derive(Clone)]
pub struct RadioEventSink {
    tx: mpsc::WeakSender<DriverInput>,
}

impl RadioEventSink {
    pub(crate) fn new(tx: mpsc::WeakSender<DriverInput>) -> Self {
        Self { tx }
    }

    /// Queue an event for the driver, waiting if the queue is full
    pub async fn emit(&self, event: RadioEvent) {
        match self.tx.upgrade() {
            Some(tx) => {
                if tx.send(DriverInput::Radio(event)).await.is_err() {
                    trace!("Link driver gone; radio event dropped");
                }
            }
            None => trace!("Link driver gone; radio event dropped"),
        }
    }

    /// Whether the driver is still running
    pub fn is_connected(&self) -> bool {
        self.tx.strong_count() > 0
    }
}

impl fmt::Debug for RadioEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadioEventSink")
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Radio Trait
// ----------------------------------------------------------------------------

/// One side of a BLE link
///
/// For an acceptor, discovery means advertising and serving the GATT service;
/// for an initiator it means scanning. Operations a role cannot perform return
/// [`RadioError::Unsupported`].
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Role this radio plays
    fn role(&self) -> Role;

    /// Register where callbacks go; called once by the driver before any other operation
    async fn attach(&self, events: RadioEventSink) -> Result<(), RadioError>;

    async fn start_discovery(&self, mode: ScanMode) -> Result<(), RadioError>;

    async fn stop_discovery(&self) -> Result<(), RadioError>;

    async fn connect(&self, _address: &PeerAddress) -> Result<(), RadioError> {
        Err(RadioError::Unsupported("connect"))
    }

    /// Discover the peer's services and locate the linkchat characteristics
    async fn resolve_services(&self, _address: &PeerAddress) -> Result<GattHandles, RadioError> {
        Err(RadioError::Unsupported("service resolution"))
    }

    /// Write the CCCD of `characteristic` on the peer
    async fn enable_notifications(
        &self,
        _address: &PeerAddress,
        _characteristic: Uuid,
    ) -> Result<(), RadioError> {
        Err(RadioError::Unsupported("notification subscription"))
    }

    /// Send one value on `characteristic` (write for initiators, notify for acceptors)
    async fn write(
        &self,
        address: Option<&PeerAddress>,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError>;

    /// Drop the connection to `address`, or every connection when `None`
    async fn disconnect(&self, address: Option<&PeerAddress>) -> Result<(), RadioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_follow_role() {
        let handles = GattHandles::standard();
        assert_eq!(handles.tx_for(Role::Initiator), Role::Initiator.tx_characteristic());
        assert_eq!(handles.rx_for(Role::Initiator), Role::Initiator.rx_characteristic());
        assert_eq!(handles.tx_for(Role::Acceptor), Role::Acceptor.tx_characteristic());
        assert_eq!(handles.rx_for(Role::Acceptor), Role::Acceptor.rx_characteristic());
    }

    #[tokio::test]
    async fn test_sink_without_driver_drops_events() {
        let (tx, rx) = mpsc::channel::<DriverInput>(1);
        let sink = RadioEventSink::new(tx.downgrade());
        drop(tx);
        drop(rx);
        assert!(!sink.is_connected());
        sink.emit(RadioEvent::ScanFailed {
            reason: "gone".to_string(),
        })
        .await;
    }
}

//! Initiator radio on btleplug
//!
//! Scans for the linkchat service, connects, resolves the GATT layout and
//! subscribes to the notify characteristic (which writes its CCCD). Adapter
//! events and notifications are pumped into the driver by background tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{GattHandles, PeerAddress, Radio, RadioEvent, RadioEventSink};
use crate::config::ScanMode;
use crate::error::RadioError;
use crate::protocol::{
    Role, LINKCHAT_NOTIFY_CHARACTERISTIC_UUID, LINKCHAT_SERVICE_UUID,
    LINKCHAT_WRITE_CHARACTERISTIC_UUID,
};

type PeripheralMap = Arc<RwLock<HashMap<PeerAddress, Peripheral>>>;

// ----------------------------------------------------------------------------
// Notification Pumps
// ----------------------------------------------------------------------------

/// At most one notification pump per connected peer
#[derive(Default)]
struct NotificationPumps {
    pumps: Mutex<HashMap<PeerAddress, JoinHandle<()>>>,
}

impl NotificationPumps {
    /// Track `pump` for `address`, aborting any pump left from an earlier connection
    fn replace(&self, address: PeerAddress, pump: JoinHandle<()>) {
        let mut pumps = self.pumps.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stale) = pumps.insert(address, pump) {
            stale.abort();
        }
    }

    /// Abort the pump for `address`, or every pump when `None`
    fn stop(&self, address: Option<&PeerAddress>) {
        let mut pumps = self.pumps.lock().unwrap_or_else(PoisonError::into_inner);
        let stopped: Vec<JoinHandle<()>> = match address {
            Some(address) => pumps.remove(address).into_iter().collect(),
            None => pumps.drain().map(|(_, pump)| pump).collect(),
        };
        for pump in stopped {
            pump.abort();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ----------------------------------------------------------------------------
// Btleplug Central
// ----------------------------------------------------------------------------

/// GATT client radio backed by the first system adapter
pub struct BtleplugCentral {
    adapter: Adapter,
    peripherals: PeripheralMap,
    events: OnceLock<RadioEventSink>,
    adapter_pump: Mutex<Option<JoinHandle<()>>>,
    notifications: NotificationPumps,
}

impl BtleplugCentral {
    /// Initialize the BLE manager and take the first adapter
    pub async fn new() -> Result<Self, RadioError> {
        let manager = Manager::new().await.map_err(|e| {
            RadioError::AdapterNotAvailable(format!("Failed to create BLE manager: {}", e))
        })?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| {
                RadioError::AdapterNotAvailable(format!("Failed to get BLE adapters: {}", e))
            })?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::AdapterNotAvailable("No BLE adapters available".into()))?;

        info!("BLE adapter initialized");
        Ok(Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            events: OnceLock::new(),
            adapter_pump: Mutex::new(None),
            notifications: NotificationPumps::default(),
        })
    }

    async fn peripheral(&self, address: &PeerAddress) -> Result<Peripheral, RadioError> {
        self.peripherals
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| RadioError::PeerNotDiscovered(address.to_string()))
    }

    fn sink(&self) -> Result<RadioEventSink, RadioError> {
        self.events
            .get()
            .cloned()
            .ok_or_else(|| RadioError::AdapterNotAvailable("radio not attached".into()))
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        let adapter_pump = self
            .adapter_pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pump) = adapter_pump.take() {
            pump.abort();
        }
        self.notifications.stop(None);
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, RadioError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(RadioError::CharacteristicMissing {
            characteristic: uuid,
        })
}

async fn lookup(adapter: &Adapter, id: &PeripheralId) -> Option<(PeerAddress, Peripheral)> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    Some((PeerAddress::new(peripheral.address().to_string()), peripheral))
}

/// Forward adapter events until the stream or the driver ends
async fn pump_adapter_events(adapter: Adapter, peripherals: PeripheralMap, sink: RadioEventSink) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            sink.emit(RadioEvent::ScanFailed {
                reason: format!("Failed to open adapter events: {}", e),
            })
            .await;
            return;
        }
    };

    while let Some(event) = events.next().await {
        if !sink.is_connected() {
            break;
        }
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Some((address, peripheral)) = lookup(&adapter, &id).await else {
                    continue;
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    _ => continue,
                };
                peripherals.write().await.insert(address.clone(), peripheral);
                sink.emit(RadioEvent::AdvertisementSeen {
                    address,
                    local_name: properties.local_name,
                    services: properties.services,
                    rssi: properties.rssi,
                })
                .await;
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Some((address, _)) = lookup(&adapter, &id).await {
                    debug!("Peripheral {} disconnected", address);
                    sink.emit(RadioEvent::Disconnected {
                        address: Some(address),
                    })
                    .await;
                }
            }
            _ => {}
        }
    }
    debug!("Adapter event pump ended");
}

#[async_trait]
impl Radio for BtleplugCentral {
    fn role(&self) -> Role {
        Role::Initiator
    }

    async fn attach(&self, events: RadioEventSink) -> Result<(), RadioError> {
        self.events
            .set(events.clone())
            .map_err(|_| RadioError::AdapterNotAvailable("radio already attached".into()))?;

        let pump = tokio::spawn(pump_adapter_events(
            self.adapter.clone(),
            Arc::clone(&self.peripherals),
            events,
        ));
        *self
            .adapter_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pump);
        Ok(())
    }

    async fn start_discovery(&self, mode: ScanMode) -> Result<(), RadioError> {
        let filter = match mode {
            ScanMode::Filtered => ScanFilter {
                services: vec![LINKCHAT_SERVICE_UUID],
            },
            ScanMode::Unfiltered => ScanFilter::default(),
        };

        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| RadioError::DiscoveryFailed(format!("Failed to start BLE scan: {}", e)))?;

        info!("Started {:?} BLE scan for linkchat peers", mode);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| RadioError::DiscoveryFailed(format!("Failed to stop BLE scan: {}", e)))
    }

    async fn connect(&self, address: &PeerAddress) -> Result<(), RadioError> {
        let peripheral = self.peripheral(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| RadioError::ConnectionFailed(e.to_string()))?;
        info!("Connected to peer: {}", address);
        Ok(())
    }

    async fn resolve_services(&self, address: &PeerAddress) -> Result<GattHandles, RadioError> {
        let peripheral = self.peripheral(address).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| RadioError::ServiceDiscoveryFailed(e.to_string()))?;

        if !peripheral
            .services()
            .iter()
            .any(|service| service.uuid == LINKCHAT_SERVICE_UUID)
        {
            return Err(RadioError::CharacteristicMissing {
                characteristic: LINKCHAT_SERVICE_UUID,
            });
        }
        find_characteristic(&peripheral, LINKCHAT_WRITE_CHARACTERISTIC_UUID)?;
        find_characteristic(&peripheral, LINKCHAT_NOTIFY_CHARACTERISTIC_UUID)?;

        debug!("Resolved linkchat service on {}", address);
        Ok(GattHandles::standard())
    }

    async fn enable_notifications(
        &self,
        address: &PeerAddress,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(address).await?;
        let notify = find_characteristic(&peripheral, characteristic)?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| RadioError::SubscriptionFailed(e.to_string()))?;
        peripheral
            .subscribe(&notify)
            .await
            .map_err(|e| RadioError::SubscriptionFailed(e.to_string()))?;

        let sink = self.sink()?;
        let from = address.clone();
        let pump = tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                sink.emit(RadioEvent::ValueReceived {
                    address: Some(from.clone()),
                    characteristic: data.uuid,
                    value: data.value,
                })
                .await;
            }
            debug!("Notification stream for {} ended", from);
        });
        self.notifications.replace(address.clone(), pump);
        Ok(())
    }

    async fn write(
        &self,
        address: Option<&PeerAddress>,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let address = address.ok_or(RadioError::NotConnected)?;
        let peripheral = self.peripheral(address).await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Err(RadioError::NotConnected);
        }
        let target = find_characteristic(&peripheral, characteristic)?;

        peripheral
            .write(&target, value, WriteType::WithResponse)
            .await
            .map_err(|e| RadioError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self, address: Option<&PeerAddress>) -> Result<(), RadioError> {
        self.notifications.stop(address);

        let targets: Vec<Peripheral> = match address {
            Some(address) => self.peripheral(address).await.into_iter().collect(),
            None => self.peripherals.read().await.values().cloned().collect(),
        };

        for peripheral in targets {
            if peripheral.is_connected().await.unwrap_or(false) {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Failed to disconnect from {}: {}", peripheral.address(), e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    /// A pump that never ends; the receiver resolves once it is aborted
    fn idle_pump() -> (JoinHandle<()>, oneshot::Receiver<()>) {
        let (alive, aborted) = oneshot::channel::<()>();
        let pump = tokio::spawn(async move {
            let _alive = alive;
            futures::future::pending::<()>().await;
        });
        (pump, aborted)
    }

    async fn assert_aborted(aborted: oneshot::Receiver<()>) {
        let result = tokio::time::timeout(Duration::from_secs(1), aborted).await;
        assert!(matches!(result, Ok(Err(_))), "pump still running");
    }

    #[tokio::test]
    async fn test_reconnect_replaces_notification_pump() {
        let pumps = NotificationPumps::default();
        let peer = PeerAddress::new("AA:BB:CC:DD:EE:FF");

        let (first, first_aborted) = idle_pump();
        pumps.replace(peer.clone(), first);
        let (second, _second_alive) = idle_pump();
        pumps.replace(peer, second);

        assert_aborted(first_aborted).await;
        assert_eq!(pumps.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_stops_notification_pumps() {
        let pumps = NotificationPumps::default();
        let a = PeerAddress::new("AA:BB:CC:DD:EE:01");
        let b = PeerAddress::new("AA:BB:CC:DD:EE:02");

        let (pump_a, a_aborted) = idle_pump();
        let (pump_b, b_aborted) = idle_pump();
        pumps.replace(a.clone(), pump_a);
        pumps.replace(b, pump_b);

        pumps.stop(Some(&a));
        assert_aborted(a_aborted).await;
        assert_eq!(pumps.len(), 1);

        pumps.stop(None);
        assert_aborted(b_aborted).await;
        assert_eq!(pumps.len(), 0);
    }
}

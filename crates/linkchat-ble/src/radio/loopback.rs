//! In-memory radio
//!
//! `LoopbackAir` is a shared medium for one central and any number of
//! peripherals. Advertisements, connections, subscriptions, writes and
//! disconnects are delivered as [`RadioEvent`]s exactly as a real stack would
//! report them, which lets whole links run without hardware.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{GattHandles, PeerAddress, Radio, RadioEvent, RadioEventSink};
use crate::config::ScanMode;
use crate::error::RadioError;
use crate::protocol::{
    advertises_service, Role, LINKCHAT_NOTIFY_CHARACTERISTIC_UUID, LINKCHAT_SERVICE_UUID,
    LINKCHAT_WRITE_CHARACTERISTIC_UUID,
};

const CENTRAL_ADDRESS: &str = "loopback-central";

// ----------------------------------------------------------------------------
// Shared Medium
// ----------------------------------------------------------------------------

/// How a loopback peripheral misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeripheralBehavior {
    #[default]
    Normal,
    /// Advertises but never answers a connection request
    Silent,
    /// Serves the service without the notify characteristic
    MissingCharacteristic,
}

struct CentralSlot {
    sink: Option<RadioEventSink>,
    scanning: Option<ScanMode>,
    connected: Option<PeerAddress>,
}

struct PeripheralSlot {
    name: String,
    behavior: PeripheralBehavior,
    sink: Option<RadioEventSink>,
    advertising: bool,
    central: Option<PeerAddress>,
    subscribed: bool,
}

struct NoiseAdvertisement {
    address: PeerAddress,
    name: String,
    services: Vec<Uuid>,
}

#[derive(Default)]
struct AirState {
    central: Option<CentralSlot>,
    peripherals: BTreeMap<PeerAddress, PeripheralSlot>,
    noise: Vec<NoiseAdvertisement>,
}

/// Events to deliver once the air lock is released
type Outbox = Vec<(RadioEventSink, RadioEvent)>;

impl AirState {
    fn advertisement(address: &PeerAddress, name: &str, services: Vec<Uuid>) -> RadioEvent {
        RadioEvent::AdvertisementSeen {
            address: address.clone(),
            local_name: Some(name.to_string()),
            services,
            rssi: Some(-50),
        }
    }

    fn visible_advertisements(&self, mode: ScanMode) -> Vec<RadioEvent> {
        let peripherals = self
            .peripherals
            .iter()
            .filter(|(_, slot)| slot.advertising)
            .map(|(address, slot)| (address, slot.name.as_str(), vec![LINKCHAT_SERVICE_UUID]));
        let noise = self
            .noise
            .iter()
            .map(|ad| (&ad.address, ad.name.as_str(), ad.services.clone()));

        noise
            .chain(peripherals)
            .filter(|(_, _, services)| {
                mode == ScanMode::Unfiltered || advertises_service(services)
            })
            .map(|(address, name, services)| Self::advertisement(address, name, services))
            .collect()
    }

    /// Tear down the link of `peripheral` and report it to the chosen sides
    fn unlink(
        &mut self,
        peripheral: &PeerAddress,
        notify_central: bool,
        notify_peripheral: bool,
    ) -> Outbox {
        let mut outbox = Outbox::new();
        let central_address = PeerAddress::new(CENTRAL_ADDRESS);

        if let Some(slot) = self.peripherals.get_mut(peripheral) {
            if slot.central.take().is_some() {
                slot.subscribed = false;
                if let (true, Some(sink)) = (notify_peripheral, slot.sink.clone()) {
                    outbox.push((
                        sink,
                        RadioEvent::Disconnected {
                            address: Some(central_address),
                        },
                    ));
                }
            }
        }
        if let Some(central) = self.central.as_mut() {
            if central.connected.as_ref() == Some(peripheral) {
                central.connected = None;
                if let (true, Some(sink)) = (notify_central, central.sink.clone()) {
                    outbox.push((
                        sink,
                        RadioEvent::Disconnected {
                            address: Some(peripheral.clone()),
                        },
                    ));
                }
            }
        }
        outbox
    }
}

/// Shared in-memory medium
#[derive(Clone, Default)]
pub struct LoopbackAir {
    state: Arc<Mutex<AirState>>,
}

impl LoopbackAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the central (initiator) radio, replacing any previous one
    pub fn central(&self) -> Arc<LoopbackRadio> {
        self.lock().central = Some(CentralSlot {
            sink: None,
            scanning: None,
            connected: None,
        });
        Arc::new(LoopbackRadio::new(
            self.clone(),
            Role::Initiator,
            PeerAddress::new(CENTRAL_ADDRESS),
        ))
    }

    /// Create a well-behaved peripheral (acceptor) radio
    pub fn peripheral(&self, name: &str) -> Arc<LoopbackRadio> {
        self.peripheral_with(name, PeripheralBehavior::Normal)
    }

    /// Create a peripheral radio with the given behavior
    pub fn peripheral_with(&self, name: &str, behavior: PeripheralBehavior) -> Arc<LoopbackRadio> {
        let mut state = self.lock();
        let address =
            PeerAddress::new(format!("loopback-peripheral-{}", state.peripherals.len() + 1));
        state.peripherals.insert(
            address.clone(),
            PeripheralSlot {
                name: name.to_string(),
                behavior,
                sink: None,
                advertising: false,
                central: None,
                subscribed: false,
            },
        );
        drop(state);
        Arc::new(LoopbackRadio::new(self.clone(), Role::Acceptor, address))
    }

    /// Add a foreign advertiser that is always on the air
    pub fn add_noise(&self, name: &str, services: Vec<Uuid>) -> PeerAddress {
        let mut state = self.lock();
        let address = PeerAddress::new(format!("loopback-noise-{}", state.noise.len() + 1));
        state.noise.push(NoiseAdvertisement {
            address: address.clone(),
            name: name.to_string(),
            services,
        });
        address
    }

    /// Drop the link of a peripheral as if the radio connection was lost
    pub async fn sever(&self, peripheral: &PeerAddress) {
        let outbox = self.lock().unlink(peripheral, true, true);
        deliver(outbox).await;
    }

    /// Whether the peripheral is currently advertising
    pub fn is_advertising(&self, peripheral: &PeerAddress) -> bool {
        self.lock()
            .peripherals
            .get(peripheral)
            .map(|slot| slot.advertising)
            .unwrap_or(false)
    }

    /// Whether the central is currently scanning
    pub fn is_scanning(&self) -> bool {
        self.lock()
            .central
            .as_ref()
            .map(|central| central.scanning.is_some())
            .unwrap_or(false)
    }

    /// Whether the central holds a connection
    pub fn central_connected(&self) -> bool {
        self.lock()
            .central
            .as_ref()
            .map(|central| central.connected.is_some())
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn deliver(outbox: Outbox) {
    for (sink, event) in outbox {
        sink.emit(event).await;
    }
}

// ----------------------------------------------------------------------------
// Loopback Radio
// ----------------------------------------------------------------------------

/// One radio on a [`LoopbackAir`]
pub struct LoopbackRadio {
    air: LoopbackAir,
    role: Role,
    address: PeerAddress,
    writes: AtomicUsize,
}

impl LoopbackRadio {
    fn new(air: LoopbackAir, role: Role, address: PeerAddress) -> Self {
        Self {
            air,
            role,
            address,
            writes: AtomicUsize::new(0),
        }
    }

    /// Address other radios see for this one
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Number of successful writes (or notifications) sent
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn connected_peripheral<'a>(
        state: &'a mut AirState,
        address: &PeerAddress,
    ) -> Result<&'a mut PeripheralSlot, RadioError> {
        let connected = state
            .central
            .as_ref()
            .and_then(|central| central.connected.as_ref())
            == Some(address);
        if !connected {
            return Err(RadioError::NotConnected);
        }
        state
            .peripherals
            .get_mut(address)
            .ok_or(RadioError::NotConnected)
    }
}

#[async_trait]
impl Radio for LoopbackRadio {
    fn role(&self) -> Role {
        self.role
    }

    async fn attach(&self, events: RadioEventSink) -> Result<(), RadioError> {
        let mut state = self.air.lock();
        match self.role {
            Role::Initiator => {
                let central = state
                    .central
                    .as_mut()
                    .ok_or_else(|| RadioError::AdapterNotAvailable(self.address.to_string()))?;
                central.sink = Some(events);
            }
            Role::Acceptor => {
                let slot = state
                    .peripherals
                    .get_mut(&self.address)
                    .ok_or_else(|| RadioError::AdapterNotAvailable(self.address.to_string()))?;
                slot.sink = Some(events);
            }
        }
        Ok(())
    }

    async fn start_discovery(&self, mode: ScanMode) -> Result<(), RadioError> {
        let outbox = {
            let mut state = self.air.lock();
            match self.role {
                Role::Initiator => {
                    let advertisements = state.visible_advertisements(mode);
                    let central = state
                        .central
                        .as_mut()
                        .ok_or_else(|| RadioError::DiscoveryFailed("central detached".to_string()))?;
                    central.scanning = Some(mode);
                    match central.sink.clone() {
                        Some(sink) => advertisements
                            .into_iter()
                            .map(|event| (sink.clone(), event))
                            .collect(),
                        None => Outbox::new(),
                    }
                }
                Role::Acceptor => {
                    let slot = state
                        .peripherals
                        .get_mut(&self.address)
                        .ok_or_else(|| {
                            RadioError::DiscoveryFailed("peripheral detached".to_string())
                        })?;
                    slot.advertising = true;
                    let advertisement = AirState::advertisement(
                        &self.address,
                        &slot.name,
                        vec![LINKCHAT_SERVICE_UUID],
                    );
                    // A scanning central hears the new advertisement
                    match state.central.as_ref() {
                        Some(CentralSlot {
                            sink: Some(sink),
                            scanning: Some(_),
                            ..
                        }) => vec![(sink.clone(), advertisement)],
                        _ => Outbox::new(),
                    }
                }
            }
        };
        debug!("{} started discovery", self.address);
        deliver(outbox).await;
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        let mut state = self.air.lock();
        match self.role {
            Role::Initiator => {
                if let Some(central) = state.central.as_mut() {
                    central.scanning = None;
                }
            }
            Role::Acceptor => {
                if let Some(slot) = state.peripherals.get_mut(&self.address) {
                    slot.advertising = false;
                }
            }
        }
        Ok(())
    }

    async fn connect(&self, address: &PeerAddress) -> Result<(), RadioError> {
        if self.role != Role::Initiator {
            return Err(RadioError::Unsupported("connect"));
        }

        let outbox = {
            let mut state = self.air.lock();
            let slot = state
                .peripherals
                .get_mut(address)
                .ok_or_else(|| RadioError::PeerNotDiscovered(address.to_string()))?;
            if slot.behavior == PeripheralBehavior::Silent {
                None
            } else if !slot.advertising || slot.central.is_some() {
                return Err(RadioError::ConnectionFailed(format!(
                    "{} is not accepting connections",
                    address
                )));
            } else {
                slot.central = Some(self.address.clone());
                let sink = slot.sink.clone();
                if let Some(central) = state.central.as_mut() {
                    central.connected = Some(address.clone());
                }
                Some(
                    sink.map(|sink| {
                        vec![(
                            sink,
                            RadioEvent::Connected {
                                address: self.address.clone(),
                            },
                        )]
                    })
                    .unwrap_or_default(),
                )
            }
        };

        match outbox {
            Some(outbox) => {
                deliver(outbox).await;
                Ok(())
            }
            // Silent peers never answer
            None => futures::future::pending().await,
        }
    }

    async fn resolve_services(&self, address: &PeerAddress) -> Result<GattHandles, RadioError> {
        let mut state = self.air.lock();
        let slot = Self::connected_peripheral(&mut state, address)?;
        match slot.behavior {
            PeripheralBehavior::MissingCharacteristic => Err(RadioError::CharacteristicMissing {
                characteristic: LINKCHAT_NOTIFY_CHARACTERISTIC_UUID,
            }),
            _ => Ok(GattHandles::standard()),
        }
    }

    async fn enable_notifications(
        &self,
        address: &PeerAddress,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        let outbox = {
            let mut state = self.air.lock();
            let slot = Self::connected_peripheral(&mut state, address)?;
            if characteristic != LINKCHAT_NOTIFY_CHARACTERISTIC_UUID
                || slot.behavior == PeripheralBehavior::MissingCharacteristic
            {
                return Err(RadioError::CharacteristicMissing { characteristic });
            }
            slot.subscribed = true;
            slot.sink
                .clone()
                .map(|sink| {
                    vec![(
                        sink,
                        RadioEvent::Subscribed {
                            address: Some(self.address.clone()),
                        },
                    )]
                })
                .unwrap_or_default()
        };
        deliver(outbox).await;
        Ok(())
    }

    async fn write(
        &self,
        address: Option<&PeerAddress>,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let outbox = {
            let mut state = self.air.lock();
            match self.role {
                Role::Initiator => {
                    let target = address.ok_or(RadioError::NotConnected)?;
                    let slot = Self::connected_peripheral(&mut state, target)?;
                    if characteristic != LINKCHAT_WRITE_CHARACTERISTIC_UUID {
                        return Err(RadioError::CharacteristicMissing { characteristic });
                    }
                    slot.sink.clone().map(|sink| {
                        (
                            sink,
                            RadioEvent::ValueReceived {
                                address: Some(self.address.clone()),
                                characteristic,
                                value: value.to_vec(),
                            },
                        )
                    })
                }
                Role::Acceptor => {
                    let slot = state
                        .peripherals
                        .get(&self.address)
                        .ok_or(RadioError::NotConnected)?;
                    if slot.central.is_none() || !slot.subscribed {
                        return Err(RadioError::NotConnected);
                    }
                    if characteristic != LINKCHAT_NOTIFY_CHARACTERISTIC_UUID {
                        return Err(RadioError::CharacteristicMissing { characteristic });
                    }
                    state
                        .central
                        .as_ref()
                        .and_then(|central| central.sink.clone())
                        .map(|sink| {
                            (
                                sink,
                                RadioEvent::ValueReceived {
                                    address: Some(self.address.clone()),
                                    characteristic,
                                    value: value.to_vec(),
                                },
                            )
                        })
                }
            }
        };

        self.writes.fetch_add(1, Ordering::SeqCst);
        deliver(outbox.into_iter().collect()).await;
        Ok(())
    }

    async fn disconnect(&self, address: Option<&PeerAddress>) -> Result<(), RadioError> {
        let outbox = {
            let mut state = self.air.lock();
            match self.role {
                Role::Initiator => {
                    let connected = state
                        .central
                        .as_ref()
                        .and_then(|central| central.connected.clone());
                    match connected {
                        Some(peripheral) if address.map_or(true, |a| *a == peripheral) => {
                            state.unlink(&peripheral, false, true)
                        }
                        _ => Outbox::new(),
                    }
                }
                Role::Acceptor => state.unlink(&self.address, true, false),
            }
        };
        deliver(outbox).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverInput;
    use tokio::sync::mpsc;

    async fn attached(
        radio: &LoopbackRadio,
    ) -> (mpsc::Sender<DriverInput>, mpsc::Receiver<DriverInput>) {
        let (tx, rx) = mpsc::channel(16);
        radio
            .attach(RadioEventSink::new(tx.downgrade()))
            .await
            .unwrap();
        (tx, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<DriverInput>) -> Vec<RadioEvent> {
        let mut events = Vec::new();
        while let Ok(input) = rx.try_recv() {
            if let DriverInput::Radio(event) = input {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_filtered_scan_hides_noise() {
        let air = LoopbackAir::new();
        let central = air.central();
        let peripheral = air.peripheral("linkchat-b");
        air.add_noise("heart-rate", vec![Uuid::from_u128(0x180D)]);
        let (_ctx, mut crx) = attached(&central).await;
        let (_ptx, _prx) = attached(&peripheral).await;

        peripheral.start_discovery(ScanMode::Filtered).await.unwrap();
        central.start_discovery(ScanMode::Filtered).await.unwrap();
        let seen = drain(&mut crx);
        assert_eq!(seen.len(), 1);

        central.stop_discovery().await.unwrap();
        central.start_discovery(ScanMode::Unfiltered).await.unwrap();
        assert_eq!(drain(&mut crx).len(), 2);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let air = LoopbackAir::new();
        let central = air.central();
        let peripheral = air.peripheral("linkchat-b");
        let (_ctx, _crx) = attached(&central).await;
        let (_ptx, mut prx) = attached(&peripheral).await;

        let target = peripheral.address().clone();
        let err = central
            .write(Some(&target), LINKCHAT_WRITE_CHARACTERISTIC_UUID, b"x")
            .await
            .unwrap_err();
        assert_eq!(err, RadioError::NotConnected);
        assert_eq!(central.writes(), 0);

        peripheral.start_discovery(ScanMode::Filtered).await.unwrap();
        central.connect(&target).await.unwrap();
        central
            .write(Some(&target), LINKCHAT_WRITE_CHARACTERISTIC_UUID, b"x")
            .await
            .unwrap();
        assert_eq!(central.writes(), 1);

        let events = drain(&mut prx);
        assert!(matches!(events[0], RadioEvent::Connected { .. }));
        assert!(matches!(events[1], RadioEvent::ValueReceived { .. }));
    }

    #[tokio::test]
    async fn test_missing_characteristic_peer() {
        let air = LoopbackAir::new();
        let central = air.central();
        let peripheral = air.peripheral_with("old", PeripheralBehavior::MissingCharacteristic);
        let (_ctx, _crx) = attached(&central).await;
        let (_ptx, _prx) = attached(&peripheral).await;

        peripheral.start_discovery(ScanMode::Filtered).await.unwrap();
        central.connect(peripheral.address()).await.unwrap();
        assert!(matches!(
            central.resolve_services(peripheral.address()).await,
            Err(RadioError::CharacteristicMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_other_side() {
        let air = LoopbackAir::new();
        let central = air.central();
        let peripheral = air.peripheral("linkchat-b");
        let (_ctx, mut crx) = attached(&central).await;
        let (_ptx, _prx) = attached(&peripheral).await;

        peripheral.start_discovery(ScanMode::Filtered).await.unwrap();
        central.connect(peripheral.address()).await.unwrap();
        drain(&mut crx);

        peripheral.disconnect(None).await.unwrap();
        assert_eq!(
            drain(&mut crx),
            vec![RadioEvent::Disconnected {
                address: Some(peripheral.address().clone())
            }]
        );
        assert!(!air.central_connected());
    }
}

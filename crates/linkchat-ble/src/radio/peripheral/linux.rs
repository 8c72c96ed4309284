//! Linux acceptor using bluer (BlueZ)
//!
//! Discovery registers the linkchat GATT application and advertises the service.
//! Values written by the central arrive on the write characteristic; outbound
//! frames are queued to the notification session BlueZ opens when the central
//! writes our CCCD.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod,
    CharacteristicWriteRequest, ReqError, Service,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ScanMode;
use crate::error::RadioError;
use crate::protocol::{
    Role, LINKCHAT_NOTIFY_CHARACTERISTIC_UUID, LINKCHAT_SERVICE_UUID,
    LINKCHAT_WRITE_CHARACTERISTIC_UUID,
};
use crate::radio::{PeerAddress, Radio, RadioEvent, RadioEventSink};

type Outbound = (Vec<u8>, oneshot::Sender<Result<(), RadioError>>);

const OUTBOUND_QUEUE: usize = 32;

// ----------------------------------------------------------------------------
// Linux Implementation
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Serving {
    app: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
    outbound: Option<mpsc::Sender<Outbound>>,
}

/// GATT server radio on the default BlueZ adapter
pub struct BluerPeripheral {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    device_name: String,
    events: OnceLock<RadioEventSink>,
    serving: Mutex<Serving>,
    subscribed: Arc<AtomicBool>,
}

impl BluerPeripheral {
    /// Open a BlueZ session and power on the default adapter
    pub async fn new(device_name: &str) -> Result<Self, RadioError> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| RadioError::AdapterNotAvailable(format!("BlueZ session: {}", e)))?;

        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| RadioError::AdapterNotAvailable(format!("BLE adapter: {}", e)))?;

        if !adapter.is_powered().await.unwrap_or(false) {
            adapter.set_powered(true).await.map_err(|e| {
                RadioError::AdapterNotAvailable(format!("Failed to power on adapter: {}", e))
            })?;
        }

        info!("Linux BLE adapter {} initialized for serving", adapter.name());
        Ok(Self {
            _session: session,
            adapter,
            device_name: device_name.to_string(),
            events: OnceLock::new(),
            serving: Mutex::new(Serving::default()),
            subscribed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn sink(&self) -> Result<RadioEventSink, RadioError> {
        self.events
            .get()
            .cloned()
            .ok_or_else(|| RadioError::AdapterNotAvailable("radio not attached".into()))
    }

    fn application(
        &self,
        sink: RadioEventSink,
        outbound: mpsc::Receiver<Outbound>,
    ) -> Application {
        let write_sink = sink.clone();
        let write = Characteristic {
            uuid: LINKCHAT_WRITE_CHARACTERISTIC_UUID,
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                        let sink = write_sink.clone();
                        Box::pin(async move {
                            debug!("GATT write of {} bytes, mtu {}", value.len(), req.mtu);
                            if !sink.is_connected() {
                                return Err(ReqError::Failed);
                            }
                            sink.emit(RadioEvent::ValueReceived {
                                address: None,
                                characteristic: LINKCHAT_WRITE_CHARACTERISTIC_UUID,
                                value,
                            })
                            .await;
                            Ok(())
                        })
                    },
                )),
                ..Default::default()
            }),
            ..Default::default()
        };

        let outbound = Arc::new(Mutex::new(outbound));
        let subscribed = Arc::clone(&self.subscribed);
        let notify = Characteristic {
            uuid: LINKCHAT_NOTIFY_CHARACTERISTIC_UUID,
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                    let outbound = Arc::clone(&outbound);
                    let subscribed = Arc::clone(&subscribed);
                    let sink = sink.clone();
                    Box::pin(async move {
                        let mut outbound = outbound.lock().await;
                        subscribed.store(true, Ordering::SeqCst);
                        sink.emit(RadioEvent::Subscribed { address: None }).await;

                        loop {
                            let next = tokio::select! {
                                _ = notifier.stopped() => None,
                                next = outbound.recv() => next,
                            };
                            let Some((value, reply)) = next else {
                                break;
                            };
                            if let Err(e) = notifier.notify(value).await {
                                warn!("Notification failed: {}", e);
                                let _ = reply.send(Err(RadioError::WriteFailed(e.to_string())));
                                break;
                            }
                            let _ = reply.send(Ok(()));
                        }

                        // Subscription stopped or the queue closed
                        subscribed.store(false, Ordering::SeqCst);
                        drop(outbound);
                        sink.emit(RadioEvent::Disconnected { address: None }).await;
                        debug!("Notification session ended");
                    })
                })),
                ..Default::default()
            }),
            ..Default::default()
        };

        Application {
            services: vec![Service {
                uuid: LINKCHAT_SERVICE_UUID,
                primary: true,
                characteristics: vec![write, notify],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl Radio for BluerPeripheral {
    fn role(&self) -> Role {
        Role::Acceptor
    }

    async fn attach(&self, events: RadioEventSink) -> Result<(), RadioError> {
        self.events
            .set(events)
            .map_err(|_| RadioError::AdapterNotAvailable("radio already attached".into()))
    }

    async fn start_discovery(&self, mode: ScanMode) -> Result<(), RadioError> {
        if mode == ScanMode::Unfiltered {
            debug!("Scan mode has no effect on an advertising peripheral");
        }
        let mut serving = self.serving.lock().await;

        if serving.app.is_none() {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
            let app = self.application(self.sink()?, rx);
            let handle = self.adapter.serve_gatt_application(app).await.map_err(|e| {
                RadioError::DiscoveryFailed(format!("Failed to register GATT service: {}", e))
            })?;
            serving.app = Some(handle);
            serving.outbound = Some(tx);
        }

        if serving.advertisement.is_none() {
            let advertisement = Advertisement {
                advertisement_type: Type::Peripheral,
                service_uuids: vec![LINKCHAT_SERVICE_UUID].into_iter().collect(),
                local_name: Some(self.device_name.clone()),
                discoverable: Some(true),
                ..Default::default()
            };
            let handle = self.adapter.advertise(advertisement).await.map_err(|e| {
                RadioError::DiscoveryFailed(format!("Failed to start advertising: {}", e))
            })?;
            serving.advertisement = Some(handle);
        }

        info!("Started BLE advertising as '{}'", self.device_name);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        if self.serving.lock().await.advertisement.take().is_some() {
            info!("Stopped BLE advertising");
        }
        Ok(())
    }

    async fn write(
        &self,
        _address: Option<&PeerAddress>,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        if characteristic != LINKCHAT_NOTIFY_CHARACTERISTIC_UUID {
            return Err(RadioError::WriteFailed(format!(
                "peripheral cannot send on {}",
                characteristic
            )));
        }
        if !self.subscribed.load(Ordering::SeqCst) {
            return Err(RadioError::NotConnected);
        }
        let outbound = self
            .serving
            .lock()
            .await
            .outbound
            .clone()
            .ok_or(RadioError::NotConnected)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        outbound
            .send((value.to_vec(), reply_tx))
            .await
            .map_err(|_| RadioError::NotConnected)?;
        reply_rx.await.map_err(|_| RadioError::NotConnected)?
    }

    async fn disconnect(&self, address: Option<&PeerAddress>) -> Result<(), RadioError> {
        {
            let mut serving = self.serving.lock().await;
            serving.outbound = None;
            serving.advertisement = None;
            serving.app = None;
        }
        self.subscribed.store(false, Ordering::SeqCst);

        if let Some(address) = address {
            match address.as_str().parse::<bluer::Address>() {
                Ok(addr) => {
                    if let Ok(device) = self.adapter.device(addr) {
                        if device.is_connected().await.unwrap_or(false) {
                            if let Err(e) = device.disconnect().await {
                                warn!("Failed to disconnect {}: {}", address, e);
                            }
                        }
                    }
                }
                Err(_) => debug!("Not a BlueZ address: {}", address),
            }
        }
        info!("GATT service unregistered");
        Ok(())
    }
}

//! GATT message transport
//!
//! Maps the framed send/receive contract onto characteristic writes (initiator),
//! notifications (acceptor) and the driver's inbound value delivery. Frames are
//! never fragmented here; callers size them to `max_payload()`.

use std::sync::Arc;

use async_trait::async_trait;
use linkchat_core::{InboundHandler, Transport, TransportError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::BleLinkConfig;
use crate::driver::LinkHandle;
use crate::radio::Radio;

// ----------------------------------------------------------------------------
// BLE Transport
// ----------------------------------------------------------------------------

/// [`Transport`] over one BLE link
pub struct BleTransport {
    link: LinkHandle,
    radio: Arc<dyn Radio>,
    /// Serializes writes so frames reach the link layer in send order
    write_lock: Mutex<()>,
    max_payload: usize,
}

impl BleTransport {
    pub fn new(link: LinkHandle, config: &BleLinkConfig) -> Self {
        Self {
            radio: link.radio(),
            link,
            write_lock: Mutex::new(()),
            max_payload: config.max_payload_size,
        }
    }

    /// Link this transport writes through
    pub fn link(&self) -> &LinkHandle {
        &self.link
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let _guard = self.write_lock.lock().await;

        let snapshot = self.link.snapshot();
        if !snapshot.state.is_ready() {
            return Err(TransportError::LinkNotReady);
        }
        if payload.len() > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        let characteristic = match snapshot.handles {
            Some(handles) => handles.tx_for(snapshot.role),
            None => return Err(TransportError::LinkNotReady),
        };

        self.radio
            .write(snapshot.remote_address.as_ref(), characteristic, payload)
            .await
            .map_err(|e| {
                warn!("Write of {} bytes failed: {}", payload.len(), e);
                TransportError::from(e)
            })?;

        debug!("Sent {} byte frame on {}", payload.len(), characteristic);
        Ok(())
    }

    async fn on_receive(&self, handler: InboundHandler) -> Result<(), TransportError> {
        self.link.on_receive(handler).await.map_err(TransportError::from)
    }

    fn is_ready(&self) -> bool {
        self.link.is_ready()
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

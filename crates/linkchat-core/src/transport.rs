//! Transport abstraction
//!
//! A transport moves opaque, already-encrypted frames over one established link. It
//! does not fragment, retry or queue: frames larger than [`Transport::max_payload`]
//! are rejected and sends outside the ready state fail with `LinkNotReady`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::TransportError;

/// Callback invoked once per inbound frame, in link-layer order
pub type InboundHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// A point-to-point frame transport bound to a single link
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one frame to the peer
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Register a handler for inbound frames
    ///
    /// Handlers registered while the link is down start receiving once it is ready.
    async fn on_receive(&self, handler: InboundHandler) -> Result<(), TransportError>;

    /// Whether the underlying link is currently ready
    fn is_ready(&self) -> bool;

    /// Largest frame `send` accepts
    fn max_payload(&self) -> usize;
}

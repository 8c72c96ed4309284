//! Session coordinator
//!
//! Glues the cipher, a transport and the message log into the user-facing send and
//! receive flows:
//!
//! - **Send**: text is chunked, every chunk is sealed to the recipient, and only then
//!   are the frames written in order. Nothing is queued or retried; a transport error
//!   aborts the send and is reported.
//! - **Receive**: frames from the transport are handed to an ordered worker which
//!   opens them, reassembles chunks and appends complete messages to the log.
//!   Frames that fail to open or parse are dropped and reported as events.
//!
//! Crypto and log writes run on the blocking pool so the async runtime that drives
//! the radio is never stalled.

use std::sync::Arc;

use rand_core::{OsRng, RngCore};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::crypto::Cipher;
use crate::errors::{LinkChatError, ReassemblyError, Result, TransportError};
use crate::fragmentation::{split_message, Reassembler};
use crate::message_log::{MessageLog, MessageRecord};
use crate::transport::{InboundHandler, Transport};
use crate::types::{MessageFrame, PeerDescriptor, PublicKey};

// ----------------------------------------------------------------------------
// Session Events
// ----------------------------------------------------------------------------

/// Why a send did not go through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendFailure {
    /// No ready link; discover and connect first
    LinkNotReady,
    /// Peer does not expose the expected characteristics
    ProtocolMismatch,
    /// The link layer refused the write
    WriteRejected,
    /// A frame or the whole message exceeds what can be carried
    TooLarge,
    /// Encryption to the recipient key failed
    Encryption,
    /// Background task or log failure
    Internal,
}

impl SendFailure {
    fn from_error(err: &LinkChatError) -> Self {
        match err {
            LinkChatError::Transport(TransportError::LinkNotReady) => SendFailure::LinkNotReady,
            LinkChatError::Transport(TransportError::CharacteristicMissing { .. }) => {
                SendFailure::ProtocolMismatch
            }
            LinkChatError::Transport(TransportError::WriteRejected { .. }) => {
                SendFailure::WriteRejected
            }
            LinkChatError::Transport(TransportError::PayloadTooLarge { .. })
            | LinkChatError::Reassembly(ReassemblyError::MessageTooLarge { .. }) => {
                SendFailure::TooLarge
            }
            LinkChatError::Cipher(_) => SendFailure::Encryption,
            _ => SendFailure::Internal,
        }
    }
}

/// Why an inbound frame was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Frame could not be opened with the local identity
    DecryptionFailed,
    /// Frame opened but its chunk header was invalid
    MalformedChunk(ReassemblyError),
    /// All chunks arrived but the text is not UTF-8
    InvalidUtf8,
    /// The message log refused the record
    LogUnavailable,
}

/// Notifications published by the session coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Every chunk of a message was written to the link
    MessageSent { message_id: u32, chunks: usize },
    /// A complete inbound message was decrypted and logged
    MessageReceived(MessageRecord),
    /// A send was aborted
    SendFailed { failure: SendFailure, reason: String },
    /// An inbound frame was discarded
    FrameDropped { reason: DropReason },
}

/// Outcome of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub message_id: u32,
    pub chunks: usize,
}

// ----------------------------------------------------------------------------
// Session Coordinator
// ----------------------------------------------------------------------------

/// Coordinates encrypted messaging over one transport
pub struct SessionCoordinator<T: Transport + 'static, L: MessageLog + 'static> {
    transport: Arc<T>,
    cipher: Arc<Cipher>,
    log: Arc<L>,
    send_lock: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
    inbound_task: JoinHandle<()>,
}

impl<T: Transport + 'static, L: MessageLog + 'static> SessionCoordinator<T, L> {
    /// Register with the transport and start the inbound worker
    pub async fn start(
        transport: Arc<T>,
        cipher: Arc<Cipher>,
        log: Arc<L>,
        config: SessionConfig,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<MessageFrame>();

        let handler: InboundHandler = Arc::new(move |bytes: Vec<u8>| {
            if frame_tx.send(MessageFrame::inbound(bytes)).is_err() {
                debug!("Inbound worker stopped, discarding frame");
            }
        });
        transport.on_receive(handler).await?;

        let worker = InboundWorker {
            cipher: Arc::clone(&cipher),
            log: Arc::clone(&log),
            events: events.clone(),
            reassembler: Reassembler::new(
                config.reassembly_timeout,
                config.max_pending_messages,
            ),
        };
        let inbound_task = tokio::spawn(worker.run(frame_rx));

        info!(
            "Session started for identity {}",
            cipher.public_key().fingerprint().short()
        );

        Ok(Self {
            transport,
            cipher,
            log,
            send_lock: Mutex::new(()),
            events,
            inbound_task,
        })
    }

    /// Public key peers must encrypt to
    pub fn local_public_key(&self) -> PublicKey {
        self.cipher.public_key()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether the underlying transport can currently send
    pub fn is_ready(&self) -> bool {
        self.transport.is_ready()
    }

    /// Encrypt and send a text message to `recipient`
    pub async fn send_message(&self, text: &str, recipient: &PeerDescriptor) -> Result<SendReport> {
        let _guard = self.send_lock.lock().await;

        if !self.transport.is_ready() {
            return Err(self.fail(TransportError::LinkNotReady.into()));
        }

        let message_id = OsRng.next_u32();
        let chunks = split_message(message_id, text.as_bytes()).map_err(|e| self.fail(e.into()))?;
        let chunk_count = chunks.len();

        let cipher = Arc::clone(&self.cipher);
        let recipient_key = recipient.public_key;
        let sealed = tokio::task::spawn_blocking(move || {
            chunks
                .iter()
                .map(|chunk| cipher.encrypt_for(chunk, &recipient_key))
                .collect::<core::result::Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| self.fail(LinkChatError::task_error(e.to_string())))?
        .map_err(|e| self.fail(e.into()))?;

        for frame in sealed.into_iter().map(MessageFrame::outbound) {
            self.transport
                .send(&frame.bytes)
                .await
                .map_err(|e| self.fail(e.into()))?;
        }

        debug!(
            "Sent message {:08x} to {} in {} chunk(s)",
            message_id, recipient.display_name, chunk_count
        );

        let log = Arc::clone(&self.log);
        let record = MessageRecord::outbound(text);
        tokio::task::spawn_blocking(move || log.append(record))
            .await
            .map_err(|e| self.fail(LinkChatError::task_error(e.to_string())))?
            .map_err(|e| self.fail(e.into()))?;

        self.emit(SessionEvent::MessageSent {
            message_id,
            chunks: chunk_count,
        });

        Ok(SendReport {
            message_id,
            chunks: chunk_count,
        })
    }

    /// Full conversation history in timestamp order
    pub fn history(&self) -> Result<Vec<MessageRecord>> {
        Ok(self.log.list_all()?)
    }

    fn fail(&self, err: LinkChatError) -> LinkChatError {
        let failure = SendFailure::from_error(&err);
        warn!("Send failed ({:?}): {}", failure, err);
        self.emit(SessionEvent::SendFailed {
            failure,
            reason: err.to_string(),
        });
        err
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

impl<T: Transport + 'static, L: MessageLog + 'static> Drop for SessionCoordinator<T, L> {
    fn drop(&mut self) {
        self.inbound_task.abort();
    }
}

// ----------------------------------------------------------------------------
// Inbound Worker
// ----------------------------------------------------------------------------

struct InboundWorker<L: MessageLog + 'static> {
    cipher: Arc<Cipher>,
    log: Arc<L>,
    events: broadcast::Sender<SessionEvent>,
    reassembler: Reassembler,
}

impl<L: MessageLog + 'static> InboundWorker<L> {
    async fn run(mut self, mut frames: mpsc::UnboundedReceiver<MessageFrame>) {
        while let Some(frame) = frames.recv().await {
            self.handle_frame(frame).await;
        }
        debug!("Inbound worker exiting");
    }

    async fn handle_frame(&mut self, frame: MessageFrame) {
        let cipher = Arc::clone(&self.cipher);
        let bytes = frame.bytes;
        let frame_len = bytes.len();

        let opened = match tokio::task::spawn_blocking(move || cipher.decrypt(&bytes)).await {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(_)) => {
                warn!("Dropping {} byte frame that failed to decrypt", frame_len);
                self.drop_frame(DropReason::DecryptionFailed);
                return;
            }
            Err(e) => {
                error!("Decrypt task failed: {}", e);
                self.drop_frame(DropReason::DecryptionFailed);
                return;
            }
        };

        let text = match self.reassembler.accept(&opened) {
            Ok(Some(text)) => text,
            Ok(None) => return,
            Err(ReassemblyError::InvalidUtf8) => {
                warn!("Dropping message that is not valid UTF-8");
                self.drop_frame(DropReason::InvalidUtf8);
                return;
            }
            Err(e) => {
                warn!("Dropping malformed chunk: {}", e);
                self.drop_frame(DropReason::MalformedChunk(e));
                return;
            }
        };

        let record = MessageRecord::inbound(text);
        let log = Arc::clone(&self.log);
        let logged = record.clone();
        match tokio::task::spawn_blocking(move || log.append(logged)).await {
            Ok(Ok(())) => {
                debug!("Received message of {} bytes", record.text.len());
                let _ = self.events.send(SessionEvent::MessageReceived(record));
            }
            Ok(Err(e)) => {
                error!("Failed to log inbound message: {}", e);
                self.drop_frame(DropReason::LogUnavailable);
            }
            Err(e) => {
                error!("Log task failed: {}", e);
                self.drop_frame(DropReason::LogUnavailable);
            }
        }
    }

    fn drop_frame(&self, reason: DropReason) {
        let _ = self.events.send(SessionEvent::FrameDropped { reason });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

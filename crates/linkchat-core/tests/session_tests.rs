//! Integration tests for the session coordinator over an in-memory transport pair

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use linkchat_core::{
    Cipher, Direction, DropReason, Identity, InboundHandler, LinkChatError, MemoryMessageLog,
    MessageLog, PeerDescriptor, SendFailure, SessionConfig, SessionCoordinator, SessionEvent,
    Transport, TransportError,
};
use tokio::sync::broadcast;
use tokio_test::assert_err;

// ----------------------------------------------------------------------------
// Test Transport
// ----------------------------------------------------------------------------

/// One end of an in-memory link; writes are delivered to the other end's handlers
#[derive(Default)]
struct PairedTransport {
    ready: AtomicBool,
    writes: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
    handlers: Mutex<Vec<InboundHandler>>,
    peer: Mutex<Weak<PairedTransport>>,
}

impl PairedTransport {
    fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::default());
        let b = Arc::new(Self::default());
        *a.peer.lock().unwrap() = Arc::downgrade(&b);
        *b.peer.lock().unwrap() = Arc::downgrade(&a);
        a.set_ready(true);
        b.set_ready(true);
        (a, b)
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn reject_writes_after(&self, count: usize) {
        *self.fail_after.lock().unwrap() = Some(count);
    }

    /// Push raw bytes at this end as if the peer had written them
    fn inject(&self, bytes: Vec<u8>) {
        let handlers = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(bytes.clone());
        }
    }
}

#[async_trait]
impl Transport for PairedTransport {
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::LinkNotReady);
        }
        if payload.len() > self.max_payload() {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload(),
            });
        }
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if self.writes() >= limit {
                return Err(TransportError::WriteRejected {
                    reason: "peer busy".to_string(),
                });
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let peer = self.peer.lock().unwrap().upgrade();
        if let Some(peer) = peer {
            peer.inject(payload.to_vec());
        }
        Ok(())
    }

    async fn on_receive(&self, handler: InboundHandler) -> Result<(), TransportError> {
        self.handlers.lock().unwrap().push(handler);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn max_payload(&self) -> usize {
        512
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

type Session = SessionCoordinator<PairedTransport, MemoryMessageLog>;

struct Device {
    session: Session,
    log: Arc<MemoryMessageLog>,
    transport: Arc<PairedTransport>,
    descriptor: PeerDescriptor,
}

async fn device(name: &str, seed: u8, transport: Arc<PairedTransport>) -> Device {
    let cipher = Arc::new(Cipher::new(Arc::new(Identity::from_secret_bytes([seed; 32]))));
    let descriptor = PeerDescriptor::new(name, cipher.public_key());
    let log = Arc::new(MemoryMessageLog::new());
    let session = SessionCoordinator::start(
        Arc::clone(&transport),
        cipher,
        Arc::clone(&log),
        SessionConfig::default(),
    )
    .await
    .unwrap();
    Device {
        session,
        log,
        transport,
        descriptor,
    }
}

async fn connected_pair() -> (Device, Device) {
    let _ = tracing_subscriber::fmt::try_init();
    let (ta, tb) = PairedTransport::pair();
    (device("alice", 1, ta).await, device("bob", 2, tb).await)
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_hello_is_delivered_and_logged() {
    let (alice, bob) = connected_pair().await;
    let mut bob_events = bob.session.subscribe();
    let mut alice_events = alice.session.subscribe();

    let report = alice
        .session
        .send_message("hello", &bob.descriptor)
        .await
        .unwrap();
    assert_eq!(report.chunks, 1);
    assert_eq!(alice.transport.writes(), 1);

    match next_event(&mut bob_events).await {
        SessionEvent::MessageReceived(record) => {
            assert_eq!(record.text, "hello");
            assert_eq!(record.direction, Direction::Inbound);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(
        next_event(&mut alice_events).await,
        SessionEvent::MessageSent {
            message_id: report.message_id,
            chunks: 1,
        }
    );

    let bob_history = bob.session.history().unwrap();
    assert_eq!(bob_history.len(), 1);
    assert_eq!(bob_history[0].text, "hello");

    let alice_history = alice.log.list_all().unwrap();
    assert_eq!(alice_history.len(), 1);
    assert_eq!(alice_history[0].direction, Direction::Outbound);
}

#[tokio::test]
async fn test_long_message_is_reassembled() {
    let (alice, bob) = connected_pair().await;
    let mut bob_events = bob.session.subscribe();
    let text = "m".repeat(600);

    let report = alice
        .session
        .send_message(&text, &bob.descriptor)
        .await
        .unwrap();
    assert_eq!(report.chunks, 3);
    assert_eq!(alice.transport.writes(), 3);

    match next_event(&mut bob_events).await {
        SessionEvent::MessageReceived(record) => assert_eq!(record.text, text),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(bob.log.len(), 1);
}

#[tokio::test]
async fn test_send_without_ready_link_fails_without_writing() {
    let (alice, bob) = connected_pair().await;
    alice.transport.set_ready(false);
    let mut alice_events = alice.session.subscribe();

    let err = assert_err!(alice.session.send_message("hello", &bob.descriptor).await);
    assert!(matches!(
        err,
        LinkChatError::Transport(TransportError::LinkNotReady)
    ));
    assert_eq!(alice.transport.writes(), 0);
    assert!(alice.log.is_empty());

    match next_event(&mut alice_events).await {
        SessionEvent::SendFailed { failure, .. } => {
            assert_eq!(failure, SendFailure::LinkNotReady)
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_write_aborts_send() {
    let (alice, bob) = connected_pair().await;
    alice.transport.reject_writes_after(1);

    let err = alice
        .session
        .send_message(&"r".repeat(600), &bob.descriptor)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LinkChatError::Transport(TransportError::WriteRejected { .. })
    ));
    assert_eq!(alice.transport.writes(), 1);
    // Nothing recorded as sent
    assert!(alice.log.is_empty());
}

#[tokio::test]
async fn test_garbage_frame_is_dropped() {
    let (_alice, bob) = connected_pair().await;
    let mut bob_events = bob.session.subscribe();

    bob.transport.inject(vec![0x01; 80]);

    assert_eq!(
        next_event(&mut bob_events).await,
        SessionEvent::FrameDropped {
            reason: DropReason::DecryptionFailed,
        }
    );
    assert!(bob.log.is_empty());
}

#[tokio::test]
async fn test_frame_for_another_key_is_dropped() {
    let (alice, bob) = connected_pair().await;
    let mut bob_events = bob.session.subscribe();

    // Sealed to a third party but delivered to bob
    let carol = PeerDescriptor::new(
        "carol",
        Identity::from_secret_bytes([3; 32]).public_key(),
    );
    alice.session.send_message("psst", &carol).await.unwrap();

    assert_eq!(
        next_event(&mut bob_events).await,
        SessionEvent::FrameDropped {
            reason: DropReason::DecryptionFailed,
        }
    );
    assert!(bob.log.is_empty());
}

#[tokio::test]
async fn test_messages_keep_send_order() {
    let (alice, bob) = connected_pair().await;
    let mut bob_events = bob.session.subscribe();

    for text in ["one", "two", "three"] {
        alice.session.send_message(text, &bob.descriptor).await.unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        if let SessionEvent::MessageReceived(record) = next_event(&mut bob_events).await {
            received.push(record.text);
        }
    }
    assert_eq!(received, vec!["one", "two", "three"]);
}

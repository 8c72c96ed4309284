//! Two devices messaging through session, transport and link driver over the loopback air

use std::sync::Arc;
use std::time::Duration;

use linkchat_ble::{
    BleLinkConfig, BleTransport, LinkDriver, LinkHandle, LinkState, LoopbackAir, LoopbackRadio,
};
use linkchat_core::{
    Cipher, Direction, Identity, LinkChatError, MemoryMessageLog, MessageLog, PeerDescriptor,
    SendFailure, SessionConfig, SessionCoordinator, SessionEvent, Transport, TransportError,
};
use tokio::sync::broadcast;

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(5);

struct Device {
    link: LinkHandle,
    radio: Arc<LoopbackRadio>,
    transport: Arc<BleTransport>,
    session: SessionCoordinator<BleTransport, MemoryMessageLog>,
    log: Arc<MemoryMessageLog>,
    descriptor: PeerDescriptor,
}

async fn device(name: &str, seed: u8, radio: Arc<LoopbackRadio>) -> Device {
    let config = BleLinkConfig::default();
    let link = LinkDriver::spawn(radio.clone(), &config).await.unwrap();
    let transport = Arc::new(BleTransport::new(link.clone(), &config));

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
        link,
        radio,
        transport,
        session,
        log,
        descriptor,
    }
}

async fn wait_ready(device: &Device) {
    device
        .link
        .wait_for(|s| s.state.is_ready(), WAIT)
        .await
        .unwrap();
}

async fn wait_settled(device: &Device) {
    device
        .link
        .wait_for(
            |s| s.state == LinkState::Disconnected && !s.release_pending,
            WAIT,
        )
        .await
        .unwrap();
}

async fn establish(alice: &Device, bob: &Device) {
    bob.link.start_discovery().await.unwrap();
    alice.link.start_discovery().await.unwrap();
    wait_ready(alice).await;
    wait_ready(bob).await;
}

/// Alice scans and connects, Bob advertises
async fn linked_pair() -> (LoopbackAir, Device, Device) {
    let _ = tracing_subscriber::fmt::try_init();
    let air = LoopbackAir::new();
    let alice = device("alice", 1, air.central()).await;
    let bob = device("bob", 2, air.peripheral("linkchat-bob")).await;
    establish(&alice, &bob).await;
    (air, alice, bob)
}

async fn next_received(events: &mut broadcast::Receiver<SessionEvent>) -> String {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("event channel closed");
        if let SessionEvent::MessageReceived(record) = event {
            assert_eq!(record.direction, Direction::Inbound);
            return record.text;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_hello_reaches_acceptor() {
    let (_air, alice, bob) = linked_pair().await;
    let mut bob_events = bob.session.subscribe();

    let report = alice
        .session
        .send_message("hello", &bob.descriptor)
        .await
        .unwrap();
    assert_eq!(report.chunks, 1);
    assert_eq!(alice.radio.writes(), 1);

    assert_eq!(next_received(&mut bob_events).await, "hello");
    let history = bob.session.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "hello");
    assert_eq!(alice.log.list_all().unwrap()[0].direction, Direction::Outbound);
}

#[tokio::test]
async fn test_acceptor_replies_by_notification() {
    let (_air, alice, bob) = linked_pair().await;
    let mut alice_events = alice.session.subscribe();

    bob.session
        .send_message("hi alice", &alice.descriptor)
        .await
        .unwrap();
    assert_eq!(bob.radio.writes(), 1);
    assert_eq!(alice.radio.writes(), 0);

    assert_eq!(next_received(&mut alice_events).await, "hi alice");
}

#[tokio::test]
async fn test_long_message_is_chunked_and_reassembled() {
    let (_air, alice, bob) = linked_pair().await;
    let mut bob_events = bob.session.subscribe();
    let text = "x".repeat(600);

    let report = alice
        .session
        .send_message(&text, &bob.descriptor)
        .await
        .unwrap();
    assert_eq!(report.chunks, 3);
    assert_eq!(alice.radio.writes(), 3);

    assert_eq!(next_received(&mut bob_events).await, text);
    assert_eq!(bob.log.len(), 1);
}

#[tokio::test]
async fn test_message_for_someone_else_is_dropped() {
    let (_air, alice, bob) = linked_pair().await;
    let mut bob_events = bob.session.subscribe();
    let stranger = PeerDescriptor::new(
        "mallory",
        Cipher::new(Arc::new(Identity::from_secret_bytes([9; 32]))).public_key(),
    );

    alice
        .session
        .send_message("not for bob", &stranger)
        .await
        .unwrap();

    let event = tokio::time::timeout(WAIT, bob_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, SessionEvent::FrameDropped { .. }));
    assert!(bob.log.is_empty());
}

#[tokio::test]
async fn test_send_after_peer_closes_is_refused() {
    let (_air, alice, bob) = linked_pair().await;

    bob.link.close().await.unwrap();
    wait_settled(&alice).await;
    assert!(!alice.transport.is_ready());

    let mut alice_events = alice.session.subscribe();
    let err = alice
        .session
        .send_message("anyone there?", &bob.descriptor)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LinkChatError::Transport(TransportError::LinkNotReady)
    ));
    assert_eq!(alice.radio.writes(), 0);
    assert!(alice.log.is_empty());

    match alice_events.recv().await.unwrap() {
        SessionEvent::SendFailed { failure, .. } => assert_eq!(failure, SendFailure::LinkNotReady),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_link_can_be_reestablished_after_loss() {
    let (air, alice, bob) = linked_pair().await;

    air.sever(bob.radio.address()).await;
    wait_settled(&alice).await;
    wait_settled(&bob).await;

    alice.link.reset().await.unwrap();
    bob.link.reset().await.unwrap();
    establish(&alice, &bob).await;

    let mut bob_events = bob.session.subscribe();
    alice
        .session
        .send_message("back again", &bob.descriptor)
        .await
        .unwrap();
    assert_eq!(next_received(&mut bob_events).await, "back again");
}

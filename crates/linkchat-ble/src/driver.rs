//! Link driver
//!
//! A single tokio task owns the [`LinkSession`] and is the only writer of link
//! state. Host requests, radio callbacks and command completions all arrive on
//! one bounded queue and are applied strictly in arrival order.
//!
//! Radio commands are executed off the loop:
//! - discovery, disconnect and release go through one ordered radio worker
//! - connect, service resolution and notification enablement run as attempt
//!   tasks, aborted when the session releases its handles
//!
//! Timeouts come from a generation-checked deadline polled inside the same
//! `select!`, so a stack that never calls back still cannot stall a link.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use linkchat_core::InboundHandler;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{BleLinkConfig, ScanMode};
use crate::error::{LinkError, RadioError};
use crate::protocol::Role;
use crate::radio::{GattHandles, PeerAddress, Radio, RadioEvent, RadioEventSink};
use crate::state::{FailureCause, LinkCommand, LinkEvent, LinkSession, LinkState, Transition};

// ----------------------------------------------------------------------------
// Driver Inputs
// ----------------------------------------------------------------------------

/// Everything the driver loop consumes
pub(crate) enum DriverInput {
    Request(HostRequest),
    Radio(RadioEvent),
    Completion(LinkEvent),
}

pub(crate) enum HostRequest {
    StartDiscovery {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    RegisterReceiver {
        handler: InboundHandler,
        reply: oneshot::Sender<()>,
    },
}

/// Ordered radio work
enum RadioOp {
    StartDiscovery(ScanMode),
    StopDiscovery,
    Disconnect(PeerAddress),
    Release(Option<PeerAddress>),
}

// ----------------------------------------------------------------------------
// Published State
// ----------------------------------------------------------------------------

/// Point-in-time view of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub role: Role,
    pub remote_address: Option<PeerAddress>,
    pub handles: Option<GattHandles>,
    pub last_failure: Option<FailureCause>,
    /// Radio handles are still being released
    pub release_pending: bool,
}

impl LinkSnapshot {
    fn of(session: &LinkSession) -> Self {
        Self {
            state: session.state().clone(),
            role: session.role(),
            remote_address: session.remote_address().cloned(),
            handles: session.handles().copied(),
            last_failure: session.last_failure().cloned(),
            release_pending: session.release_pending(),
        }
    }
}

/// A state change, as broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStateChange {
    pub from: LinkState,
    pub to: LinkState,
}

// ----------------------------------------------------------------------------
// Link Handle
// ----------------------------------------------------------------------------

/// Host-facing handle to a running link driver
///
/// Cheap to clone. The driver stops once every handle is dropped.
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<DriverInput>,
    snapshot: watch::Receiver<LinkSnapshot>,
    changes: broadcast::Sender<LinkStateChange>,
    radio: Arc<dyn Radio>,
    role: Role,
}

impl LinkHandle {
    /// Begin scanning (initiator) or advertising (acceptor)
    pub async fn start_discovery(&self) -> Result<(), LinkError> {
        let (reply, response) = oneshot::channel();
        self.request(HostRequest::StartDiscovery { reply }).await?;
        response.await.map_err(|_| LinkError::DriverStopped)?
    }

    /// Close the link; a no-op when nothing is active
    pub async fn close(&self) -> Result<(), LinkError> {
        let (reply, response) = oneshot::channel();
        self.request(HostRequest::Close { reply }).await?;
        response.await.map_err(|_| LinkError::DriverStopped)
    }

    /// Return a disconnected link to `Idle`
    pub async fn reset(&self) -> Result<(), LinkError> {
        let (reply, response) = oneshot::channel();
        self.request(HostRequest::Reset { reply }).await?;
        response.await.map_err(|_| LinkError::DriverStopped)?
    }

    /// Register a handler for values arriving while the link is ready
    pub async fn on_receive(&self, handler: InboundHandler) -> Result<(), LinkError> {
        let (reply, response) = oneshot::channel();
        self.request(HostRequest::RegisterReceiver { handler, reply })
            .await?;
        response.await.map_err(|_| LinkError::DriverStopped)
    }

    pub fn state(&self) -> LinkState {
        self.snapshot.borrow().state.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot.borrow().state.is_ready()
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receive every subsequent state change
    pub fn subscribe_changes(&self) -> broadcast::Receiver<LinkStateChange> {
        self.changes.subscribe()
    }

    /// Wait until the published snapshot satisfies `predicate`
    pub async fn wait_for<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> Result<LinkSnapshot, LinkError>
    where
        F: Fn(&LinkSnapshot) -> bool,
    {
        let mut snapshot = self.snapshot.clone();
        let result = match tokio::time::timeout(timeout, snapshot.wait_for(|s| predicate(s))).await
        {
            Ok(Ok(matched)) => Ok(matched.clone()),
            Ok(Err(_)) => Err(LinkError::DriverStopped),
            Err(_) => Err(LinkError::WaitTimeout { state: self.state() }),
        };
        result
    }

    /// Radio backing this link
    pub fn radio(&self) -> Arc<dyn Radio> {
        Arc::clone(&self.radio)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    async fn request(&self, request: HostRequest) -> Result<(), LinkError> {
        self.tx
            .send(DriverInput::Request(request))
            .await
            .map_err(|_| LinkError::DriverStopped)
    }
}

// ----------------------------------------------------------------------------
// Link Driver
// ----------------------------------------------------------------------------

/// Event loop owning one link session
pub struct LinkDriver {
    session: LinkSession,
    radio: Arc<dyn Radio>,
    rx: mpsc::Receiver<DriverInput>,
    tx: mpsc::WeakSender<DriverInput>,
    snapshot: watch::Sender<LinkSnapshot>,
    changes: broadcast::Sender<LinkStateChange>,
    receivers: Vec<InboundHandler>,
    deadline: Option<(Instant, u64)>,
    ops: mpsc::UnboundedSender<RadioOp>,
    attempts: Vec<JoinHandle<()>>,
}

impl LinkDriver {
    /// Attach to `radio` and start the driver loop
    pub async fn spawn(
        radio: Arc<dyn Radio>,
        config: &BleLinkConfig,
    ) -> Result<LinkHandle, LinkError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_queue_capacity);
        radio.attach(RadioEventSink::new(tx.downgrade())).await?;

        let role = radio.role();
        let session = LinkSession::new(role, config);
        let (snapshot_tx, snapshot_rx) = watch::channel(LinkSnapshot::of(&session));
        let (changes, _) = broadcast::channel(config.event_queue_capacity.max(16));

        let (ops, ops_rx) = mpsc::unbounded_channel();
        tokio::spawn(radio_worker(
            Arc::clone(&radio),
            ops_rx,
            tx.downgrade(),
            config.connection_timeout,
        ));

        let driver = LinkDriver {
            session,
            radio: Arc::clone(&radio),
            rx,
            tx: tx.downgrade(),
            snapshot: snapshot_tx,
            changes: changes.clone(),
            receivers: Vec::new(),
            deadline: None,
            ops,
            attempts: Vec::new(),
        };
        tokio::spawn(driver.run());

        Ok(LinkHandle {
            tx,
            snapshot: snapshot_rx,
            changes,
            radio,
            role,
        })
    }

    async fn run(mut self) {
        info!("Link driver started as {:?}", self.session.role());

        loop {
            let deadline = self.deadline;
            tokio::select! {
                input = self.rx.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => break,
                },
                generation = expire(deadline) => {
                    self.deadline = None;
                    self.process_quietly(LinkEvent::Timeout { generation });
                }
            }
        }

        // Last handle dropped
        self.abort_attempts();
        if !matches!(self.session.state(), LinkState::Idle) {
            self.enqueue(RadioOp::Release(self.session.remote_address().cloned()));
        }
        info!("Link driver stopped");
    }

    fn handle_input(&mut self, input: DriverInput) {
        match input {
            DriverInput::Request(request) => self.handle_request(request),
            DriverInput::Radio(event) => self.handle_radio_event(event),
            DriverInput::Completion(event) => self.process_quietly(event),
        }
    }

    fn handle_request(&mut self, request: HostRequest) {
        match request {
            HostRequest::StartDiscovery { reply } => {
                let result = self.process(LinkEvent::StartDiscovery);
                let _ = reply.send(result);
            }
            HostRequest::Close { reply } => {
                self.process_quietly(LinkEvent::LocalClose);
                let _ = reply.send(());
            }
            HostRequest::Reset { reply } => {
                let result = self.process(LinkEvent::Reset);
                let _ = reply.send(result);
            }
            HostRequest::RegisterReceiver { handler, reply } => {
                self.receivers.push(handler);
                let _ = reply.send(());
            }
        }
    }

    fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::AdvertisementSeen {
                address,
                local_name,
                services,
                rssi,
            } => {
                trace!("Advertisement from {} (rssi {:?})", address, rssi);
                self.process_quietly(LinkEvent::AdvertisementSeen {
                    address,
                    services,
                    local_name,
                });
            }
            RadioEvent::Connected { address } => {
                self.process_quietly(LinkEvent::RemoteConnected { address })
            }
            RadioEvent::Subscribed { address } => {
                self.process_quietly(LinkEvent::PeerSubscribed { address })
            }
            RadioEvent::Disconnected { address } => {
                self.process_quietly(LinkEvent::RemoteDisconnected { address })
            }
            RadioEvent::ScanFailed { reason } => {
                self.process_quietly(LinkEvent::ScanFailed { reason })
            }
            RadioEvent::ValueReceived {
                address,
                characteristic,
                value,
            } => self.deliver(address, characteristic, value),
        }
    }

    /// Hand an inbound value to the receivers, in arrival order
    fn deliver(&self, address: Option<PeerAddress>, characteristic: uuid::Uuid, value: Vec<u8>) {
        let expected = self
            .session
            .handles()
            .map(|handles| handles.rx_for(self.session.role()));
        let from_peer = match (&address, self.session.remote_address()) {
            (Some(reported), Some(current)) => reported == current,
            _ => true,
        };

        if !self.session.state().is_ready() || expected != Some(characteristic) || !from_peer {
            debug!(
                "Dropping {} byte value on {} in {}",
                value.len(),
                characteristic,
                self.session.state()
            );
            return;
        }

        debug!("Received {} byte value", value.len());
        for handler in &self.receivers {
            handler(value.clone());
        }
    }

    /// Apply an event, publish the result and run its commands
    fn process(&mut self, event: LinkEvent) -> Result<(), LinkError> {
        let transition = self.session.apply(event)?;
        let found = transition.changed() && transition.to == LinkState::Found;
        self.commit(transition);

        if found {
            self.process(LinkEvent::Connect)?;
        }
        Ok(())
    }

    fn process_quietly(&mut self, event: LinkEvent) {
        if let Err(e) = self.process(event) {
            debug!("Link event rejected: {}", e);
        }
    }

    fn commit(&mut self, transition: Transition) {
        if transition.changed() {
            info!("Link {} -> {}", transition.from, transition.to);
            let _ = self.changes.send(LinkStateChange {
                from: transition.from,
                to: transition.to,
            });
        }

        let next = LinkSnapshot::of(&self.session);
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        for command in transition.commands {
            self.execute(command);
        }
    }

    fn execute(&mut self, command: LinkCommand) {
        trace!("Executing {:?}", command);
        match command {
            LinkCommand::ArmTimer {
                generation,
                duration,
            } => self.deadline = Some((Instant::now() + duration, generation)),
            LinkCommand::CancelTimer => self.deadline = None,
            LinkCommand::StartDiscovery(mode) => self.enqueue(RadioOp::StartDiscovery(mode)),
            LinkCommand::StopDiscovery => self.enqueue(RadioOp::StopDiscovery),
            LinkCommand::Disconnect(address) => self.enqueue(RadioOp::Disconnect(address)),
            LinkCommand::Release { address } => {
                self.abort_attempts();
                self.enqueue(RadioOp::Release(address));
            }
            LinkCommand::Connect(address) => {
                let radio = Arc::clone(&self.radio);
                self.spawn_attempt(async move {
                    match radio.connect(&address).await {
                        Ok(()) => LinkEvent::LinkEstablished { address },
                        Err(e) => LinkEvent::ConnectFailed {
                            reason: e.to_string(),
                        },
                    }
                });
            }
            LinkCommand::ResolveServices(address) => {
                let radio = Arc::clone(&self.radio);
                self.spawn_attempt(async move {
                    match radio.resolve_services(&address).await {
                        Ok(handles) => LinkEvent::ServicesResolved { handles },
                        Err(e) => attempt_failure(address, e),
                    }
                });
            }
            LinkCommand::EnableNotifications(address, characteristic) => {
                let radio = Arc::clone(&self.radio);
                self.spawn_attempt(async move {
                    match radio.enable_notifications(&address, characteristic).await {
                        Ok(()) => LinkEvent::DescriptorWritten,
                        Err(e) => attempt_failure(address, e),
                    }
                });
            }
        }
    }

    fn enqueue(&self, op: RadioOp) {
        if self.ops.send(op).is_err() {
            warn!("Radio worker stopped; command dropped");
        }
    }

    fn spawn_attempt<F>(&mut self, attempt: F)
    where
        F: Future<Output = LinkEvent> + Send + 'static,
    {
        let tx = self.tx.clone();
        self.attempts.retain(|task| !task.is_finished());
        self.attempts.push(tokio::spawn(async move {
            let event = attempt.await;
            complete(&tx, event).await;
        }));
    }

    fn abort_attempts(&mut self) {
        for task in self.attempts.drain(..) {
            task.abort();
        }
    }
}

/// Resolves at the armed deadline with its generation; never when disarmed
async fn expire(deadline: Option<(Instant, u64)>) -> u64 {
    match deadline {
        Some((at, generation)) => {
            sleep_until(at).await;
            generation
        }
        None => futures::future::pending().await,
    }
}

fn attempt_failure(address: PeerAddress, err: RadioError) -> LinkEvent {
    match err {
        RadioError::CharacteristicMissing { characteristic } => {
            LinkEvent::CharacteristicMissing { characteristic }
        }
        RadioError::NotConnected => LinkEvent::RemoteDisconnected {
            address: Some(address),
        },
        other => LinkEvent::ProtocolError {
            reason: other.to_string(),
        },
    }
}

async fn complete(tx: &mpsc::WeakSender<DriverInput>, event: LinkEvent) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(DriverInput::Completion(event)).await;
    }
}

/// Run a teardown call, giving up after `limit`
async fn bounded<F>(what: &str, limit: Duration, call: F)
where
    F: Future<Output = Result<(), RadioError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to {}: {}", what, e),
        Err(_) => warn!("Radio did not {} within {:?}", what, limit),
    }
}

/// Executes discovery and teardown operations one at a time, in issue order
///
/// Every radio call is bounded by `limit`; `Released` is always reported.
async fn radio_worker(
    radio: Arc<dyn Radio>,
    mut ops: mpsc::UnboundedReceiver<RadioOp>,
    tx: mpsc::WeakSender<DriverInput>,
    limit: Duration,
) {
    while let Some(op) = ops.recv().await {
        match op {
            RadioOp::StartDiscovery(mode) => {
                let reason = match tokio::time::timeout(limit, radio.start_discovery(mode)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("discovery did not start within {:?}", limit),
                };
                warn!("Failed to start discovery: {}", reason);
                complete(&tx, LinkEvent::ScanFailed { reason }).await;
            }
            RadioOp::StopDiscovery => {
                bounded("stop discovery", limit, radio.stop_discovery()).await;
            }
            RadioOp::Disconnect(address) => {
                bounded("disconnect", limit, radio.disconnect(Some(&address))).await;
            }
            RadioOp::Release(address) => {
                bounded("stop discovery", limit, radio.stop_discovery()).await;
                bounded("disconnect", limit, radio.disconnect(address.as_ref())).await;
                debug!("Link handles released");
                complete(&tx, LinkEvent::Released).await;
            }
        }
    }
}

//! Link State Machine
//!
//! Pure lifecycle logic for a single BLE link. [`LinkSession::apply`] consumes one
//! [`LinkEvent`] at a time and returns the resulting [`Transition`] together with the
//! radio [`LinkCommand`]s the driver must execute. Nothing here touches the radio or
//! spawns tasks, so every path is testable without hardware.
//!
//! ```text
//! Idle -> Discovering -> Found -> Connecting -> ServicesResolving
//!      -> NotificationsEnabling -> Ready -> Disconnected -> (reset) Idle
//! ```
//!
//! Any active state can fall into `Failed(cause)`, which becomes `Disconnected` once
//! the driver reports the radio handles released.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BleLinkConfig, ScanMode};
use crate::error::LinkError;
use crate::protocol::{advertises_service, Role};
use crate::radio::{GattHandles, PeerAddress};

// ----------------------------------------------------------------------------
// Link States
// ----------------------------------------------------------------------------

/// Lifecycle state of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Idle,
    /// Scanning (initiator) or advertising (acceptor)
    Discovering,
    /// A matching advertisement was seen; scanning has stopped
    Found,
    Connecting,
    ServicesResolving,
    NotificationsEnabling,
    /// Usable for sending and receiving
    Ready,
    Failed(FailureCause),
    Disconnected,
}

impl LinkState {
    /// Short state name for logs
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Idle => "Idle",
            LinkState::Discovering => "Discovering",
            LinkState::Found => "Found",
            LinkState::Connecting => "Connecting",
            LinkState::ServicesResolving => "ServicesResolving",
            LinkState::NotificationsEnabling => "NotificationsEnabling",
            LinkState::Ready => "Ready",
            LinkState::Failed(_) => "Failed",
            LinkState::Disconnected => "Disconnected",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LinkState::Ready)
    }

    /// Discovering or any of the connecting states
    pub fn is_establishing(&self) -> bool {
        matches!(
            self,
            LinkState::Discovering
                | LinkState::Found
                | LinkState::Connecting
                | LinkState::ServicesResolving
                | LinkState::NotificationsEnabling
        )
    }

    /// Failed or Disconnected
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed(_) | LinkState::Disconnected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Failed(cause) => write!(f, "Failed({})", cause),
            other => f.write_str(other.name()),
        }
    }
}

// ----------------------------------------------------------------------------
// Failure Causes
// ----------------------------------------------------------------------------

/// Why a link attempt ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// No matching peer within the discovery window
    DiscoveryTimeout,
    /// Connected-state progress stalled past the connection window
    ConnectionTimeout,
    /// Link dropped before it became ready
    LinkLost,
    ConnectFailed { reason: String },
    ProtocolError { reason: String },
    /// Peer lacks an expected characteristic (version mismatch)
    CharacteristicMissing { characteristic: Uuid },
    RadioError { reason: String },
}

/// Broad class of a link failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// Restart discovery to recover
    Discovery,
    /// Link dropped or never came up
    Connection,
    /// Only disconnecting helps; peers disagree on the protocol
    ProtocolMismatch,
}

impl FailureCause {
    pub fn category(&self) -> FailureCategory {
        match self {
            FailureCause::DiscoveryTimeout => FailureCategory::Discovery,
            FailureCause::ConnectionTimeout
            | FailureCause::LinkLost
            | FailureCause::ConnectFailed { .. }
            | FailureCause::RadioError { .. } => FailureCategory::Connection,
            FailureCause::ProtocolError { .. } | FailureCause::CharacteristicMissing { .. } => {
                FailureCategory::ProtocolMismatch
            }
        }
    }

    /// User-visible notice for this failure
    pub fn notice(&self) -> &'static str {
        match self.category() {
            FailureCategory::Discovery => "peer not found",
            FailureCategory::Connection => "connection lost",
            FailureCategory::ProtocolMismatch => "protocol mismatch",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::DiscoveryTimeout => f.write_str("discovery timeout"),
            FailureCause::ConnectionTimeout => f.write_str("connection timeout"),
            FailureCause::LinkLost => f.write_str("link lost"),
            FailureCause::ConnectFailed { reason } => write!(f, "connect failed: {}", reason),
            FailureCause::ProtocolError { reason } => write!(f, "protocol error: {}", reason),
            FailureCause::CharacteristicMissing { characteristic } => {
                write!(f, "characteristic missing: {}", characteristic)
            }
            FailureCause::RadioError { reason } => write!(f, "radio error: {}", reason),
        }
    }
}

// ----------------------------------------------------------------------------
// Events and Commands
// ----------------------------------------------------------------------------

/// Inputs to the state machine: host requests, radio callbacks and command results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Host asked to begin scanning or advertising
    StartDiscovery,
    /// Initiator saw an advertisement
    AdvertisementSeen {
        address: PeerAddress,
        services: Vec<Uuid>,
        local_name: Option<String>,
    },
    /// Connect to the found peer (issued by the driver right after `Found`)
    Connect,
    /// Acceptor: a central connected to us
    RemoteConnected { address: PeerAddress },
    /// Initiator: connect completed
    LinkEstablished { address: PeerAddress },
    ConnectFailed { reason: String },
    ServicesResolved { handles: GattHandles },
    CharacteristicMissing { characteristic: Uuid },
    /// Initiator: CCCD on the notify characteristic was written
    DescriptorWritten,
    /// Acceptor: the remote central enabled notifications
    PeerSubscribed { address: Option<PeerAddress> },
    ProtocolError { reason: String },
    ScanFailed { reason: String },
    /// The armed timer fired
    Timeout { generation: u64 },
    RemoteDisconnected { address: Option<PeerAddress> },
    /// Host asked to close the link
    LocalClose,
    /// Driver finished releasing radio handles
    Released,
    /// Host asked to recycle a disconnected session
    Reset,
}

/// Radio work the driver must perform after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    StartDiscovery(ScanMode),
    StopDiscovery,
    Connect(PeerAddress),
    ResolveServices(PeerAddress),
    EnableNotifications(PeerAddress, Uuid),
    /// Drop a connection that is not (or no longer) part of this session
    Disconnect(PeerAddress),
    ArmTimer { generation: u64, duration: Duration },
    CancelTimer,
    /// Stop discovery and disconnect, then report `Released`
    Release { address: Option<PeerAddress> },
}

/// Result of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: LinkState,
    pub to: LinkState,
    pub commands: Vec<LinkCommand>,
}

impl Transition {
    /// Whether the state changed
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

// ----------------------------------------------------------------------------
// Link Session
// ----------------------------------------------------------------------------

/// One link's lifecycle, owned by a single writer
#[derive(Debug, Clone)]
pub struct LinkSession {
    role: Role,
    scan_mode: ScanMode,
    state: LinkState,
    remote_address: Option<PeerAddress>,
    handles: Option<GattHandles>,
    attempt_started_at: Option<Instant>,
    last_failure: Option<FailureCause>,
    timer_generation: u64,
    discovery_timeout: Duration,
    connection_timeout: Duration,
    release_pending: bool,
}

impl LinkSession {
    /// Create an idle session for the given role
    pub fn new(role: Role, config: &BleLinkConfig) -> Self {
        Self {
            role,
            scan_mode: config.scan_mode,
            state: LinkState::Idle,
            remote_address: None,
            handles: None,
            attempt_started_at: None,
            last_failure: None,
            timer_generation: 0,
            discovery_timeout: config.discovery_timeout,
            connection_timeout: config.connection_timeout,
            release_pending: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn remote_address(&self) -> Option<&PeerAddress> {
        self.remote_address.as_ref()
    }

    pub fn handles(&self) -> Option<&GattHandles> {
        self.handles.as_ref()
    }

    pub fn last_failure(&self) -> Option<&FailureCause> {
        self.last_failure.as_ref()
    }

    /// When the current discovery attempt began
    pub fn attempt_started_at(&self) -> Option<Instant> {
        self.attempt_started_at
    }

    /// Generation of the currently armed timer
    pub fn timer_generation(&self) -> u64 {
        self.timer_generation
    }

    /// Whether a `Release` command is still outstanding
    pub fn release_pending(&self) -> bool {
        self.release_pending
    }

    /// Process an event and move to the next state
    pub fn apply(&mut self, event: LinkEvent) -> Result<Transition, LinkError> {
        let from = self.state.clone();

        let commands = match (from.clone(), event) {
            // Starting discovery
            (LinkState::Idle, LinkEvent::StartDiscovery) => {
                self.state = LinkState::Discovering;
                self.attempt_started_at = Some(Instant::now());
                self.last_failure = None;
                let timer = self.arm_timer(self.discovery_timeout);
                vec![LinkCommand::StartDiscovery(self.scan_mode), timer]
            }
            (state, LinkEvent::StartDiscovery) if state.is_terminal() => {
                return Err(LinkError::NotIdle { state });
            }
            (state, LinkEvent::StartDiscovery) => {
                return Err(LinkError::AlreadyInProgress { state });
            }

            // Initiator discovery
            (
                LinkState::Discovering,
                LinkEvent::AdvertisementSeen {
                    address,
                    services,
                    local_name,
                },
            ) if self.role == Role::Initiator => {
                if advertises_service(&services) {
                    info!(
                        "Found linkchat peer {} ({})",
                        address,
                        local_name.as_deref().unwrap_or("unnamed")
                    );
                    self.state = LinkState::Found;
                    self.remote_address = Some(address);
                    vec![LinkCommand::StopDiscovery]
                } else {
                    Vec::new()
                }
            }
            (LinkState::Found, LinkEvent::Connect) => match self.remote_address.clone() {
                Some(address) => {
                    self.state = LinkState::Connecting;
                    let timer = self.arm_timer(self.connection_timeout);
                    vec![LinkCommand::Connect(address), timer]
                }
                None => self.fail(FailureCause::ProtocolError {
                    reason: "found peer has no address".to_string(),
                }),
            },
            (LinkState::Connecting, LinkEvent::LinkEstablished { address })
                if self.remote_address.as_ref() == Some(&address) =>
            {
                self.state = LinkState::ServicesResolving;
                vec![LinkCommand::ResolveServices(address)]
            }
            (_, LinkEvent::LinkEstablished { address }) => {
                debug!("Dropping stale connection to {}", address);
                vec![LinkCommand::Disconnect(address)]
            }
            (LinkState::Connecting, LinkEvent::ConnectFailed { reason }) => {
                self.fail(FailureCause::ConnectFailed { reason })
            }
            (LinkState::ServicesResolving, LinkEvent::ServicesResolved { handles }) => {
                match self.remote_address.clone() {
                    Some(address) => {
                        let notify = handles.rx_for(self.role);
                        self.handles = Some(handles);
                        self.state = LinkState::NotificationsEnabling;
                        vec![LinkCommand::EnableNotifications(address, notify)]
                    }
                    None => self.fail(FailureCause::ProtocolError {
                        reason: "resolved services without a peer".to_string(),
                    }),
                }
            }
            (
                LinkState::ServicesResolving | LinkState::NotificationsEnabling,
                LinkEvent::CharacteristicMissing { characteristic },
            ) => self.fail(FailureCause::CharacteristicMissing { characteristic }),
            (LinkState::NotificationsEnabling, LinkEvent::DescriptorWritten) => {
                self.become_ready()
            }

            // Acceptor
            (LinkState::Discovering, LinkEvent::RemoteConnected { address })
                if self.role == Role::Acceptor =>
            {
                info!("Central {} connected", address);
                self.state = LinkState::Connecting;
                self.remote_address = Some(address);
                let timer = self.arm_timer(self.connection_timeout);
                vec![LinkCommand::StopDiscovery, timer]
            }
            (
                state @ (LinkState::Discovering | LinkState::Connecting),
                LinkEvent::PeerSubscribed { address },
            ) if self.role == Role::Acceptor => {
                if address.is_some() {
                    self.remote_address = address;
                }
                self.handles = Some(GattHandles::standard());
                let mut commands = Vec::new();
                if state == LinkState::Discovering {
                    commands.push(LinkCommand::StopDiscovery);
                }
                commands.extend(self.become_ready());
                commands
            }

            // Faults while establishing
            (state, LinkEvent::ProtocolError { reason })
                if state.is_establishing() || state.is_ready() =>
            {
                self.fail(FailureCause::ProtocolError { reason })
            }
            (LinkState::Discovering, LinkEvent::ScanFailed { reason }) => {
                self.fail(FailureCause::RadioError { reason })
            }
            (state, LinkEvent::Timeout { generation }) => {
                if generation != self.timer_generation {
                    debug!("Ignoring stale timer {} in {}", generation, state);
                    Vec::new()
                } else {
                    match state {
                        LinkState::Discovering | LinkState::Found => {
                            self.fail(FailureCause::DiscoveryTimeout)
                        }
                        LinkState::Connecting
                        | LinkState::ServicesResolving
                        | LinkState::NotificationsEnabling => {
                            self.fail(FailureCause::ConnectionTimeout)
                        }
                        _ => Vec::new(),
                    }
                }
            }

            // Teardown
            (state, LinkEvent::RemoteDisconnected { address })
                if (state.is_establishing() || state.is_ready())
                    && self.is_current_peer(&address) =>
            {
                if state.is_ready() {
                    info!("Peer disconnected");
                    self.disconnect()
                } else if state == LinkState::Discovering || state == LinkState::Found {
                    Vec::new()
                } else {
                    self.fail(FailureCause::LinkLost)
                }
            }
            (state, LinkEvent::LocalClose) if state.is_establishing() || state.is_ready() => {
                info!("Closing link from {}", state);
                self.disconnect()
            }
            (state, LinkEvent::Released) if self.release_pending => {
                self.release_pending = false;
                self.handles = None;
                if let LinkState::Failed(_) = state {
                    self.state = LinkState::Disconnected;
                }
                Vec::new()
            }

            // Recycling
            (LinkState::Disconnected, LinkEvent::Reset) if !self.release_pending => {
                self.state = LinkState::Idle;
                self.remote_address = None;
                self.handles = None;
                self.attempt_started_at = None;
                self.last_failure = None;
                Vec::new()
            }
            (LinkState::Disconnected | LinkState::Failed(_), LinkEvent::Reset) => {
                return Err(LinkError::HandlesNotReleased);
            }
            (LinkState::Idle, LinkEvent::Reset) => Vec::new(),
            (state, LinkEvent::Reset) => {
                return Err(LinkError::ResetNotAllowed { state });
            }

            (state, event) => {
                debug!("Ignoring {:?} in {}", event, state);
                Vec::new()
            }
        };

        Ok(Transition {
            from,
            to: self.state.clone(),
            commands,
        })
    }

    fn arm_timer(&mut self, duration: Duration) -> LinkCommand {
        self.timer_generation += 1;
        LinkCommand::ArmTimer {
            generation: self.timer_generation,
            duration,
        }
    }

    fn cancel_timer(&mut self) -> LinkCommand {
        self.timer_generation += 1;
        LinkCommand::CancelTimer
    }

    fn is_current_peer(&self, address: &Option<PeerAddress>) -> bool {
        match (address, &self.remote_address) {
            (Some(reported), Some(current)) => reported == current,
            _ => true,
        }
    }

    fn become_ready(&mut self) -> Vec<LinkCommand> {
        self.state = LinkState::Ready;
        let elapsed = self
            .attempt_started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();
        info!(
            "Link ready as {:?} with {} after {:?}",
            self.role,
            self.remote_address
                .as_ref()
                .map(PeerAddress::as_str)
                .unwrap_or("unknown peer"),
            elapsed
        );
        vec![self.cancel_timer()]
    }

    fn fail(&mut self, cause: FailureCause) -> Vec<LinkCommand> {
        warn!("Link failed in {}: {} ({})", self.state, cause, cause.notice());
        self.state = LinkState::Failed(cause.clone());
        self.last_failure = Some(cause);
        self.release()
    }

    fn disconnect(&mut self) -> Vec<LinkCommand> {
        self.state = LinkState::Disconnected;
        self.handles = None;
        self.release()
    }

    fn release(&mut self) -> Vec<LinkCommand> {
        self.release_pending = true;
        vec![
            self.cancel_timer(),
            LinkCommand::Release {
                address: self.remote_address.clone(),
            },
        ]
    }
}

//! Error types for the BLE link

use linkchat_core::{LinkChatError, TransportError};
use thiserror::Error;
use uuid::Uuid;

use crate::state::LinkState;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors reported by a radio backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("BLE adapter not available: {0}")]
    AdapterNotAvailable(String),

    #[error("Operation not supported by this radio: {0}")]
    Unsupported(&'static str),

    #[error("Failed to start discovery: {0}")]
    DiscoveryFailed(String),

    #[error("Failed to connect to peer: {0}")]
    ConnectionFailed(String),

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicMissing { characteristic: Uuid },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Peer not connected")]
    NotConnected,

    #[error("Peer not discovered: {0}")]
    PeerNotDiscovered(String),
}

/// Errors returned by the link state machine and its driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Discovery or connection already in progress (state: {state})")]
    AlreadyInProgress { state: LinkState },

    #[error("Link is not idle (state: {state}); reset first")]
    NotIdle { state: LinkState },

    #[error("Reset not allowed in state {state}")]
    ResetNotAllowed { state: LinkState },

    #[error("Radio handles have not been released yet")]
    HandlesNotReleased,

    #[error("Timed out waiting for link state (last: {state})")]
    WaitTimeout { state: LinkState },

    #[error("Link driver stopped")]
    DriverStopped,

    #[error("Invalid link configuration: {reason}")]
    Configuration { reason: String },

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
}

impl From<RadioError> for TransportError {
    fn from(err: RadioError) -> Self {
        match err {
            RadioError::CharacteristicMissing { characteristic } => {
                TransportError::CharacteristicMissing {
                    characteristic: characteristic.to_string(),
                }
            }
            RadioError::NotConnected => TransportError::LinkNotReady,
            other => TransportError::WriteRejected {
                reason: other.to_string(),
            },
        }
    }
}

impl From<LinkError> for TransportError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::DriverStopped => TransportError::Closed,
            LinkError::Radio(radio) => radio.into(),
            other => TransportError::WriteRejected {
                reason: other.to_string(),
            },
        }
    }
}

impl From<LinkError> for LinkChatError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Configuration { reason } => LinkChatError::config_error(reason),
            LinkError::Radio(RadioError::CharacteristicMissing { characteristic }) => {
                TransportError::CharacteristicMissing {
                    characteristic: characteristic.to_string(),
                }
                .into()
            }
            LinkError::DriverStopped => LinkChatError::task_error("Link driver stopped"),
            other => LinkChatError::Transport(TransportError::WriteRejected {
                reason: other.to_string(),
            }),
        }
    }
}

//! Legal transitions for the link, network and transfer state machines.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

pub trait StateMachine: Copy + PartialEq + fmt::Debug + fmt::Display {
    fn can_transition_to(&self, next: Self) -> bool;

    fn is_terminal(&self) -> bool {
        false
    }

    /// Move to `next`, or fail with [`Error::InvalidTransition`].
    fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

/// Control link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl StateMachine for LinkState {
    fn can_transition_to(&self, next: Self) -> bool {
        use LinkState::{Connected, Connecting, Disconnected};
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected | Self::Error | Disconnected)
                | (Connected, Disconnected | Self::Error)
                | (Self::Error, Connecting | Disconnected)
        )
    }
}

/// Bulk network substrate (hotspot or joined access point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Disabled,
    CreatingHotspot,
    HotspotActive,
    Connecting,
    Connected,
    Error,
}

impl StateMachine for NetworkState {
    fn can_transition_to(&self, next: Self) -> bool {
        use NetworkState::{Connected, Connecting, CreatingHotspot, Disabled, HotspotActive};
        matches!(
            (self, next),
            (Disabled, CreatingHotspot | Connecting)
                | (CreatingHotspot, HotspotActive | Self::Error | Disabled)
                | (Connecting, Connected | Self::Error | Disabled)
                | (HotspotActive | Connected, Disabled | Self::Error)
                | (Self::Error, CreatingHotspot | Connecting | Disabled)
        )
    }
}

/// One transfer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    Requesting,
    AwaitingAccept,
    Transferring,
    Verifying,
    Completed,
    Failed,
}

impl StateMachine for TransferState {
    fn can_transition_to(&self, next: Self) -> bool {
        use TransferState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Requesting)
                | (Requesting, AwaitingAccept)
                | (AwaitingAccept, Transferring)
                | (Transferring, Verifying)
                | (Verifying, Completed)
        )
    }

    fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }
}

macro_rules! display_as_serde {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_value(self) {
                    Ok(serde_json::Value::String(s)) => f.write_str(&s),
                    _ => fmt::Debug::fmt(self, f),
                }
            }
        }
    )*};
}

display_as_serde!(LinkState, NetworkState, TransferState);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_happy_path() {
        let state = LinkState::Disconnected;
        let state = state.transition(LinkState::Connecting).unwrap();
        let state = state.transition(LinkState::Connected).unwrap();
        assert_eq!(state.transition(LinkState::Disconnected).unwrap(), LinkState::Disconnected);
    }

    #[test]
    fn test_link_rejects_skipping_connecting() {
        let err = LinkState::Disconnected
            .transition(LinkState::Connected)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(
            err.to_string(),
            "invalid state transition from disconnected to connected"
        );
    }

    #[test]
    fn test_network_roles() {
        use NetworkState::{Connected, Connecting, CreatingHotspot, Disabled, HotspotActive};
        assert!(Disabled.can_transition_to(CreatingHotspot));
        assert!(CreatingHotspot.can_transition_to(HotspotActive));
        assert!(Disabled.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(!CreatingHotspot.can_transition_to(Connected));
        assert!(NetworkState::Error.can_transition_to(CreatingHotspot));
    }

    #[test]
    fn test_transfer_lifecycle_and_terminals() {
        use TransferState::*;
        let mut state = Idle;
        for next in [Requesting, AwaitingAccept, Transferring, Verifying, Completed] {
            state = state.transition(next).unwrap();
        }
        assert!(state.is_terminal());
        assert!(state.transition(Failed).is_err());
        assert!(Failed.transition(Idle).is_err());
        assert!(Transferring.can_transition_to(Failed));
        assert!(!Requesting.can_transition_to(Transferring));
    }

    #[test]
    fn test_display_matches_wire_names() {
        assert_eq!(NetworkState::HotspotActive.to_string(), "hotspot_active");
        assert_eq!(TransferState::AwaitingAccept.to_string(), "awaiting_accept");
    }
}

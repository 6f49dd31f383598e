//! Observable state of the hub connection.
//!
//! The kernel publishes `HubState` on a watch channel. The lifecycle is:
//!
//! ```text
//! Connecting -> Connected -> Reconnecting(delay) -> Connecting -> ...
//!                         \-> Failed(reason)   (terminal)
//! ```

use std::{fmt, time::Duration};

#[derive(Debug, Clone, PartialEq)]
pub enum HubState {
    /// Waiting for CONNACK.
    Connecting,
    /// CONNACK accepted and the inbound subscription requested.
    Connected,
    /// A transient failure happened; the next attempt starts after the delay.
    Reconnecting(Duration),
    /// A fatal failure stopped the kernel. No further attempts are made.
    Failed(String),
    /// The session was destroyed.
    Closed,
}

impl HubState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubState::Connecting => "Connecting",
            HubState::Connected => "Connected",
            HubState::Reconnecting(_) => "Reconnecting",
            HubState::Failed(_) => "Failed",
            HubState::Closed => "Closed",
        }
    }

    /// True for states after which the kernel never delivers again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HubState::Failed(_) | HubState::Closed)
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubState::Reconnecting(delay) => {
                write!(f, "Reconnecting (in {:.1} seconds)", delay.as_secs_f64())
            }
            HubState::Failed(reason) => write!(f, "Failed ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(HubState::Connected.to_string(), "Connected");
        assert_eq!(
            HubState::Reconnecting(Duration::from_millis(2500)).to_string(),
            "Reconnecting (in 2.5 seconds)"
        );
        assert_eq!(
            HubState::Failed("not authorized".into()).to_string(),
            "Failed (not authorized)"
        );
    }

    #[test]
    fn test_state_predicates() {
        assert!(!HubState::Connected.is_terminal());
        assert!(HubState::Failed("x".into()).is_terminal());
        assert!(HubState::Closed.is_terminal());
        assert!(!HubState::Reconnecting(Duration::from_secs(1)).is_terminal());
    }
}

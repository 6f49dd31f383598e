//! Station link events and their effect on the connectivity signal.
//!
//! | event            | action                                   |
//! |------------------|------------------------------------------|
//! | `StationStart`   | connect                                  |
//! | `IpAcquired`     | set `CONNECTED`                          |
//! | `Disconnected`   | connect, then clear `CONNECTED`          |
//! | `Other`          | nothing                                  |
//!
//! On `Disconnected` the reconnect is issued before the bit is cleared, so a
//! waiter cannot be woken between the two steps.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::signal::{Condition, ConnectivitySignal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StationStart,
    IpAcquired,
    Disconnected,
    /// Any event the handler does not act on, by name.
    Other(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Network stack is not running")]
    StackStopped,
}

/// Commands the handler can issue back to the network stack.
///
/// Implementations must not block: they are called from the event path.
pub trait NetworkStack: Send + Sync {
    fn connect(&self) -> Result<(), LinkError>;
}

pub struct LinkEventHandler {
    stack: Arc<dyn NetworkStack>,
    signal: ConnectivitySignal,
}

impl LinkEventHandler {
    pub fn new(stack: Arc<dyn NetworkStack>, signal: ConnectivitySignal) -> Self {
        Self { stack, signal }
    }

    /// Applies one event. Connect failures are logged and never returned, so
    /// the stack's event path always sees success.
    pub fn on_event(&self, event: &LinkEvent) -> Result<(), LinkError> {
        match event {
            LinkEvent::StationStart => {
                info!("Station started, connecting");
                self.connect();
            }
            LinkEvent::IpAcquired => {
                info!("IP address acquired");
                self.signal.set(Condition::CONNECTED);
            }
            LinkEvent::Disconnected => {
                warn!("Station disconnected, reconnecting");
                self.connect();
                self.signal.clear(Condition::CONNECTED);
            }
            LinkEvent::Other(name) => trace!("Ignoring link event: {}", name),
        }
        Ok(())
    }

    fn connect(&self) {
        if let Err(e) = self.stack.connect() {
            warn!("Connect command failed: {}", e);
        }
    }

    /// Consumes events until every sender is dropped.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        debug!("Link event handler started");
        while let Some(event) = events.recv().await {
            let _ = self.on_event(&event);
        }
        debug!("Link event channel closed, handler stopped");
    }
}

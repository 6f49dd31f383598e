//! Network stack used when running on a host OS.
//!
//! The host already owns a working network, so association is simulated:
//! `start()` emits `StationStart` and every connect command is answered with
//! `IpAcquired`. `drop_link()` injects a `Disconnected` event.
//!
//! Events go out over an unbounded channel. A burst of link flaps therefore
//! never costs the handler the `IpAcquired` that ends it.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::link::{LinkError, LinkEvent, NetworkStack};

pub struct HostStation {
    ssid: String,
    passphrase: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    connect_attempts: AtomicU64,
}

impl HostStation {
    pub fn new(
        ssid: impl Into<String>,
        passphrase: impl Into<String>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            ssid: ssid.into(),
            passphrase: passphrase.into(),
            events,
            connect_attempts: AtomicU64::new(0),
        }
    }

    /// Security mode implied by the passphrase.
    pub fn security(&self) -> &'static str {
        if self.passphrase.is_empty() {
            "open"
        } else {
            "WPA2-PSK"
        }
    }

    pub fn start(&self) -> Result<(), LinkError> {
        info!(
            "Starting station for SSID '{}' ({})",
            self.ssid,
            self.security()
        );
        self.emit(LinkEvent::StationStart)
    }

    pub fn drop_link(&self) -> Result<(), LinkError> {
        self.emit(LinkEvent::Disconnected)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    fn emit(&self, event: LinkEvent) -> Result<(), LinkError> {
        self.events
            .send(event)
            .map_err(|_| LinkError::StackStopped)
    }
}

impl NetworkStack for HostStation {
    fn connect(&self) -> Result<(), LinkError> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Associating with '{}' using {} (attempt {})",
            self.ssid,
            self.security(),
            attempt
        );
        self.emit(LinkEvent::IpAcquired)
    }
}

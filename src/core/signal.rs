//! Connectivity signal shared between the link handler and the session worker.
//!
//! The signal is a small set of condition bits held in a `watch` channel.
//! Setters never block. Waiters suspend until every requested bit is set and
//! return immediately when they already are.

use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::debug;

/// A set of condition bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition(u32);

impl Condition {
    /// The station holds an IP address.
    pub const CONNECTED: Condition = Condition(1 << 0);

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Condition::CONNECTED {
            f.write_str("CONNECTED")
        } else {
            write!(f, "{:#06x}", self.0)
        }
    }
}

/// Cloneable handle to one process-wide flag set.
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    bits: Arc<watch::Sender<u32>>,
}

impl ConnectivitySignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { bits: Arc::new(tx) }
    }

    /// Sets `condition` and wakes every waiter it satisfies.
    pub fn set(&self, condition: Condition) {
        let changed = self.bits.send_if_modified(|bits| {
            let before = *bits;
            *bits |= condition.bits();
            *bits != before
        });
        if changed {
            debug!("Connectivity condition set: {}", condition);
        }
    }

    pub fn clear(&self, condition: Condition) {
        let changed = self.bits.send_if_modified(|bits| {
            let before = *bits;
            *bits &= !condition.bits();
            *bits != before
        });
        if changed {
            debug!("Connectivity condition cleared: {}", condition);
        }
    }

    pub fn is_set(&self, condition: Condition) -> bool {
        *self.bits.borrow() & condition.bits() == condition.bits()
    }

    /// Suspends until `condition` is set.
    pub async fn wait_until(&self, condition: Condition) {
        let mut rx = self.bits.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = rx
            .wait_for(|bits| bits & condition.bits() == condition.bits())
            .await;
    }

    /// Like [`wait_until`](Self::wait_until) but gives up after `timeout`.
    /// Returns whether the condition was observed.
    pub async fn wait_until_timeout(&self, condition: Condition, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_until(condition))
            .await
            .is_ok()
    }
}

impl Default for ConnectivitySignal {
    fn default() -> Self {
        Self::new()
    }
}

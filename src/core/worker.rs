//! Cloud session worker.
//!
//! ```text
//! AwaitingConnectivity -> Initializing -> Running -> Terminated
//!                              |
//!                              +-> Degraded(reason)   (terminal, no retry)
//! ```
//!
//! The worker waits for `CONNECTED` once, opens a single session, and then
//! pumps it on a fixed interval. It does not look at the connectivity signal
//! again: link loss mid-session is handled by the session library. Failures
//! are logged and end the worker; nothing is retried and nothing is returned
//! to a caller beyond the final state.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use cloudlink_iothub::{ConnectionDescriptor, Transport};
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
    session::{MessageHandler, Session, SessionLibrary},
    signal::{Condition, ConnectivitySignal},
};

/// How long the worker waits for connectivity before logging a reminder.
const CONNECTIVITY_REMINDER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    AwaitingConnectivity,
    Initializing,
    Running,
    /// Setup failed; the session was torn down and will not be retried.
    Degraded(String),
    Terminated,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Degraded(_) | WorkerState::Terminated)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::AwaitingConnectivity => f.write_str("AwaitingConnectivity"),
            WorkerState::Initializing => f.write_str("Initializing"),
            WorkerState::Running => f.write_str("Running"),
            WorkerState::Degraded(reason) => write!(f, "Degraded: {}", reason),
            WorkerState::Terminated => f.write_str("Terminated"),
        }
    }
}

pub struct SessionWorker {
    library: Arc<dyn SessionLibrary>,
    descriptor: ConnectionDescriptor,
    transport: Transport,
    pump_interval: Duration,
    signal: ConnectivitySignal,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    state_tx: watch::Sender<WorkerState>,
    pumps: Arc<AtomicU64>,
}

impl SessionWorker {
    pub fn new(
        library: Arc<dyn SessionLibrary>,
        descriptor: ConnectionDescriptor,
        transport: Transport,
        pump_interval: Duration,
        signal: ConnectivitySignal,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::AwaitingConnectivity);
        Self {
            library,
            descriptor,
            transport,
            pump_interval,
            signal,
            handler,
            cancel: CancellationToken::new(),
            state_tx,
            pumps: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Token that stops the worker. Cancelling it makes `run` tear down and return.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared counter of completed work pumps.
    pub fn pump_counter(&self) -> Arc<AtomicU64> {
        self.pumps.clone()
    }

    fn set_state(&self, state: WorkerState) {
        debug!("Session worker state: {}", state);
        self.state_tx.send_replace(state);
    }

    /// Runs the worker to completion and returns its final state.
    #[instrument(skip(self), fields(device = %self.descriptor.device_id()))]
    pub async fn run(self) -> WorkerState {
        self.set_state(WorkerState::AwaitingConnectivity);
        if !self.signal.is_set(Condition::CONNECTED) {
            info!("Waiting for network connectivity...");
        }
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Session worker cancelled before connectivity");
                    self.set_state(WorkerState::Terminated);
                    return WorkerState::Terminated;
                }
                connected = self
                    .signal
                    .wait_until_timeout(Condition::CONNECTED, CONNECTIVITY_REMINDER) => {
                    if connected {
                        break;
                    }
                    warn!("Still waiting for network connectivity...");
                }
            }
        }

        self.set_state(WorkerState::Initializing);
        if let Err(e) = self.library.init() {
            // Nothing was initialized, so there is nothing to release.
            error!("{}", e);
            let state = WorkerState::Degraded(e.to_string());
            self.set_state(state.clone());
            return state;
        }

        let mut session = match self.open_session() {
            Ok(session) => session,
            Err((session, reason)) => {
                error!("{}", reason);
                if let Some(mut session) = session {
                    session.destroy().await;
                }
                self.library.deinit();
                let state = WorkerState::Degraded(reason);
                self.set_state(state.clone());
                return state;
            }
        };

        self.set_state(WorkerState::Running);
        info!(
            "Cloud session running (pump interval: {}ms)",
            self.pump_interval.as_millis()
        );

        let mut ticker = interval(self.pump_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Session worker cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match session.pump().await {
                Ok(dispatched) => {
                    self.pumps.fetch_add(1, Ordering::Relaxed);
                    if dispatched > 0 {
                        trace!("Work pump dispatched {} message(s)", dispatched);
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    break;
                }
            }
        }

        session.destroy().await;
        self.library.deinit();
        self.set_state(WorkerState::Terminated);
        info!("Session worker terminated");
        WorkerState::Terminated
    }

    /// Creates the session and registers the handler. The library must
    /// already be initialized.
    ///
    /// On failure, returns the session if it was already created so that the
    /// caller can destroy it, along with the reason.
    fn open_session(&self) -> Result<Box<dyn Session>, (Option<Box<dyn Session>>, String)> {
        let mut session = self
            .library
            .create(&self.descriptor, self.transport)
            .map_err(|e| (None, e.to_string()))?;

        match session.register_message_callback(self.handler.clone()) {
            Ok(()) => Ok(session),
            Err(e) => Err((Some(session), e.to_string())),
        }
    }
}

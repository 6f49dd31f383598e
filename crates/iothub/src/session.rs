//! Device session handle.
//!
//! `IotHubSession::create` prepares the client and spawns the connection
//! kernel. `do_work` never blocks: it hands out at most one pending
//! cloud-to-device message per call, which makes it usable from a periodic
//! pump loop.

use tokio::{
    sync::{
        mpsc::{self, error::TryRecvError},
        watch,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    backoff::Backoff,
    client::{ClientBuilder, SessionOptions},
    descriptor::ConnectionDescriptor,
    error::TransferError,
    kernel::ConnectionKernel,
    message::CloudMessage,
    state::HubState,
};

const RECONNECT_MULTIPLIER: f64 = 2.0;

pub struct IotHubSession {
    device_id: String,
    inbound_rx: mpsc::Receiver<CloudMessage>,
    state_rx: watch::Receiver<HubState>,
    cancel: CancellationToken,
    kernel: JoinHandle<Result<(), TransferError>>,
}

impl IotHubSession {
    /// Builds the MQTT client for `descriptor` and starts connecting in the
    /// background.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the SAS token cannot be signed or TLS material cannot be
    /// loaded. Network failures do not surface here; the kernel retries them.
    pub fn create(
        descriptor: &ConnectionDescriptor,
        options: &SessionOptions,
    ) -> Result<Self, TransferError> {
        let builder = ClientBuilder::from_descriptor(descriptor, options)?;
        let credentials = builder.credentials().clone();
        let (client, event_loop) = builder.build()?;

        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        let kernel = ConnectionKernel::new(
            client,
            event_loop,
            descriptor.inbound_topic_filter(),
            credentials,
            Backoff::new(
                options.reconnect_delay,
                options.max_reconnect_delay,
                RECONNECT_MULTIPLIER,
            ),
            cancel.clone(),
            inbound_tx,
        );
        let state_rx = kernel.subscribe_state();
        let kernel = tokio::spawn(kernel.run());

        info!(
            "Hub session created for device '{}' over {}",
            descriptor.device_id(),
            options.transport
        );

        Ok(Self {
            device_id: descriptor.device_id().to_string(),
            inbound_rx,
            state_rx,
            cancel,
            kernel,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> HubState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HubState> {
        self.state_rx.clone()
    }

    /// Returns the next pending message, if any, without waiting.
    ///
    /// # Errors
    ///
    /// `TransferError::KernelStopped` once the connection kernel has failed
    /// or exited. Messages already queued are still handed out first.
    pub fn do_work(&mut self) -> Result<Option<CloudMessage>, TransferError> {
        match self.inbound_rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => match &*self.state_rx.borrow() {
                HubState::Failed(reason) => Err(TransferError::KernelStopped(reason.clone())),
                _ => Ok(None),
            },
            Err(TryRecvError::Disconnected) => Err(TransferError::KernelStopped(
                self.state_rx.borrow().to_string(),
            )),
        }
    }

    /// Stops the kernel and waits for it to exit.
    pub async fn destroy(self) {
        let Self {
            device_id,
            inbound_rx,
            cancel,
            kernel,
            ..
        } = self;

        drop(inbound_rx);
        cancel.cancel();
        match kernel.await {
            Ok(Ok(())) => debug!("Hub kernel for '{}' exited", device_id),
            Ok(Err(e)) => debug!("Hub kernel for '{}' had failed: {}", device_id, e),
            Err(e) => warn!("Hub kernel task for '{}' panicked: {}", device_id, e),
        }
        info!("Hub session for device '{}' destroyed", device_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::descriptor::Transport;

    // GatewayHostName points the client at a loopback port that refuses
    // connections, so tests never leave the machine.
    const CONN: &str = "HostName=hub.azure-devices.net;DeviceId=dev-01;GatewayHostName=127.0.0.1;SharedAccessKey=MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn options() -> SessionOptions {
        SessionOptions {
            transport: Transport::Mqtt,
            reconnect_delay: Duration::from_secs(30),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_do_work_without_messages_is_empty() {
        let descriptor = ConnectionDescriptor::parse(CONN).unwrap();
        let mut session = IotHubSession::create(&descriptor, &options()).unwrap();
        assert_eq!(session.device_id(), "dev-01");
        assert!(matches!(session.do_work(), Ok(None)));
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_closes_kernel() {
        let descriptor = ConnectionDescriptor::parse(CONN).unwrap();
        let session = IotHubSession::create(&descriptor, &options()).unwrap();
        let state_rx = session.subscribe_state();
        session.destroy().await;
        assert!(state_rx.borrow().is_terminal());
    }

    #[tokio::test]
    async fn test_create_with_bad_key_fails() {
        let descriptor = ConnectionDescriptor::parse(
            "HostName=h;DeviceId=d;SharedAccessKey=not*base64",
        )
        .unwrap();
        assert!(matches!(
            IotHubSession::create(&descriptor, &options()),
            Err(TransferError::Credential(_))
        ));
    }
}

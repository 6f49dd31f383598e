//! Connection kernel: the task that owns the rumqttc event loop.
//!
//! ```text
//! IotHubSession::do_work  (non-blocking, caller's task)
//!     ↑  CloudMessage (channel of depth 1)
//! ConnectionKernel::run   (own task: polls event loop, reconnects)
//!     ↓
//! rumqttc EventLoop -> TLS/WSS -> hub
//! ```
//!
//! The kernel subscribes to the inbound topic on every CONNACK, forwards each
//! inbound PUBLISH, and applies `Backoff` between failed connection attempts.
//! Fatal errors stop it and are reported through `HubState::Failed`.
//!
//! SAS tokens expire. The kernel signs a new one before every reconnect and
//! once 80% of the token lifetime has passed, so the event loop always has a
//! valid password for its next CONNECT. A credential refusal after the
//! session was accepted once is treated as transient.

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet, QoS};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    backoff::Backoff,
    error::TransferError,
    message::CloudMessage,
    sas::{token_expiry, SasCredentials},
    state::HubState,
};

pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    topic_filter: String,
    credentials: SasCredentials,
    token_issued: Instant,
    connected_once: bool,
    backoff: Backoff,
    cancel: CancellationToken,
    inbound_tx: mpsc::Sender<CloudMessage>,
    state_tx: watch::Sender<HubState>,
}

impl ConnectionKernel {
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        topic_filter: String,
        credentials: SasCredentials,
        backoff: Backoff,
        cancel: CancellationToken,
        inbound_tx: mpsc::Sender<CloudMessage>,
    ) -> Self {
        let (state_tx, _) = watch::channel(HubState::Connecting);
        Self {
            client,
            event_loop,
            topic_filter,
            credentials,
            token_issued: Instant::now(),
            connected_once: false,
            backoff,
            cancel,
            inbound_tx,
            state_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HubState> {
        self.state_tx.subscribe()
    }

    fn update_state(&self, state: HubState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            info!("Hub connection state changed to: {}", state);
        }
    }

    /// Drives the event loop until cancelled, a fatal error occurs, or the
    /// session side of the inbound channel is dropped.
    pub async fn run(mut self) -> Result<(), TransferError> {
        debug!("Starting hub connection event loop");
        self.update_state(HubState::Connecting);

        loop {
            self.refresh_if_due();

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.shutdown();
                    return Ok(());
                }
                event = self.event_loop.poll() => event,
            };

            match event {
                Ok(event) => {
                    if let Some(message) = self.handle_event(event) {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => {
                                self.shutdown();
                                return Ok(());
                            }
                            sent = self.inbound_tx.send(message) => {
                                if sent.is_err() {
                                    debug!("Inbound receiver dropped, stopping kernel");
                                    self.shutdown();
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
                Err(e) if is_fatal_error(&e, self.connected_once) => {
                    error!("Fatal hub connection error: {}", root_cause(&e));
                    self.update_state(HubState::Failed(e.to_string()));
                    return Err(e.into());
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        "Hub connection lost ({}), reconnecting in {:.1} seconds (attempt {})",
                        root_cause(&e),
                        delay.as_secs_f64(),
                        self.backoff.attempt()
                    );
                    self.update_state(HubState::Reconnecting(delay));
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            self.shutdown();
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.refresh_credentials();
                    self.update_state(HubState::Connecting);
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> Option<CloudMessage> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.connected_once = true;
                    self.backoff.reset();
                    self.update_state(HubState::Connected);
                    if let Err(e) = self.client.try_subscribe(&self.topic_filter, QoS::AtLeastOnce) {
                        warn!("Failed to request subscription to {}: {}", self.topic_filter, e);
                    } else {
                        debug!("Subscription requested: {}", self.topic_filter);
                    }
                }
                None
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!("Inbound publish on {}", publish.topic);
                Some(CloudMessage::from_publish(&publish.topic, publish.payload))
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by hub");
                None
            }
            Event::Incoming(_) => None,
            Event::Outgoing(outgoing) => {
                trace!("Outgoing packet: {:?}", outgoing);
                None
            }
        }
    }

    /// Signs a new token and installs it for the next CONNECT.
    fn refresh_credentials(&mut self) {
        match self.credentials.sign() {
            Ok(token) => {
                debug!(
                    "SAS token renewed (expires at {})",
                    token_expiry(&token).unwrap_or_default()
                );
                self.event_loop
                    .mqtt_options
                    .set_credentials(self.credentials.username(), token);
                self.token_issued = Instant::now();
            }
            Err(e) => warn!("Failed to renew SAS token: {}", e),
        }
    }

    fn refresh_if_due(&mut self) -> bool {
        if self.token_issued.elapsed() < self.credentials.refresh_after() {
            return false;
        }
        self.refresh_credentials();
        true
    }

    fn shutdown(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        self.update_state(HubState::Closed);
        info!("Hub connection kernel stopped");
    }
}

/// Errors after which reconnecting cannot succeed without reconfiguration.
///
/// Credential refusals are fatal only before the hub has ever accepted the
/// session. Afterwards they come from an expired token, which the next
/// attempt replaces.
pub(crate) fn is_fatal_error(err: &ConnectionError, connected_once: bool) -> bool {
    match err {
        ConnectionError::Tls(_) => true,
        ConnectionError::NotConnAck(_) => true,
        ConnectionError::RequestsDone => true,
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion | ConnectReturnCode::BadClientId => true,
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                !connected_once
            }
            _ => false,
        },
        ConnectionError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput
        ),
        _ => false,
    }
}

fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use rumqttc::MqttOptions;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::{descriptor::ConnectionDescriptor, sas::generate_sas_token};

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn credentials(ttl: Duration) -> SasCredentials {
        let descriptor = ConnectionDescriptor::parse(&format!(
            "HostName=hub.azure-devices.net;DeviceId=dev-01;SharedAccessKey={KEY}"
        ))
        .unwrap();
        SasCredentials::from_descriptor(&descriptor, ttl)
    }

    fn kernel_at(
        port: u16,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> (ConnectionKernel, mpsc::Receiver<CloudMessage>) {
        let credentials = credentials(Duration::from_secs(3600));
        let mut opts = MqttOptions::new("dev-01", "127.0.0.1", port);
        // Signed for 1970: already expired when the first CONNECT is sent.
        let stale = generate_sas_token("hub.azure-devices.net/devices/dev-01", KEY, None, 1).unwrap();
        opts.set_credentials(credentials.username(), stale);
        let (client, event_loop) = AsyncClient::new(opts, 10);
        let (tx, rx) = mpsc::channel(1);
        let kernel = ConnectionKernel::new(
            client,
            event_loop,
            "devices/dev-01/messages/devicebound/#".into(),
            credentials,
            backoff,
            cancel,
            tx,
        );
        (kernel, rx)
    }

    fn kernel(cancel: CancellationToken) -> (ConnectionKernel, mpsc::Receiver<CloudMessage>) {
        // Port 1 on loopback refuses connections immediately.
        kernel_at(
            1,
            Backoff::new(Duration::from_secs(30), Duration::from_secs(60), 2.0),
            cancel,
        )
    }

    async fn read_packet(sock: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
        let mut byte = [0u8; 1];
        sock.read_exact(&mut byte).await?;
        let header = byte[0];
        let (mut len, mut shift) = (0usize, 0);
        loop {
            sock.read_exact(&mut byte).await?;
            len |= usize::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        sock.read_exact(&mut body).await?;
        Ok((header, body))
    }

    fn take_field(body: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
        let len = usize::from(u16::from_be_bytes([*body.get(*pos)?, *body.get(*pos + 1)?]));
        let start = *pos + 2;
        let field = body.get(start..start + len)?.to_vec();
        *pos = start + len;
        Some(field)
    }

    /// Password of an MQTT 3.1.1 CONNECT body.
    fn connect_password(body: &[u8]) -> Option<String> {
        let mut pos = 0;
        take_field(body, &mut pos)?;
        let flags = *body.get(pos + 1)?;
        pos += 4;
        take_field(body, &mut pos)?;
        if flags & 0x04 != 0 {
            take_field(body, &mut pos)?;
            take_field(body, &mut pos)?;
        }
        if flags & 0x80 != 0 {
            take_field(body, &mut pos)?;
        }
        if flags & 0x40 == 0 {
            return None;
        }
        String::from_utf8(take_field(body, &mut pos)?).ok()
    }

    #[test]
    fn test_fatal_error_classification() {
        let refused = ConnectionError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(!is_fatal_error(&refused, false));
        assert!(!is_fatal_error(&ConnectionError::NetworkTimeout, false));
        assert!(!is_fatal_error(
            &ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable),
            false
        ));
        assert!(is_fatal_error(&ConnectionError::RequestsDone, true));
    }

    #[test]
    fn test_credential_refusal_fatal_only_before_first_connack() {
        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert!(is_fatal_error(&refused, false));
        assert!(!is_fatal_error(&refused, true));
        let bad_id = ConnectionError::ConnectionRefused(ConnectReturnCode::BadClientId);
        assert!(is_fatal_error(&bad_id, true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refreshed_after_most_of_its_lifetime() {
        let (mut kernel, _rx) = kernel(CancellationToken::new());
        kernel.credentials = credentials(Duration::from_secs(10));
        kernel.token_issued = Instant::now();

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(!kernel.refresh_if_due());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(kernel.refresh_if_due());
        let (_, password) = kernel.event_loop.mqtt_options.credentials().unwrap();
        assert!(token_expiry(&password).unwrap() > 1);
        // Renewal restarts the clock.
        assert!(!kernel.refresh_if_due());
    }

    #[tokio::test]
    async fn test_cancelled_kernel_stops_cleanly() {
        let cancel = CancellationToken::new();
        let (kernel, _rx) = kernel(cancel.clone());
        let state_rx = kernel.subscribe_state();
        cancel.cancel();

        assert!(kernel.run().await.is_ok());
        assert_eq!(*state_rx.borrow(), HubState::Closed);
    }

    #[tokio::test]
    async fn test_refused_connection_enters_backoff() {
        let cancel = CancellationToken::new();
        let (kernel, _rx) = kernel(cancel.clone());
        let mut state_rx = kernel.subscribe_state();
        let handle = tokio::spawn(kernel.run());

        let reached = tokio::time::timeout(
            Duration::from_secs(5),
            state_rx.wait_for(|s| matches!(s, HubState::Reconnecting(_))),
        )
        .await;
        assert!(reached.is_ok(), "kernel should back off after a refused connection");
        // Release the watch read guard before the kernel publishes its final state.
        drop(reached);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_reconnects_with_fresh_token_after_expiry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Accept, then drop the link; refuse the expired token; accept again.
        let broker = tokio::spawn(async move {
            let mut passwords = Vec::new();
            for (round, code) in [0u8, 5, 0].into_iter().enumerate() {
                let (mut sock, _) = listener.accept().await.unwrap();
                let (header, body) = read_packet(&mut sock).await.unwrap();
                assert_eq!(header >> 4, 1, "expected CONNECT");
                passwords.push(connect_password(&body).unwrap());
                sock.write_all(&[0x20, 0x02, 0x00, code]).await.unwrap();
                if round == 0 {
                    let (header, _) = read_packet(&mut sock).await.unwrap();
                    assert_eq!(header >> 4, 8, "expected SUBSCRIBE");
                }
            }
            passwords
        });

        let cancel = CancellationToken::new();
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50), 2.0);
        let (kernel, _rx) = kernel_at(port, backoff, cancel.clone());
        let state_rx = kernel.subscribe_state();
        let handle = tokio::spawn(kernel.run());

        let passwords = tokio::time::timeout(Duration::from_secs(10), broker)
            .await
            .expect("kernel should reconnect three times")
            .unwrap();
        assert!(!matches!(*state_rx.borrow(), HubState::Failed(_)));

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(token_expiry(&passwords[0]), Some(1));
        for password in &passwords[1..] {
            assert!(token_expiry(password).unwrap() + 60 > now + 3600);
        }

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}

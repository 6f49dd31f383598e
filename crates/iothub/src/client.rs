//! MQTT client construction for a hub device session.
//!
//! `ClientBuilder` maps a `ConnectionDescriptor` and `SessionOptions` onto
//! rumqttc's `MqttOptions`:
//!
//! - client id: the device id
//! - username: `{host}/{device}/?api-version=...`
//! - password: a SAS token valid for `sas_token_ttl`, re-signed by the
//!   kernel before each reconnect (see [`ClientBuilder::credentials`])
//! - transport: TLS (8883) or secure WebSockets (443), with the configured
//!   CA bundle or the system roots
//!
//! ```ignore
//! let descriptor = ConnectionDescriptor::parse(conn_str)?;
//! let (client, event_loop) = ClientBuilder::from_descriptor(&descriptor, &options)?.build()?;
//! ```

use std::{fs, path::PathBuf, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport as MqttTransport};
use tracing::debug;

use super::{
    descriptor::{ConnectionDescriptor, Transport},
    error::TransferError,
    sas::SasCredentials,
};

/// Tunables of a hub session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub transport: Transport,
    pub keep_alive: Duration,
    /// Lifetime of the SAS token presented at connect time.
    pub sas_token_ttl: Duration,
    /// PEM bundle used to verify the hub. System roots when `None`.
    pub ca_cert_path: Option<PathBuf>,
    /// Capacity of the rumqttc request channel.
    pub request_channel_capacity: usize,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            transport: Transport::Mqtt,
            keep_alive: Duration::from_secs(240),
            sas_token_ttl: Duration::from_secs(3600),
            ca_cert_path: None,
            request_channel_capacity: 10,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

pub struct ClientBuilder {
    opts: MqttOptions,
    credentials: SasCredentials,
    transport: Transport,
    ca_cert_path: Option<PathBuf>,
    cap: usize,
}

impl ClientBuilder {
    /// Prepares MQTT options for the device described by `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::Credential` if the SAS token cannot be signed.
    pub fn from_descriptor(
        descriptor: &ConnectionDescriptor,
        options: &SessionOptions,
    ) -> Result<Self, TransferError> {
        let credentials = SasCredentials::from_descriptor(descriptor, options.sas_token_ttl);
        let token = credentials.sign()?;

        let broker = match options.transport {
            Transport::Mqtt => descriptor.connect_host().to_string(),
            Transport::MqttWebSockets => format!(
                "wss://{}:{}/$iothub/websocket",
                descriptor.connect_host(),
                options.transport.port()
            ),
        };

        let mut opts = MqttOptions::new(descriptor.device_id(), broker, options.transport.port());
        opts.set_keep_alive(options.keep_alive);
        // The hub keeps cloud-to-device messages queued for persistent sessions.
        opts.set_clean_session(false);
        opts.set_credentials(credentials.username(), token);

        debug!(
            "Prepared {} session options for device '{}' at {}",
            options.transport,
            descriptor.device_id(),
            descriptor.connect_host()
        );

        Ok(Self {
            opts,
            credentials,
            transport: options.transport,
            ca_cert_path: options.ca_cert_path.clone(),
            cap: options.request_channel_capacity.max(1),
        })
    }

    pub fn options(&self) -> &MqttOptions {
        &self.opts
    }

    /// Signer for the tokens of later connection attempts.
    pub fn credentials(&self) -> &SasCredentials {
        &self.credentials
    }

    /// Loads TLS material and constructs the client and its event loop.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::Io` if the CA bundle cannot be read.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let tls = match &self.ca_cert_path {
            Some(path) => Some(TlsConfiguration::Simple {
                ca: fs::read(path)?,
                alpn: None,
                client_auth: None,
            }),
            None => None,
        };

        let transport = match (self.transport, tls) {
            (Transport::Mqtt, Some(tls)) => MqttTransport::Tls(tls),
            (Transport::Mqtt, None) => MqttTransport::tls_with_default_config(),
            (Transport::MqttWebSockets, Some(tls)) => MqttTransport::Wss(tls),
            (Transport::MqttWebSockets, None) => MqttTransport::wss_with_default_config(),
        };

        let mut opts = self.opts;
        opts.set_transport(transport);
        Ok(AsyncClient::new(opts, self.cap))
    }
}

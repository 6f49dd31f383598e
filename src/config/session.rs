//! Cloud session configuration.
//!
//! Durations are plain integers in the TOML file: `pump_interval_ms` is in
//! milliseconds, everything else in seconds.

use std::{fmt, path::PathBuf, time::Duration};

use cloudlink_iothub::{ConnectionDescriptor, DescriptorError, SessionOptions, Transport};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::dispatcher::DispositionPolicy;

#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_reconnect_window"))]
pub struct SessionConfig {
    /// `HostName=...;DeviceId=...;SharedAccessKey=...`
    #[validate(custom(function = "validate_connection_string"))]
    pub connection_string: String,

    pub transport: Transport,

    /// Yield between two work pumps.
    #[validate(range(min = 1, max = 1000))]
    pub pump_interval_ms: u64,

    #[validate(range(min = 5, max = 3600))]
    pub keep_alive: u64,

    #[validate(range(min = 60, max = 31_536_000))]
    pub sas_token_ttl: u64,

    pub ca_cert_path: Option<PathBuf>,

    pub disposition_policy: DispositionPolicy,

    #[validate(range(min = 1, max = 3600))]
    pub reconnect_delay: u64,

    #[validate(range(min = 1, max = 3600))]
    pub max_reconnect_delay: u64,
}

fn validate_connection_string(value: &str) -> Result<(), ValidationError> {
    ConnectionDescriptor::parse(value).map(|_| ()).map_err(|e| {
        let mut err = ValidationError::new("invalid_connection_string");
        err.message = Some(e.to_string().into());
        err
    })
}

fn validate_reconnect_window(config: &SessionConfig) -> Result<(), ValidationError> {
    if config.reconnect_delay > config.max_reconnect_delay {
        let mut err = ValidationError::new("invalid_reconnect_window");
        err.message = Some(
            format!(
                "reconnect_delay ({}s) exceeds max_reconnect_delay ({}s)",
                config.reconnect_delay, config.max_reconnect_delay
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

impl Default for SessionConfig {
    fn default() -> Self {
        let options = SessionOptions::default();
        SessionConfig {
            connection_string: String::new(),
            transport: options.transport,
            pump_interval_ms: 10,
            keep_alive: options.keep_alive.as_secs(),
            sas_token_ttl: options.sas_token_ttl.as_secs(),
            ca_cert_path: None,
            disposition_policy: DispositionPolicy::default(),
            reconnect_delay: options.reconnect_delay.as_secs(),
            max_reconnect_delay: options.max_reconnect_delay.as_secs(),
        }
    }
}

impl SessionConfig {
    pub fn descriptor(&self) -> Result<ConnectionDescriptor, DescriptorError> {
        ConnectionDescriptor::parse(&self.connection_string)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            transport: self.transport,
            keep_alive: Duration::from_secs(self.keep_alive),
            sas_token_ttl: Duration::from_secs(self.sas_token_ttl),
            ca_cert_path: self.ca_cert_path.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
            max_reconnect_delay: Duration::from_secs(self.max_reconnect_delay),
            ..SessionOptions::default()
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("connection_string", &self.descriptor().ok())
            .field("transport", &self.transport)
            .field("pump_interval_ms", &self.pump_interval_ms)
            .field("keep_alive", &self.keep_alive)
            .field("sas_token_ttl", &self.sas_token_ttl)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("disposition_policy", &self.disposition_policy)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: &str = "HostName=hub.azure-devices.net;DeviceId=dev-01;SharedAccessKey=c2VjcmV0a2V5PT0=";

    fn config() -> SessionConfig {
        SessionConfig {
            connection_string: CONN.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_valid_with_connection_string() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.pump_interval(), Duration::from_millis(10));
        assert_eq!(config.disposition_policy, DispositionPolicy::AlwaysAccept);
    }

    #[test]
    fn test_empty_connection_string_rejected() {
        assert!(SessionConfig::default().validate().is_err());
    }

    #[test]
    fn test_pump_interval_bounds() {
        let mut config = config();
        config.pump_interval_ms = 0;
        assert!(config.validate().is_err());
        config.pump_interval_ms = 1001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_window_ordering() {
        let mut config = config();
        config.reconnect_delay = 60;
        config.max_reconnect_delay = 60;
        assert!(config.validate().is_ok());

        config.reconnect_delay = 120;
        let err = config.validate().unwrap_err();
        let errors = err.field_errors();
        assert_eq!(errors["__all__"][0].code, "invalid_reconnect_window");
    }

    #[test]
    fn test_session_options_mapping() {
        let mut config = config();
        config.transport = Transport::MqttWebSockets;
        config.keep_alive = 30;
        config.reconnect_delay = 2;
        let options = config.session_options();
        assert_eq!(options.transport, Transport::MqttWebSockets);
        assert_eq!(options.keep_alive, Duration::from_secs(30));
        assert_eq!(options.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.descriptor().unwrap().device_id(), "dev-01");
    }

    #[test]
    fn test_debug_hides_key() {
        let out = format!("{:?}", config());
        assert!(out.contains("dev-01"));
        assert!(!out.contains("c2VjcmV0a2V5PT0="));
    }
}

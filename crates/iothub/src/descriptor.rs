//! Connection descriptors and transport selection.
//!
//! A device is addressed by an IoT-hub style connection string:
//!
//! ```text
//! HostName=myhub.azure-devices.net;DeviceId=sensor-01;SharedAccessKey=<base64>
//! ```
//!
//! `ConnectionDescriptor::parse` turns it into a typed value. The shared
//! access key is never printed by `Debug`.

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API version advertised in the MQTT username.
pub const API_VERSION: &str = "2021-04-12";

const HOST_NAME: &str = "HostName";
const DEVICE_ID: &str = "DeviceId";
const SHARED_ACCESS_KEY: &str = "SharedAccessKey";
const SHARED_ACCESS_KEY_NAME: &str = "SharedAccessKeyName";
const GATEWAY_HOST_NAME: &str = "GatewayHostName";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// A `;`-separated segment had no `=`.
    #[error("Malformed connection string segment: '{0}'")]
    MalformedSegment(String),

    #[error("Connection string is missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("Connection string key '{0}' has an empty value")]
    EmptyValue(String),
}

/// Wire transport used to reach the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Transport {
    /// MQTT over TLS on port 8883.
    #[default]
    #[serde(rename = "mqtt")]
    Mqtt,
    /// MQTT over secure WebSockets on port 443.
    #[serde(rename = "mqtt_ws")]
    MqttWebSockets,
}

impl Transport {
    pub fn port(&self) -> u16 {
        match self {
            Transport::Mqtt => 8883,
            Transport::MqttWebSockets => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Mqtt => "mqtt",
            Transport::MqttWebSockets => "mqtt_ws",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint, device identity and credential of one device session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    host_name: String,
    device_id: String,
    shared_access_key: String,
    shared_access_key_name: Option<String>,
    gateway_host_name: Option<String>,
}

impl ConnectionDescriptor {
    /// Parses a connection string.
    ///
    /// Segments are separated by `;` and split on the first `=`, so base64
    /// padding inside the key is preserved. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns `DescriptorError` if a segment has no `=`, a value is empty, or
    /// one of `HostName`, `DeviceId`, `SharedAccessKey` is missing.
    pub fn parse(connection_string: &str) -> Result<Self, DescriptorError> {
        let mut fields: HashMap<&str, &str> = HashMap::new();

        for segment in connection_string
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| DescriptorError::MalformedSegment(segment.to_string()))?;
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                return Err(DescriptorError::EmptyValue(key.to_string()));
            }
            fields.insert(key, value);
        }

        let required = |key: &'static str| {
            fields
                .get(key)
                .map(|v| v.to_string())
                .ok_or(DescriptorError::MissingKey(key))
        };

        Ok(Self {
            host_name: required(HOST_NAME)?,
            device_id: required(DEVICE_ID)?,
            shared_access_key: required(SHARED_ACCESS_KEY)?,
            shared_access_key_name: fields.get(SHARED_ACCESS_KEY_NAME).map(|v| v.to_string()),
            gateway_host_name: fields.get(GATEWAY_HOST_NAME).map(|v| v.to_string()),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn shared_access_key(&self) -> &str {
        &self.shared_access_key
    }

    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.shared_access_key_name.as_deref()
    }

    /// Host the socket connects to: the gateway if one is configured, the hub otherwise.
    pub fn connect_host(&self) -> &str {
        self.gateway_host_name.as_deref().unwrap_or(&self.host_name)
    }

    /// Resource the SAS token is scoped to.
    pub fn resource_uri(&self) -> String {
        format!("{}/devices/{}", self.host_name, self.device_id)
    }

    /// MQTT username expected by the hub.
    pub fn username(&self) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.host_name, self.device_id, API_VERSION
        )
    }

    /// Topic filter covering every cloud-to-device message for this device.
    pub fn inbound_topic_filter(&self) -> String {
        format!("devices/{}/messages/devicebound/#", self.device_id)
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("shared_access_key", &"<redacted>")
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("gateway_host_name", &self.gateway_host_name)
            .finish()
    }
}

//! Shared access signature tokens.
//!
//! The hub authenticates devices with a token derived from the device's
//! shared access key:
//!
//! ```text
//! SharedAccessSignature sr={uri}&sig={signature}&se={expiry}[&skn={key_name}]
//! signature = base64(HMAC-SHA256(base64decode(key), "{uri}\n{expiry}"))
//! ```
//!
//! `uri` and `signature` are form-url-encoded.
//!
//! A token is only checked when a connection is established, so
//! [`SasCredentials`] re-signs one for every connection attempt.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;

use super::{descriptor::ConnectionDescriptor, error::TransferError};

type HmacSha256 = Hmac<Sha256>;

/// Builds a SAS token for `resource_uri` valid until `expiry` (unix seconds).
///
/// # Errors
///
/// Returns `TransferError::Credential` if `key_b64` is not valid base64.
pub fn generate_sas_token(
    resource_uri: &str,
    key_b64: &str,
    key_name: Option<&str>,
    expiry: u64,
) -> Result<String, TransferError> {
    let key = STANDARD
        .decode(key_b64)
        .map_err(|e| TransferError::Credential(format!("shared access key is not base64: {e}")))?;

    let encoded_uri = encode(resource_uri);
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| TransferError::Credential(e.to_string()))?;
    mac.update(format!("{encoded_uri}\n{expiry}").as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_uri,
        encode(&signature),
        expiry
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&encode(name));
    }
    Ok(token)
}

/// Unix timestamp `ttl` from now.
pub fn expiry_from_now(ttl: Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .saturating_add(ttl)
        .as_secs()
}

/// Reads the `se` field of a token.
pub fn token_expiry(token: &str) -> Option<u64> {
    token
        .split(['&', ' '])
        .find_map(|field| field.strip_prefix("se="))
        .and_then(|se| se.parse().ok())
}

/// Everything needed to sign fresh tokens for one device.
#[derive(Clone)]
pub struct SasCredentials {
    resource_uri: String,
    key: String,
    key_name: Option<String>,
    username: String,
    ttl: Duration,
}

impl SasCredentials {
    pub fn from_descriptor(descriptor: &ConnectionDescriptor, ttl: Duration) -> Self {
        Self {
            resource_uri: descriptor.resource_uri(),
            key: descriptor.shared_access_key().to_string(),
            key_name: descriptor.shared_access_key_name().map(str::to_string),
            username: descriptor.username(),
            ttl,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Signs a token valid for `ttl` from now.
    pub fn sign(&self) -> Result<String, TransferError> {
        generate_sas_token(
            &self.resource_uri,
            &self.key,
            self.key_name.as_deref(),
            expiry_from_now(self.ttl),
        )
    }

    /// Age after which a signed token should be replaced: 80% of its lifetime.
    pub fn refresh_after(&self) -> Duration {
        self.ttl.mul_f64(0.8)
    }
}

impl std::fmt::Debug for SasCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasCredentials")
            .field("resource_uri", &self.resource_uri)
            .field("key", &"<redacted>")
            .field("key_name", &self.key_name)
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // base64("0123456789abcdef0123456789abcdef")
    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    #[test]
    fn test_token_known_answer() {
        let token =
            generate_sas_token("hub.azure-devices.net/devices/dev-01", KEY, None, 1_700_000_000)
                .unwrap();
        assert_eq!(
            token,
            "SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fdev-01\
             &sig=b77e816MEKqgvdOESwDHRAjdEFvJNUohGbz9bnpPjew%3D&se=1700000000"
        );
    }

    #[test]
    fn test_token_with_key_name() {
        let token = generate_sas_token("h/devices/d", KEY, Some("device"), 42).unwrap();
        assert!(token.ends_with("&se=42&skn=device"));
    }

    #[test]
    fn test_invalid_key_is_credential_error() {
        let err = generate_sas_token("h/devices/d", "not base64!!", None, 1).unwrap_err();
        assert!(matches!(err, TransferError::Credential(_)));
    }

    #[test]
    fn test_expiry_is_in_the_future() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let expiry = expiry_from_now(Duration::from_secs(3600));
        assert!(expiry >= now + 3600);
    }

    #[test]
    fn test_token_expiry_field() {
        let token = generate_sas_token("h/devices/d", KEY, Some("device"), 42).unwrap();
        assert_eq!(token_expiry(&token), Some(42));
        assert_eq!(token_expiry("SharedAccessSignature sr=x&sig=y"), None);
    }

    #[test]
    fn test_credentials_sign_fresh_tokens() {
        let descriptor = ConnectionDescriptor::parse(&format!(
            "HostName=hub.azure-devices.net;DeviceId=dev-01;SharedAccessKey={KEY}"
        ))
        .unwrap();
        let credentials = SasCredentials::from_descriptor(&descriptor, Duration::from_secs(600));
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let token = credentials.sign().unwrap();
        assert!(token_expiry(&token).unwrap() >= now + 600);
        assert_eq!(
            credentials.username(),
            "hub.azure-devices.net/dev-01/?api-version=2021-04-12"
        );
        assert_eq!(credentials.refresh_after(), Duration::from_secs(480));
        assert!(!format!("{credentials:?}").contains(KEY));
    }
}

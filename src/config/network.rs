//! Station link configuration.

use std::fmt;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network name to associate with.
    #[validate(length(min = 1, max = 32))]
    pub ssid: String,

    /// WPA passphrase. Empty for open networks.
    #[validate(length(max = 64))]
    pub passphrase: String,
}

impl fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkConfig")
            .field("ssid", &self.ssid)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

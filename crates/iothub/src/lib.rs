//! Device-side session with an IoT hub over MQTT.
//!
//! A session is described by a connection string
//! (`HostName=...;DeviceId=...;SharedAccessKey=...`), authenticates with a
//! SAS token and receives cloud-to-device messages. The connection itself is
//! driven by a background kernel task; callers pump messages out with the
//! non-blocking [`IotHubSession::do_work`].

pub mod backoff;
pub mod client;
pub mod descriptor;
pub mod error;
pub mod kernel;
pub mod message;
pub mod sas;
pub mod session;
pub mod state;

pub use client::SessionOptions;
pub use descriptor::{ConnectionDescriptor, DescriptorError, Transport};
pub use error::TransferError;
pub use message::CloudMessage;
pub use session::IotHubSession;
pub use state::HubState;

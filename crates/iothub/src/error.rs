//! Error type shared by every operation of the hub session.
//!
//! Errors fall into two groups:
//!
//! **Setup errors** (surface from `IotHubSession::create`):
//! - `Descriptor`: the connection string is unusable
//! - `Credential`: the shared access key cannot sign a token
//! - `ClientSetup`: TLS material or transport options are invalid
//! - `Io`: certificate files could not be read
//!
//! **Runtime errors** (surface from `IotHubSession::do_work`):
//! - `ClientTransfer`: the request channel to the event loop is closed
//! - `ClientConnection`: a connection failure the kernel classified as fatal
//! - `KernelStopped`: the connection kernel exited and nothing will be delivered anymore

use thiserror::Error;

use super::descriptor::DescriptorError;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Connection string parsing failed.
    #[error("Invalid connection descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    /// SAS token generation failed, usually because the key is not valid base64.
    #[error("Credential error: {0}")]
    Credential(String),

    /// MQTT client initialization failed.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// The local client could not queue a request for the event loop.
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Unrecoverable connection failure (rejected credentials, TLS failure, ...).
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// The connection kernel is no longer running.
    #[error("Connection kernel stopped: {0}")]
    KernelStopped(String),

    /// File I/O error (certificate loading).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_error_display() {
        let err = TransferError::Credential("bad key".into());
        assert_eq!(err.to_string(), "Credential error: bad key");
    }

    #[test]
    fn test_from_descriptor_error() {
        let err: TransferError = DescriptorError::MissingKey("DeviceId").into();
        assert!(err.to_string().contains("DeviceId"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "ca.pem missing");
        let err: TransferError = io_err.into();
        assert!(matches!(err, TransferError::Io(_)));
        assert!(err.to_string().contains("ca.pem missing"));
    }

    #[test]
    fn test_connection_error_is_boxed() {
        let err: TransferError = rumqttc::ConnectionError::NetworkTimeout.into();
        assert!(matches!(err, TransferError::ClientConnection(_)));
    }
}

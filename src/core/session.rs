//! Session library seam.
//!
//! The worker sees the cloud messaging library only through
//! [`SessionLibrary`] and [`Session`]. [`IotHubLibrary`] is the production
//! implementation on top of `cloudlink_iothub`.

use std::sync::Arc;

use async_trait::async_trait;
use cloudlink_iothub::{
    CloudMessage, ConnectionDescriptor, IotHubSession, SessionOptions, TransferError, Transport,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::dispatcher::{ContentKind, DeliveryDisposition, InboundMessage};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session library initialization failed: {0}")]
    Init(String),

    #[error("Failed to create session: {0}")]
    Create(#[source] TransferError),

    #[error("Failed to register message callback: {0}")]
    Register(String),

    #[error("Work pump failed: {0}")]
    Pump(#[source] TransferError),
}

/// Receives each inbound message synchronously from within `Session::pump`.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, msg: &InboundMessage) -> DeliveryDisposition;
}

/// An open cloud messaging session.
#[async_trait]
pub trait Session: Send {
    fn register_message_callback(
        &mut self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SessionError>;

    /// Advances the session without blocking and dispatches every message
    /// that has arrived. Returns the number of messages dispatched.
    async fn pump(&mut self) -> Result<usize, SessionError>;

    async fn destroy(&mut self);
}

pub trait SessionLibrary: Send + Sync {
    fn init(&self) -> Result<(), SessionError>;

    fn create(
        &self,
        descriptor: &ConnectionDescriptor,
        transport: Transport,
    ) -> Result<Box<dyn Session>, SessionError>;

    fn deinit(&self);
}

/// `SessionLibrary` backed by an MQTT device session.
pub struct IotHubLibrary {
    options: SessionOptions,
}

impl IotHubLibrary {
    pub fn new(options: SessionOptions) -> Self {
        Self { options }
    }
}

impl SessionLibrary for IotHubLibrary {
    fn init(&self) -> Result<(), SessionError> {
        debug!("IoT hub session library ready");
        Ok(())
    }

    fn create(
        &self,
        descriptor: &ConnectionDescriptor,
        transport: Transport,
    ) -> Result<Box<dyn Session>, SessionError> {
        let options = SessionOptions {
            transport,
            ..self.options.clone()
        };
        let session = IotHubSession::create(descriptor, &options).map_err(SessionError::Create)?;
        Ok(Box::new(IotHubSessionHandle {
            session: Some(session),
            handler: None,
        }))
    }

    fn deinit(&self) {
        debug!("IoT hub session library released");
    }
}

struct IotHubSessionHandle {
    session: Option<IotHubSession>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl From<CloudMessage> for InboundMessage {
    fn from(msg: CloudMessage) -> Self {
        let content = if msg.is_text() {
            ContentKind::Text
        } else {
            ContentKind::Binary
        };
        InboundMessage {
            message_id: msg.message_id,
            correlation_id: msg.correlation_id,
            content,
            payload: Some(msg.payload),
        }
    }
}

#[async_trait]
impl Session for IotHubSessionHandle {
    fn register_message_callback(
        &mut self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SessionError> {
        if self.session.is_none() {
            return Err(SessionError::Register("session already destroyed".into()));
        }
        self.handler = Some(handler);
        Ok(())
    }

    async fn pump(&mut self) -> Result<usize, SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };

        let mut dispatched = 0;
        while let Some(msg) = session.do_work().map_err(SessionError::Pump)? {
            let msg = InboundMessage::from(msg);
            match &self.handler {
                Some(handler) => {
                    let disposition = handler.on_message(&msg);
                    // MQTT has no negative acknowledgement; the PUBACK is sent
                    // by the client either way.
                    debug!("Message disposition: {:?}", disposition);
                    dispatched += 1;
                }
                None => warn!("Message arrived without a registered callback, dropping it"),
            }
        }
        Ok(dispatched)
    }

    async fn destroy(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Destroying cloud session (hub state: {})", session.state());
            session.destroy().await;
            info!("Cloud session destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    const CONN: &str = "HostName=hub.azure-devices.net;DeviceId=dev-01;GatewayHostName=127.0.0.1;SharedAccessKey=MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    struct Accepting;

    impl MessageHandler for Accepting {
        fn on_message(&self, _msg: &InboundMessage) -> DeliveryDisposition {
            DeliveryDisposition::Accepted
        }
    }

    #[test]
    fn test_cloud_message_conversion() {
        let msg = CloudMessage::from_publish(
            "devices/d/messages/devicebound/%24.mid=9&%24.ct=application%2Fjson",
            Bytes::from_static(b"{}"),
        );
        let inbound = InboundMessage::from(msg);
        assert_eq!(inbound.message_id.as_deref(), Some("9"));
        assert_eq!(inbound.correlation_id, None);
        assert_eq!(inbound.content, ContentKind::Text);

        let raw = CloudMessage::from_publish("devices/d/messages/devicebound/", Bytes::new());
        assert_eq!(InboundMessage::from(raw).content, ContentKind::Binary);
    }

    #[tokio::test]
    async fn test_iothub_session_lifecycle() {
        let library = IotHubLibrary::new(SessionOptions {
            reconnect_delay: std::time::Duration::from_secs(30),
            ..Default::default()
        });
        library.init().unwrap();
        let descriptor = ConnectionDescriptor::parse(CONN).unwrap();
        let mut session = library.create(&descriptor, Transport::Mqtt).unwrap();
        session
            .register_message_callback(Arc::new(Accepting))
            .unwrap();
        assert_eq!(session.pump().await.unwrap(), 0);

        session.destroy().await;
        assert!(session
            .register_message_callback(Arc::new(Accepting))
            .is_err());
        assert_eq!(session.pump().await.unwrap(), 0);
        library.deinit();
    }

    #[tokio::test]
    async fn test_create_rejects_bad_key() {
        let library = IotHubLibrary::new(SessionOptions::default());
        let descriptor =
            ConnectionDescriptor::parse("HostName=h;DeviceId=d;SharedAccessKey=%%").unwrap();
        assert!(matches!(
            library.create(&descriptor, Transport::Mqtt),
            Err(SessionError::Create(_))
        ));
    }
}

//! Inbound message dispatch.
//!
//! The dispatcher resolves missing identifiers to [`UNAVAILABLE`], renders the
//! payload according to its content kind, hands the result to a
//! [`MessageSink`] and returns a [`DeliveryDisposition`]. Extraction failures
//! are logged and never surface as errors.

use std::{
    fmt,
    str::Utf8Error,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use super::session::MessageHandler;

/// Placeholder for an absent message or correlation id.
pub const UNAVAILABLE: &str = "<unavailable>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Binary,
    Text,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Binary => f.write_str("byte array"),
            ContentKind::Text => f.write_str("string"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDisposition {
    Accepted,
    Rejected,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content: ContentKind,
    /// `None` when the session could not hand over a payload.
    pub payload: Option<Bytes>,
}

impl InboundMessage {
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: None,
            correlation_id: None,
            content: ContentKind::Binary,
            payload: Some(payload.into()),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            content: ContentKind::Text,
            ..Self::binary(payload)
        }
    }

    pub fn with_ids(
        mut self,
        message_id: Option<impl Into<String>>,
        correlation_id: Option<impl Into<String>>,
    ) -> Self {
        self.message_id = message_id.map(Into::into);
        self.correlation_id = correlation_id.map(Into::into);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("message has no payload")]
    MissingPayload,

    #[error("text payload is not valid UTF-8: {0}")]
    InvalidText(#[from] Utf8Error),
}

/// Display form of one message, as handed to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub kind: ContentKind,
    pub message_id: String,
    pub correlation_id: String,
    pub data: Bytes,
}

impl RenderedMessage {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Display for RenderedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ContentKind::Binary => write!(
                f,
                "Received Binary message\nMessage ID: {}\n Correlation ID: {}\n Data: <<<{}>>> & Size={}",
                self.message_id,
                self.correlation_id,
                String::from_utf8_lossy(&self.data),
                self.size()
            ),
            ContentKind::Text => write!(
                f,
                "Received String Message\nMessage ID: {}\n Correlation ID: {}\n Data: <<<{}>>>",
                self.message_id,
                self.correlation_id,
                String::from_utf8_lossy(&self.data)
            ),
        }
    }
}

/// Extracts the payload of `msg` in the form its content kind calls for.
///
/// # Errors
///
/// `MissingPayload` when there is no payload, `InvalidText` when a text
/// message is not UTF-8.
pub fn render(msg: &InboundMessage) -> Result<RenderedMessage, ExtractionError> {
    let data = msg.payload.clone().ok_or(ExtractionError::MissingPayload)?;
    if msg.content == ContentKind::Text {
        std::str::from_utf8(&data)?;
    }
    Ok(RenderedMessage {
        kind: msg.content,
        message_id: msg.message_id.as_deref().unwrap_or(UNAVAILABLE).to_string(),
        correlation_id: msg
            .correlation_id
            .as_deref()
            .unwrap_or(UNAVAILABLE)
            .to_string(),
        data,
    })
}

/// Destination of rendered messages.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: &RenderedMessage);
}

/// Writes each message as an `info` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn deliver(&self, message: &RenderedMessage) {
        info!("{}", message);
    }
}

/// What to report upstream for a message whose payload could not be extracted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionPolicy {
    /// Report `Accepted` no matter what.
    #[default]
    AlwaysAccept,
    /// Report `Rejected` when extraction fails.
    RejectOnExtractionFailure,
}

pub struct MessageDispatcher {
    policy: DispositionPolicy,
    sink: Arc<dyn MessageSink>,
    counter: Option<Arc<AtomicUsize>>,
}

impl MessageDispatcher {
    pub fn new(policy: DispositionPolicy, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            policy,
            sink,
            counter: None,
        }
    }

    /// Attaches an advisory counter, incremented once per message seen.
    pub fn with_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn policy(&self) -> DispositionPolicy {
        self.policy
    }

    pub fn on_message(&self, msg: &InboundMessage) -> DeliveryDisposition {
        if let Some(counter) = &self.counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        match render(msg) {
            Ok(rendered) => {
                self.sink.deliver(&rendered);
                DeliveryDisposition::Accepted
            }
            Err(e) => {
                error!("Failure retrieving {} message: {}", msg.content, e);
                match self.policy {
                    DispositionPolicy::AlwaysAccept => DeliveryDisposition::Accepted,
                    DispositionPolicy::RejectOnExtractionFailure => DeliveryDisposition::Rejected,
                }
            }
        }
    }
}

impl MessageHandler for MessageDispatcher {
    fn on_message(&self, msg: &InboundMessage) -> DeliveryDisposition {
        MessageDispatcher::on_message(self, msg)
    }
}

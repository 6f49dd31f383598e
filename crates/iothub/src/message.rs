//! Cloud-to-device messages.
//!
//! The hub delivers a message as a PUBLISH on
//! `devices/{device_id}/messages/devicebound/{property_bag}`, where the
//! property bag is form-url-encoded. System properties use the `$.` prefix:
//!
//! | key    | meaning          |
//! |--------|------------------|
//! | `$.mid` | message id      |
//! | `$.cid` | correlation id  |
//! | `$.ct`  | content type    |
//!
//! Everything without the prefix is an application property.

use bytes::Bytes;
use url::form_urlencoded;

const DEVICEBOUND_SEGMENT: &str = "/messages/devicebound/";

/// A message received from the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMessage {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub properties: Vec<(String, String)>,
    pub payload: Bytes,
}

impl CloudMessage {
    /// Extracts metadata from the publish topic and takes ownership of the payload.
    ///
    /// Topics without a property bag yield a message with no metadata.
    pub fn from_publish(topic: &str, payload: Bytes) -> Self {
        let mut message = CloudMessage {
            message_id: None,
            correlation_id: None,
            content_type: None,
            properties: Vec::new(),
            payload,
        };

        let bag = topic
            .find(DEVICEBOUND_SEGMENT)
            .map(|idx| &topic[idx + DEVICEBOUND_SEGMENT.len()..])
            .unwrap_or_default();

        for (key, value) in form_urlencoded::parse(bag.as_bytes()) {
            let slot = match key.as_ref() {
                "$.mid" => &mut message.message_id,
                "$.cid" => &mut message.correlation_id,
                "$.ct" => &mut message.content_type,
                k if k.starts_with("$.") => continue,
                k => {
                    message.properties.push((k.to_string(), value.into_owned()));
                    continue;
                }
            };
            *slot = Some(value.into_owned());
        }

        message
    }

    /// Whether the declared content type is textual.
    ///
    /// `text/*`, `application/json` and `application/xml` count as text;
    /// anything else, including no content type, is binary.
    pub fn is_text(&self) -> bool {
        let Some(ct) = self.content_type.as_deref() else {
            return false;
        };
        let mime = ct
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        mime.starts_with("text/") || mime == "application/json" || mime == "application/xml"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_publish_system_properties() {
        let topic = "devices/dev-01/messages/devicebound/%24.mid=42&%24.cid=abc&%24.ct=text%2Fplain&%24.to=%2Fdevices%2Fdev-01";
        let msg = CloudMessage::from_publish(topic, Bytes::from_static(b"hello"));
        assert_eq!(msg.message_id.as_deref(), Some("42"));
        assert_eq!(msg.correlation_id.as_deref(), Some("abc"));
        assert_eq!(msg.content_type.as_deref(), Some("text/plain"));
        assert!(msg.properties.is_empty());
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_from_publish_application_properties() {
        let topic = "devices/d/messages/devicebound/color=red&mode=on%20off";
        let msg = CloudMessage::from_publish(topic, Bytes::new());
        assert_eq!(
            msg.properties,
            vec![
                ("color".to_string(), "red".to_string()),
                ("mode".to_string(), "on off".to_string())
            ]
        );
        assert_eq!(msg.message_id, None);
    }

    #[test]
    fn test_from_publish_without_property_bag() {
        let msg = CloudMessage::from_publish("devices/d/messages/devicebound/", Bytes::new());
        assert_eq!(msg.message_id, None);
        assert_eq!(msg.correlation_id, None);
        let msg = CloudMessage::from_publish("unrelated/topic", Bytes::new());
        assert!(msg.properties.is_empty());
    }

    #[test]
    fn test_is_text() {
        let mut msg = CloudMessage::from_publish("t", Bytes::new());
        assert!(!msg.is_text());
        msg.content_type = Some("application/json; charset=utf-8".into());
        assert!(msg.is_text());
        msg.content_type = Some("Text/Plain".into());
        assert!(msg.is_text());
        msg.content_type = Some("application/octet-stream".into());
        assert!(!msg.is_text());
    }
}

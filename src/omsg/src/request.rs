use serde::{Deserialize, Serialize};

use crate::Error;

/// Information about the context that sent a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSender {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl MessageSender {
    pub fn with_id(id: impl ToString) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }
}

/// A single request delivered into a receiving context.
///
/// On the wire this is the JSON envelope `{"message": ..., "sender": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub message: serde_json::Value,

    #[serde(default)]
    pub sender: MessageSender,
}

impl Request {
    /// Create a request carrying `message`, with an anonymous sender.
    pub fn new(message: impl Serialize) -> Result<Self, Error> {
        let message = serde_json::to_value(message)
            .map_err(|e| Error::InvalidRequest(format!("failed to serialize message: {e}")))?;
        Ok(Self {
            message,
            sender: MessageSender::default(),
        })
    }

    pub fn with_sender(mut self, sender: MessageSender) -> Self {
        self.sender = sender;
        self
    }

    /// Decode a serialized request envelope.
    pub fn parse(serialized: &str) -> Result<Self, Error> {
        serde_json::from_str(serialized).map_err(|e| Error::InvalidRequest(e.to_string()))
    }

    /// Encode this request as a serialized envelope.
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Error::internal_error)
    }

    /// Deserialize the message payload into a concrete type.
    pub fn message_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.message.clone())
            .map_err(|e| Error::InvalidRequest(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn envelope_without_sender_defaults() {
        let request = Request::parse(r#"{"message": "ping"}"#).unwrap();
        assert_eq!(request.message, serde_json::json!("ping"));
        assert_eq!(request.sender, MessageSender::default());
    }

    #[test]
    fn envelope_encodes_sender_fields_that_are_set() {
        let request = Request::new(serde_json::json!({"greeting": "hi"}))
            .unwrap()
            .with_sender(MessageSender::with_id("ext-a"));
        expect![[r#"{"message":{"greeting":"hi"},"sender":{"id":"ext-a"}}"#]]
            .assert_eq(&request.to_json().unwrap());
    }

    #[test]
    fn malformed_envelope_is_invalid_request() {
        let err = Request::parse("{not json").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)), "{err:?}");
    }
}

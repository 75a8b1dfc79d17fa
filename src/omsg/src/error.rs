//! Error types.
//!
//! There are three families of errors:
//!
//! - [`ListenerError`]: raised by application listener code (returned `Err`, a
//!   panic, a rejected promise, or an error passed to a [`Responder`]).
//! - [`Error`]: the terminal failure delivered to the sender of a message.
//! - [`DoubleResponseError`]: returned to a listener that tries to respond
//!   when it no longer can. Never delivered to the sender.
//!
//! [`Responder`]: crate::Responder

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ListenerId;

/// Error produced by listener code.
///
/// Surfaced verbatim as the exchange's result when it wins arbitration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ListenerError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ListenerError {
    pub fn new(message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
            data: None,
        }
    }

    /// Attach structured data to the error.
    pub fn with_data(mut self, data: impl Into<serde_json::Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Wrap any displayable error, for use with `map_err`.
    pub fn into_listener_error(error: impl fmt::Display) -> Self {
        Self::new(error)
    }

    /// Build an error from the payload of a caught panic.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "listener panicked".to_string()
        };
        Self::new(message).with_data(serde_json::json!({ "panicked": true }))
    }
}

impl From<&str> for ListenerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ListenerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<DoubleResponseError> for ListenerError {
    fn from(error: DoubleResponseError) -> Self {
        Self::new(error)
    }
}

/// Terminal failure of an exchange, as seen by the sender.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A listener threw, rejected, or responded with an error.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// A deferred response was promised but the receiving context went away.
    #[error("a listener indicated an asynchronous response but the channel closed before a response was received")]
    ChannelClosed,

    /// Nobody was listening on the receiving side.
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,

    /// The serialized request could not be decoded.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable message of [`Error::ChannelClosed`].
    pub const CHANNEL_CLOSED_MESSAGE: &'static str = "a listener indicated an asynchronous response but the channel closed before a response was received";

    /// Stable message of [`Error::NoReceiver`].
    pub const NO_RECEIVER_MESSAGE: &'static str =
        "Could not establish connection. Receiving end does not exist.";

    pub fn internal_error(message: impl ToString) -> Self {
        Error::Internal(message.to_string())
    }

    /// The listener error, if this failure originated in listener code.
    pub fn as_listener_error(&self) -> Option<&ListenerError> {
        match self {
            Error::Listener(err) => Some(err),
            _ => None,
        }
    }
}

/// Why a [`DoubleResponseError`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleResponseKind {
    /// This responder was already used.
    AlreadyResponded,

    /// Another outcome already settled the exchange, or the channel closed.
    ExchangeSettled,

    /// An earlier listener already decided the exchange during the
    /// synchronous pass, so a response given during this listener's turn
    /// cannot win.
    Preempted,

    /// A deferred responder was called from inside a listener while the
    /// synchronous pass was still running. It can be called again once
    /// dispatch returns.
    Reentrant,

    /// The listener neither requested an asynchronous response nor responded
    /// during its own turn.
    Expired,
}

impl fmt::Display for DoubleResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoubleResponseKind::AlreadyResponded => f.write_str("response was already sent"),
            DoubleResponseKind::ExchangeSettled => f.write_str("exchange already settled"),
            DoubleResponseKind::Preempted => {
                f.write_str("an earlier listener already decided the exchange")
            }
            DoubleResponseKind::Reentrant => {
                f.write_str("deferred response given while listeners are still being invoked")
            }
            DoubleResponseKind::Expired => {
                f.write_str("listener did not request an asynchronous response")
            }
        }
    }
}

/// Raised into a listener's own context when it responds too late or twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("listener {listener} cannot respond: {kind}")]
pub struct DoubleResponseError {
    pub listener: ListenerId,
    pub kind: DoubleResponseKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_messages_match_display() {
        assert_eq!(
            Error::ChannelClosed.to_string(),
            Error::CHANNEL_CLOSED_MESSAGE
        );
        assert_eq!(Error::NoReceiver.to_string(), Error::NO_RECEIVER_MESSAGE);
    }

    #[test]
    fn panic_payloads_become_listener_errors() {
        let err = ListenerError::from_panic(Box::new("boom"));
        assert_eq!(err.message, "boom");

        let err = ListenerError::from_panic(Box::new(String::from("kaboom")));
        assert_eq!(err.message, "kaboom");

        let err = ListenerError::from_panic(Box::new(42_u32));
        assert_eq!(err.message, "listener panicked");
    }
}

use std::fmt;
use std::future::Future;

use futures::FutureExt as _;
use futures::future::BoxFuture;

use crate::{ListenerError, Request, Responder};

/// Application code that receives one-time messages.
///
/// Each dispatched request invokes every registered listener exactly once,
/// synchronously and in registration order. The listener decides how it will
/// answer by what it returns:
///
/// - [`Invocation::RequestAsync`] to keep the [`Responder`] and answer later;
/// - [`Invocation::Promise`] to answer with whatever a future settles to;
/// - [`Invocation::Done`] or [`Invocation::Value`] to not answer at all (unless
///   it already used the responder during its turn);
/// - `Err(_)` to fail the exchange.
///
/// Any closure of the right shape is a listener.
pub trait Listener: Send + Sync {
    fn on_message(&self, request: &Request, responder: Responder)
    -> Result<Invocation, ListenerError>;

    /// Describe this listener, for logs.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl<F> Listener for F
where
    F: Fn(&Request, Responder) -> Result<Invocation, ListenerError> + Send + Sync,
{
    fn on_message(
        &self,
        request: &Request,
        responder: Responder,
    ) -> Result<Invocation, ListenerError> {
        self(request, responder)
    }
}

/// What a listener returned from its synchronous turn.
pub enum Invocation {
    /// Returned nothing.
    Done,

    /// Returned a value. Only treated as a response in
    /// [`ResponseMode::EagerValues`](crate::ResponseMode::EagerValues).
    Value(serde_json::Value),

    /// The listener will call its responder later.
    RequestAsync,

    /// The listener will answer with whatever this future settles to.
    Promise(BoxFuture<'static, Result<serde_json::Value, ListenerError>>),
}

impl Invocation {
    pub fn value(value: impl Into<serde_json::Value>) -> Self {
        Invocation::Value(value.into())
    }

    pub fn promise(
        future: impl Future<Output = Result<serde_json::Value, ListenerError>> + Send + 'static,
    ) -> Self {
        Invocation::Promise(future.boxed())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Done => f.write_str("Done"),
            Invocation::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Invocation::RequestAsync => f.write_str("RequestAsync"),
            Invocation::Promise(_) => f.write_str("Promise(..)"),
        }
    }
}

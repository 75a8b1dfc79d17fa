//! One-time message dispatch.
//!
//! A [`Dispatcher`] delivers a single [`Request`] to every [`Listener`]
//! registered in one receiving context and settles exactly one result for
//! the sender, even though several listeners may try to answer:
//!
//! 1. Every listener gets one synchronous turn, in registration order. The
//!    earliest listener that fails during its turn, or answers through its
//!    [`Responder`] during its turn, decides the result right away. This
//!    pre-empts any deferred answers.
//! 2. Otherwise the first deferred answer to settle wins, whether it comes
//!    from a responder kept past the turn ([`Invocation::RequestAsync`]) or
//!    from a returned future ([`Invocation::Promise`]).
//! 3. With nothing deferred, the exchange resolves to
//!    [`Response::NoResponse`].
//! 4. If the receiving context goes away first, the exchange fails with
//!    [`Error::ChannelClosed`].
//!
//! ```
//! # futures::executor::block_on(async {
//! use omsg::{Dispatcher, Invocation, Request, Response};
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.on_message(|request, responder| {
//!     if request.message == "ping" {
//!         responder.respond("pong")?;
//!     }
//!     Ok(Invocation::Done)
//! });
//!
//! let exchange = dispatcher.dispatch(Request::new("ping")?);
//! assert_eq!(exchange.await_result().await?, Response::Value("pong".into()));
//! # Ok::<(), omsg::Error>(())
//! # }).unwrap();
//! ```

mod dispatcher;
mod error;
mod exchange;
mod invocation;
mod listener;
mod registry;
mod request;
mod responder;
mod util;

pub use dispatcher::*;
pub use error::*;
pub use exchange::{ChannelCloser, Exchange, ExchangeId, ExchangeState, Response};
pub use invocation::InvocationOutcome;
pub use listener::*;
pub use registry::*;
pub use request::*;
pub use responder::Responder;

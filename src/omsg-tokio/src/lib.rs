//! Tokio-based transport for omsg
//!
//! Runs a [`Dispatcher`](omsg::Dispatcher) as a receiving context on a tokio
//! task and hands senders a [`Port`] with a promise-style `send_message`.
//! Requests cross the channel as serialized envelopes, the way they would
//! cross a process boundary.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), omsg::Error> {
//! use omsg::{Dispatcher, Invocation, Response};
//! use omsg_tokio::ReceivingContext;
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.on_message(|_request, responder| {
//!     responder.respond("pong")?;
//!     Ok(Invocation::Done)
//! });
//!
//! let (handle, port) = ReceivingContext::spawn(dispatcher);
//! assert_eq!(port.send_message(&"ping").await?, Response::Value("pong".into()));
//!
//! handle.destroy();
//! # Ok(())
//! # }
//! ```

mod context;
mod port;

pub use context::{ContextHandle, ReceivingContext};
pub use port::Port;

//! Listener fixtures shared by the omsg test suites.

use std::sync::{Arc, Mutex, Once};

use futures::channel::oneshot;
use omsg::{Invocation, Listener, ListenerError, Request, Responder};

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; defaults to `omsg=debug`. Safe to call from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("omsg=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Pins a closure to the listener signature so its types are inferred.
pub fn listener<F>(f: F) -> F
where
    F: Fn(&Request, Responder) -> Result<Invocation, ListenerError> + Send + Sync + 'static,
{
    f
}

/// Returns nothing and never responds.
pub fn silent() -> impl Listener {
    listener(|_request, _responder| Ok(Invocation::Done))
}

/// Returns `value` from its turn (inert unless the dispatcher is in eager mode).
pub fn returns(value: serde_json::Value) -> impl Listener {
    listener(move |_request, _responder| Ok(Invocation::Value(value.clone())))
}

/// Fails synchronously with `message`.
pub fn throws(message: &str) -> impl Listener + use<> {
    let message = message.to_string();
    listener(move |_request, _responder| Err(ListenerError::new(&message)))
}

/// Responds with `value` through its responder, during its own turn.
pub fn responds_in_turn(value: serde_json::Value) -> impl Listener {
    listener(move |_request, responder| {
        responder.respond(value.clone())?;
        Ok(Invocation::Done)
    })
}

/// Echoes the request's message back during its own turn.
pub fn echo() -> impl Listener {
    listener(|request, responder| {
        responder.respond(request.message.clone())?;
        Ok(Invocation::Done)
    })
}

/// Returns a promise that resolves to `value` immediately.
pub fn resolves(value: serde_json::Value) -> impl Listener {
    listener(move |_request, _responder| {
        Ok(Invocation::promise(futures::future::ready(Ok(value.clone()))))
    })
}

/// Returns a promise that rejects with `message` immediately.
pub fn rejects(message: &str) -> impl Listener + use<> {
    let message = message.to_string();
    listener(move |_request, _responder| {
        Ok(Invocation::promise(futures::future::ready(Err(
            ListenerError::new(&message),
        ))))
    })
}

/// Returns a promise that never settles.
pub fn never_settles() -> impl Listener {
    listener(|_request, _responder| Ok(Invocation::promise(futures::future::pending())))
}

/// Requests an asynchronous response and hands its responder to the test.
#[derive(Clone, Default)]
pub struct ResponderStash {
    responders: Arc<Mutex<Vec<Responder>>>,
}

impl ResponderStash {
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener that stashes its responder and returns `RequestAsync`.
    pub fn listener(&self) -> impl Listener + use<> {
        let responders = self.responders.clone();
        listener(move |_request, responder| {
            responders.lock().unwrap().push(responder);
            Ok(Invocation::RequestAsync)
        })
    }

    /// Take the oldest stashed responder.
    pub fn take(&self) -> Responder {
        let mut responders = self.responders.lock().unwrap();
        assert!(!responders.is_empty(), "no responder was stashed");
        responders.remove(0)
    }

    pub fn len(&self) -> usize {
        self.responders.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A promise-returning listener whose promise the test settles by hand.
pub struct GatedPromise {
    settle_tx: Arc<Mutex<Option<oneshot::Sender<Result<serde_json::Value, ListenerError>>>>>,
    settle_rx: Arc<Mutex<Option<oneshot::Receiver<Result<serde_json::Value, ListenerError>>>>>,
}

impl GatedPromise {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            settle_tx: Arc::new(Mutex::new(Some(tx))),
            settle_rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// The listener. Usable for a single dispatch.
    pub fn listener(&self) -> impl Listener + use<> {
        let settle_rx = self.settle_rx.clone();
        listener(move |_request, _responder| {
            let rx = settle_rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ListenerError::new("gated promise already used"))?;
            Ok(Invocation::promise(async move {
                match rx.await {
                    Ok(result) => result,
                    // Gate dropped: never settle.
                    Err(_) => futures::future::pending().await,
                }
            }))
        })
    }

    /// Settle the promise.
    pub fn settle(&self, result: Result<serde_json::Value, ListenerError>) {
        let tx = self.settle_tx.lock().unwrap().take().expect("already settled");
        let _ = tx.send(result);
    }
}

impl Default for GatedPromise {
    fn default() -> Self {
        Self::new()
    }
}

use std::pin::pin;
use std::sync::Arc;

use omsg::{Dispatcher, Error, Exchange, Response};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::Port;

/// Deliveries queued for a context before senders start waiting.
const DEFAULT_BUFFER: usize = 32;

/// A serialized request travelling to the receiving context.
pub(crate) struct Delivery {
    pub(crate) payload: String,
    pub(crate) reply_tx: oneshot::Sender<Result<Response, Error>>,
}

/// Builder for a receiving context running on the current tokio runtime.
#[derive(Debug)]
pub struct ReceivingContext {
    dispatcher: Dispatcher,
    buffer: usize,
}

impl ReceivingContext {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Capacity of the delivery queue.
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Spawn a context for `dispatcher` with default settings.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(dispatcher: Dispatcher) -> (ContextHandle, Port) {
        Self::new(dispatcher).start()
    }

    /// Spawn the context task.
    ///
    /// The context lives until [`ContextHandle::destroy`] is called or every
    /// clone of the returned handle is dropped.
    pub fn start(self) -> (ContextHandle, Port) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let token = CancellationToken::new();

        tokio::spawn(run(self.dispatcher.clone(), rx, token.clone()));

        let handle = ContextHandle {
            inner: Arc::new(HandleInner {
                dispatcher: self.dispatcher,
                token: token.clone(),
                _guard: token.clone().drop_guard(),
            }),
        };
        (handle, Port::new(tx, token))
    }
}

struct HandleInner {
    dispatcher: Dispatcher,
    token: CancellationToken,
    _guard: DropGuard,
}

/// Owner-side handle of a receiving context.
///
/// Cloning shares the context. Dropping the last clone destroys it.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<HandleInner>,
}

impl ContextHandle {
    /// Tear the context down.
    ///
    /// Exchanges still waiting on deferred outcomes fail with
    /// [`Error::ChannelClosed`], the registry is cleared, and later sends
    /// fail with [`Error::NoReceiver`]. Calling this again does nothing.
    pub fn destroy(&self) {
        if !self.inner.token.is_cancelled() {
            tracing::debug!(dispatcher = ?self.inner.dispatcher.config().name, "destroy");
        }
        self.inner.token.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The dispatcher this context delivers into; use it to register listeners.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("dispatcher", &self.inner.dispatcher.config().name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// The context's event loop.
async fn run(dispatcher: Dispatcher, mut rx: mpsc::Receiver<Delivery>, token: CancellationToken) {
    let name = dispatcher.config().name.clone();
    tracing::debug!(dispatcher = ?name, "receiving context started");
    let exchanges = TaskTracker::new();

    loop {
        tokio::select! {
            // Teardown wins over queued deliveries.
            biased;

            () = token.cancelled() => break,

            delivery = rx.recv() => match delivery {
                Some(delivery) => deliver(&dispatcher, &exchanges, &token, delivery),
                None => {
                    // No port can reach us anymore; in-flight exchanges
                    // still wait for teardown.
                    tracing::trace!(dispatcher = ?name, "all ports dropped");
                    token.cancelled().await;
                    break;
                }
            },
        }
    }

    rx.close();
    while let Some(delivery) = rx.recv().await {
        let _ = delivery.reply_tx.send(Err(Error::NoReceiver));
    }
    dispatcher.registry().clear();

    exchanges.close();
    exchanges.wait().await;
    tracing::debug!(dispatcher = ?name, "receiving context destroyed");
}

fn deliver(
    dispatcher: &Dispatcher,
    exchanges: &TaskTracker,
    token: &CancellationToken,
    delivery: Delivery,
) {
    let Delivery { payload, reply_tx } = delivery;
    let exchange = match dispatcher.deliver(&payload) {
        Ok(exchange) => exchange,
        Err(err) => {
            tracing::warn!(?err, "rejected delivery");
            let _ = reply_tx.send(Err(err));
            return;
        }
    };

    exchanges.spawn(settle(exchange, token.clone(), reply_tx));
}

/// Wait for one exchange, closing it if the context is torn down first.
async fn settle(
    exchange: Exchange,
    token: CancellationToken,
    reply_tx: oneshot::Sender<Result<Response, Error>>,
) {
    let id = exchange.id();
    let closer = exchange.closer();
    let mut result = pin!(exchange.await_result());

    let result = tokio::select! {
        result = &mut result => result,
        () = token.cancelled() => {
            closer.channel_closed();
            result.await
        }
    };

    if reply_tx.send(result).is_err() {
        tracing::trace!(exchange = %id, "sender stopped waiting");
    }
}

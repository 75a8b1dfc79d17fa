//! The live state of one dispatched request.
//!
//! An [`Exchange`] is created by [`Dispatcher::dispatch`] after every listener
//! has had its synchronous turn. From then on it settles at most once:
//!
//! ```text
//! OPEN ──► RESOLVED   a response (value, no-response, or listener error) won
//!   │
//!   └────► CLOSED     the channel went away while deferred outcomes were pending
//! ```
//!
//! Both transitions go through a single compare-and-set on the state word, so
//! concurrent settlement attempts (responders called from other threads,
//! promises, channel teardown) agree on exactly one winner. Losers observe
//! the failed transition and are told so.
//!
//! A deferred settlement attempted from another thread while the synchronous
//! pass is still running waits until the pass has been arbitrated, so a
//! synchronous answer always wins over it.
//!
//! [`Dispatcher::dispatch`]: crate::Dispatcher::dispatch

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;

use futures::FutureExt as _;
use futures::StreamExt as _;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Either, select};
use futures::stream::FuturesUnordered;
use uuid::Uuid;

use crate::{DoubleResponseKind, Error, InvocationOutcome, ListenerError, ListenerId};

/// Identifier of one exchange, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle state of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Open,
    Resolved,
    Closed,
}

impl ExchangeState {
    const fn as_u8(self) -> u8 {
        match self {
            ExchangeState::Open => 0,
            ExchangeState::Resolved => 1,
            ExchangeState::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExchangeState::Open,
            1 => ExchangeState::Resolved,
            _ => ExchangeState::Closed,
        }
    }
}

/// Successful result of an exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Value(serde_json::Value),

    /// No listener answered. Distinct from an error.
    NoResponse,
}

impl Response {
    /// The response value, treating "no response" as `null`.
    pub fn into_value(self) -> serde_json::Value {
        match self {
            Response::Value(value) => value,
            Response::NoResponse => serde_json::Value::Null,
        }
    }
}

pub(crate) type ExchangeResult = Result<Response, Error>;

/// A candidate result produced by a specific listener.
#[derive(Debug)]
pub(crate) struct Settlement {
    pub(crate) index: usize,
    pub(crate) listener: ListenerId,
    pub(crate) result: Result<serde_json::Value, ListenerError>,
}

impl Settlement {
    fn into_exchange_result(self) -> ExchangeResult {
        self.result.map(Response::Value).map_err(Error::Listener)
    }
}

struct Inner {
    /// `true` until the synchronous pass has been arbitrated.
    in_sync_pass: bool,

    /// Thread running the synchronous pass.
    dispatching: Option<ThreadId>,

    /// Index of the earliest synchronous answer seen so far in the pass.
    candidate: Option<usize>,

    /// Deferred outcomes that can still settle.
    outstanding: usize,

    result_tx: Option<oneshot::Sender<ExchangeResult>>,
}

/// State shared between an [`Exchange`], its responders and its closers.
///
/// Every terminal transition happens while holding `inner`, so the end of
/// the synchronous pass and concurrent settlements are totally ordered.
pub(crate) struct ExchangeShared {
    id: ExchangeId,
    state: AtomicU8,
    inner: Mutex<Inner>,
    pass_done: Condvar,
}

impl ExchangeShared {
    /// Create the shared state. The calling thread is the one running the
    /// synchronous pass.
    pub(crate) fn new(id: ExchangeId) -> (Arc<Self>, oneshot::Receiver<ExchangeResult>) {
        let (result_tx, result_rx) = oneshot::channel();
        let shared = Arc::new(Self {
            id,
            state: AtomicU8::new(ExchangeState::Open.as_u8()),
            inner: Mutex::new(Inner {
                in_sync_pass: true,
                dispatching: Some(std::thread::current().id()),
                candidate: None,
                outstanding: 0,
                result_tx: Some(result_tx),
            }),
            pass_done: Condvar::new(),
        });
        (shared, result_rx)
    }

    pub(crate) fn id(&self) -> ExchangeId {
        self.id
    }

    pub(crate) fn state(&self) -> ExchangeState {
        ExchangeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attempt the terminal transition. Only the first caller succeeds.
    fn finish(&self, inner: &mut Inner, target: ExchangeState, result: ExchangeResult) -> bool {
        if self
            .state
            .compare_exchange(
                ExchangeState::Open.as_u8(),
                target.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        tracing::debug!(exchange = %self.id, ?target, ok = result.is_ok(), "exchange settled");
        if let Some(result_tx) = inner.result_tx.take() {
            // The receiver going away just means nobody is waiting anymore.
            if result_tx.send(result).is_err() {
                tracing::trace!(exchange = %self.id, "result receiver dropped");
            }
        }
        true
    }

    /// Count a deferred outcome produced during the synchronous pass.
    pub(crate) fn add_outstanding(&self) {
        self.lock().outstanding += 1;
    }

    /// Record a synchronous answer at `index`. The earliest one is kept.
    pub(crate) fn record_candidate(&self, index: usize) {
        let mut inner = self.lock();
        if inner.candidate.is_none() {
            inner.candidate = Some(index);
        }
    }

    /// Whether a synchronous answer already decided the pass.
    pub(crate) fn has_candidate(&self) -> bool {
        self.lock().candidate.is_some()
    }

    /// Offer the settlement of a deferred callback or promise.
    ///
    /// Called from another thread while the synchronous pass is running,
    /// this blocks until the pass has been arbitrated. Called from the
    /// dispatching thread during the pass (that is, from inside a listener),
    /// it is refused with [`DoubleResponseKind::Reentrant`].
    pub(crate) fn settle_deferred(&self, settlement: Settlement) -> Result<(), DoubleResponseKind> {
        let mut inner = self.lock();
        if inner.in_sync_pass {
            if inner.dispatching == Some(std::thread::current().id()) {
                return Err(DoubleResponseKind::Reentrant);
            }
            tracing::trace!(
                exchange = %self.id,
                index = settlement.index,
                "deferred settlement waiting for synchronous pass"
            );
            inner = self
                .pass_done
                .wait_while(inner, |inner| inner.in_sync_pass)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        let index = settlement.index;
        let listener = settlement.listener;
        if self.finish(&mut inner, ExchangeState::Resolved, settlement.into_exchange_result()) {
            tracing::debug!(exchange = %self.id, index, %listener, "deferred outcome won");
            Ok(())
        } else {
            Err(DoubleResponseKind::ExchangeSettled)
        }
    }

    /// A deferred callback can no longer settle; its responder was dropped.
    pub(crate) fn abandon(&self) {
        let mut inner = self.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if inner.outstanding == 0 && !inner.in_sync_pass && self.state() == ExchangeState::Open {
            tracing::debug!(exchange = %self.id, "every deferred responder was dropped");
            self.finish(&mut inner, ExchangeState::Closed, Err(Error::ChannelClosed));
        }
    }

    /// The receiving context was torn down.
    pub(crate) fn close(&self) -> bool {
        let mut inner = self.lock();
        self.finish(&mut inner, ExchangeState::Closed, Err(Error::ChannelClosed))
    }

    /// Apply the synchronous-pass rules and release waiting settlements.
    ///
    /// `candidate` is the earliest-indexed synchronous answer (throw, response
    /// through a responder, or eager value). `deferred` is the number of
    /// deferred outcomes the pass produced. `no_response` is what an exchange
    /// with nothing to wait for resolves to.
    pub(crate) fn end_sync_pass(
        &self,
        candidate: Option<Settlement>,
        deferred: usize,
        no_response: ExchangeResult,
    ) {
        let mut inner = self.lock();

        if let Some(candidate) = candidate {
            tracing::debug!(
                exchange = %self.id,
                index = candidate.index,
                listener = %candidate.listener,
                "synchronous outcome won"
            );
            self.finish(&mut inner, ExchangeState::Resolved, candidate.into_exchange_result());
        } else if deferred == 0 {
            self.finish(&mut inner, ExchangeState::Resolved, no_response);
        } else if inner.outstanding == 0 {
            self.finish(&mut inner, ExchangeState::Closed, Err(Error::ChannelClosed));
        } else {
            tracing::trace!(
                exchange = %self.id,
                outstanding = inner.outstanding,
                "awaiting deferred outcomes"
            );
        }

        inner.in_sync_pass = false;
        inner.dispatching = None;
        drop(inner);
        self.pass_done.notify_all();
    }
}

/// A promise returned by a listener, not yet polled.
pub(crate) struct PendingPromise {
    pub(crate) index: usize,
    pub(crate) listener: ListenerId,
    pub(crate) future: BoxFuture<'static, Result<serde_json::Value, ListenerError>>,
}

/// One dispatched request awaiting exactly one response.
#[must_use]
pub struct Exchange {
    shared: Arc<ExchangeShared>,
    outcomes: Vec<InvocationOutcome>,
    promises: Vec<PendingPromise>,
    result_rx: oneshot::Receiver<ExchangeResult>,
    name: Option<String>,
}

impl Exchange {
    pub(crate) fn new(
        shared: Arc<ExchangeShared>,
        outcomes: Vec<InvocationOutcome>,
        promises: Vec<PendingPromise>,
        result_rx: oneshot::Receiver<ExchangeResult>,
        name: Option<String>,
    ) -> Self {
        Self {
            shared,
            outcomes,
            promises,
            result_rx,
            name,
        }
    }

    pub fn id(&self) -> ExchangeId {
        self.shared.id()
    }

    pub fn state(&self) -> ExchangeState {
        self.shared.state()
    }

    /// Outcomes of the synchronous pass, index-aligned with the listeners
    /// that were registered at dispatch time.
    pub fn outcomes(&self) -> &[InvocationOutcome] {
        &self.outcomes
    }

    /// Handle the transport uses to report that the receiving context is gone.
    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            shared: self.shared.clone(),
        }
    }

    /// Wait for the single result of this exchange.
    ///
    /// Pending promises are only polled while this future is polled. Once the
    /// exchange has settled, promises that are still pending are dropped.
    pub async fn await_result(self) -> Result<Response, Error> {
        let Exchange {
            shared,
            outcomes: _,
            promises,
            result_rx,
            name,
        } = self;

        let id = shared.id();
        let settled = async {
            let background = std::pin::pin!(drive_promises(&shared, promises));
            match select(background, result_rx).await {
                Either::Left(((), result_rx)) => result_rx.await,
                Either::Right((received, _)) => received,
            }
        };

        crate::util::instrument_with_exchange_name(name, id, settled)
            .await
            .unwrap_or_else(|_| Err(Error::internal_error("exchange dropped without a result")))
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("outcomes", &self.outcomes)
            .field("pending_promises", &self.promises.len())
            .finish()
    }
}

/// Race the pending promises; the first to settle is offered to the exchange.
async fn drive_promises(shared: &ExchangeShared, promises: Vec<PendingPromise>) {
    if shared.state() != ExchangeState::Open {
        return;
    }

    let mut pending: FuturesUnordered<_> = promises
        .into_iter()
        .map(|promise| {
            let PendingPromise {
                index,
                listener,
                future,
            } = promise;
            std::panic::AssertUnwindSafe(future)
                .catch_unwind()
                .map(move |result| Settlement {
                    index,
                    listener,
                    result: result.unwrap_or_else(|panic| Err(ListenerError::from_panic(panic))),
                })
        })
        .collect();

    while let Some(settlement) = pending.next().await {
        let index = settlement.index;
        let listener = settlement.listener;
        if shared.settle_deferred(settlement).is_err() {
            tracing::debug!(
                exchange = %shared.id(),
                index,
                %listener,
                "discarding late promise settlement"
            );
        }
    }
}

/// Reports teardown of the receiving context to an exchange.
#[derive(Clone)]
pub struct ChannelCloser {
    shared: Arc<ExchangeShared>,
}

impl ChannelCloser {
    /// Signal that the channel closed.
    ///
    /// If the exchange is still open it becomes closed with
    /// [`Error::ChannelClosed`]. Returns whether this call closed it.
    pub fn channel_closed(&self) -> bool {
        let closed = self.shared.close();
        tracing::debug!(exchange = %self.shared.id(), closed, "channel_closed");
        closed
    }

    pub fn exchange_id(&self) -> ExchangeId {
        self.shared.id()
    }
}

impl fmt::Debug for ChannelCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCloser")
            .field("exchange", &self.shared.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settlement(index: usize, value: &str) -> Settlement {
        Settlement {
            index,
            listener: crate::ListenerId::new(),
            result: Ok(serde_json::json!(value)),
        }
    }

    #[test]
    fn only_one_terminal_transition() {
        let (shared, mut result_rx) = ExchangeShared::new(ExchangeId::new());
        shared.add_outstanding();
        shared.end_sync_pass(None, 1, Ok(Response::NoResponse));
        assert_eq!(shared.state(), ExchangeState::Open);

        assert!(shared.settle_deferred(settlement(0, "first")).is_ok());
        assert!(shared.settle_deferred(settlement(1, "second")).is_err());
        assert!(!shared.close());
        assert_eq!(shared.state(), ExchangeState::Resolved);

        let result = result_rx.try_recv().unwrap().unwrap();
        assert_eq!(result, Ok(Response::Value(serde_json::json!("first"))));
    }

    #[test]
    fn settlement_from_another_thread_waits_for_synchronous_pass() {
        let (shared, mut result_rx) = ExchangeShared::new(ExchangeId::new());
        shared.add_outstanding();

        let waiting = std::thread::spawn({
            let shared = shared.clone();
            move || shared.settle_deferred(settlement(0, "deferred"))
        });

        shared.end_sync_pass(Some(settlement(1, "sync")), 1, Ok(Response::NoResponse));
        assert_eq!(
            waiting.join().unwrap(),
            Err(DoubleResponseKind::ExchangeSettled)
        );
        let result = result_rx.try_recv().unwrap().unwrap();
        assert_eq!(result, Ok(Response::Value(serde_json::json!("sync"))));
    }

    #[test]
    fn settlement_from_another_thread_wins_without_candidate() {
        let (shared, mut result_rx) = ExchangeShared::new(ExchangeId::new());
        shared.add_outstanding();

        let waiting = std::thread::spawn({
            let shared = shared.clone();
            move || shared.settle_deferred(settlement(0, "deferred"))
        });

        shared.end_sync_pass(None, 1, Ok(Response::NoResponse));
        assert_eq!(waiting.join().unwrap(), Ok(()));
        let result = result_rx.try_recv().unwrap().unwrap();
        assert_eq!(result, Ok(Response::Value(serde_json::json!("deferred"))));
    }

    #[test]
    fn settlement_on_dispatching_thread_during_pass_is_refused() {
        let (shared, _result_rx) = ExchangeShared::new(ExchangeId::new());
        shared.add_outstanding();
        assert_eq!(
            shared.settle_deferred(settlement(0, "reentrant")),
            Err(DoubleResponseKind::Reentrant)
        );

        shared.end_sync_pass(None, 1, Ok(Response::NoResponse));
        assert_eq!(shared.settle_deferred(settlement(0, "later")), Ok(()));
    }

    #[test]
    fn abandoning_every_deferred_outcome_closes() {
        let (shared, mut result_rx) = ExchangeShared::new(ExchangeId::new());
        shared.add_outstanding();
        shared.add_outstanding();
        shared.end_sync_pass(None, 2, Ok(Response::NoResponse));

        shared.abandon();
        assert_eq!(shared.state(), ExchangeState::Open);
        shared.abandon();
        assert_eq!(shared.state(), ExchangeState::Closed);
        assert_eq!(
            result_rx.try_recv().unwrap().unwrap(),
            Err(Error::ChannelClosed)
        );
    }
}

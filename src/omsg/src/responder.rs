use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::exchange::{ExchangeShared, Settlement};
use crate::{DoubleResponseError, DoubleResponseKind, ExchangeState, ListenerError, ListenerId};

/// Where a listener's responder is in its lifecycle.
enum Turn {
    /// The listener's synchronous turn is running. Holds the response given
    /// during the turn, if any.
    Running(Option<Result<serde_json::Value, ListenerError>>),

    /// The listener requested an asynchronous response.
    Deferred,

    /// The listener's turn ended without requesting an asynchronous response.
    Expired,
}

pub(crate) struct ResponderSlot {
    index: usize,
    listener: ListenerId,
    shared: Arc<ExchangeShared>,
    responded: AtomicBool,
    turn: Mutex<Turn>,
}

impl ResponderSlot {
    pub(crate) fn new(index: usize, listener: ListenerId, shared: Arc<ExchangeShared>) -> Self {
        Self {
            index,
            listener,
            shared,
            responded: AtomicBool::new(false),
            turn: Mutex::new(Turn::Running(None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Turn> {
        self.turn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// End the listener's synchronous turn.
    ///
    /// Returns the response given during the turn, if any.
    pub(crate) fn end_turn(
        &self,
        requested_async: bool,
    ) -> Option<Result<serde_json::Value, ListenerError>> {
        let next = if requested_async {
            Turn::Deferred
        } else {
            Turn::Expired
        };
        match std::mem::replace(&mut *self.lock(), next) {
            Turn::Running(response) => response,
            Turn::Deferred | Turn::Expired => None,
        }
    }

    fn error(&self, kind: DoubleResponseKind) -> DoubleResponseError {
        tracing::warn!(
            exchange = %self.shared.id(),
            index = self.index,
            listener = %self.listener,
            %kind,
            "rejected response"
        );
        DoubleResponseError {
            listener: self.listener,
            kind,
        }
    }
}

impl Drop for ResponderSlot {
    fn drop(&mut self) {
        let turn = self
            .turn
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(turn, Turn::Deferred) && !*self.responded.get_mut() {
            tracing::debug!(
                exchange = %self.shared.id(),
                index = self.index,
                listener = %self.listener,
                "deferred responder dropped without responding"
            );
            self.shared.abandon();
        }
    }
}

/// One-shot handle a listener uses to answer a message.
///
/// Every clone refers to the same underlying slot: only the first call across
/// all clones can succeed. A responder can be used during the listener's own
/// turn, or later if the listener returned
/// [`Invocation::RequestAsync`](crate::Invocation::RequestAsync). Calls made
/// from another thread while the synchronous pass is still running block
/// until it ends, so the returned result is final. If every
/// clone of a deferred responder is dropped without responding, the listener
/// is treated as having given up.
#[derive(Clone)]
pub struct Responder {
    slot: Arc<ResponderSlot>,
}

impl Responder {
    pub(crate) fn new(slot: Arc<ResponderSlot>) -> Self {
        Self { slot }
    }

    /// The listener this responder belongs to.
    pub fn listener(&self) -> ListenerId {
        self.slot.listener
    }

    /// Respond with either a value (`Ok`) or an error (`Err`).
    pub fn respond_with_result(
        &self,
        response: Result<serde_json::Value, ListenerError>,
    ) -> Result<(), DoubleResponseError> {
        let slot = &*self.slot;
        let mut turn = slot.lock();

        if slot.responded.load(Ordering::Acquire) {
            return Err(slot.error(DoubleResponseKind::AlreadyResponded));
        }
        let deferred = match &*turn {
            Turn::Expired => return Err(slot.error(DoubleResponseKind::Expired)),
            Turn::Deferred => true,
            Turn::Running(_) => false,
        };

        tracing::debug!(
            exchange = %slot.shared.id(),
            index = slot.index,
            listener = %slot.listener,
            ok = response.is_ok(),
            deferred,
            "respond called"
        );

        if deferred {
            let settled = slot.shared.settle_deferred(Settlement {
                index: slot.index,
                listener: slot.listener,
                result: response,
            });
            // A reentrant call consumed nothing; the responder stays usable.
            if settled != Err(DoubleResponseKind::Reentrant) {
                slot.responded.store(true, Ordering::Release);
            }
            drop(turn);
            return settled.map_err(|kind| slot.error(kind));
        }

        // Still inside the listener's turn: arbitration happens at the end of
        // the synchronous pass, unless an earlier listener already decided it.
        slot.responded.store(true, Ordering::Release);
        if slot.shared.state() != ExchangeState::Open {
            return Err(slot.error(DoubleResponseKind::ExchangeSettled));
        }
        if slot.shared.has_candidate() {
            return Err(slot.error(DoubleResponseKind::Preempted));
        }
        *turn = Turn::Running(Some(response));
        Ok(())
    }

    /// Respond with a value.
    pub fn respond(
        &self,
        response: impl Into<serde_json::Value>,
    ) -> Result<(), DoubleResponseError> {
        self.respond_with_result(Ok(response.into()))
    }

    /// Respond with an error.
    pub fn respond_with_error(
        &self,
        error: impl Into<ListenerError>,
    ) -> Result<(), DoubleResponseError> {
        self.respond_with_result(Err(error.into()))
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("exchange", &self.slot.shared.id())
            .field("index", &self.slot.index)
            .field("listener", &self.slot.listener)
            .field("responded", &self.slot.responded.load(Ordering::Acquire))
            .finish()
    }
}

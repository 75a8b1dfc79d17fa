//! The synchronous pass: invoke every listener once, in order, and classify
//! what each one did.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::exchange::{ExchangeShared, PendingPromise, Settlement};
use crate::responder::ResponderSlot;
use crate::{Invocation, ListenerEntry, ListenerError, Request, Responder, ResponseMode};

/// How one listener's synchronous turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// Returned without requesting an asynchronous response. `None` when the
    /// listener returned nothing.
    Value(Option<serde_json::Value>),

    /// Failed during its own turn.
    Thrown(ListenerError),

    /// Will respond later through its responder.
    DeferredCallback,

    /// Returned a promise that will settle later.
    DeferredPromise,
}

impl InvocationOutcome {
    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            InvocationOutcome::DeferredCallback | InvocationOutcome::DeferredPromise
        )
    }
}

/// Everything the synchronous pass produced.
pub(crate) struct SyncPass {
    pub(crate) outcomes: Vec<InvocationOutcome>,
    pub(crate) promises: Vec<PendingPromise>,

    /// Earliest-indexed synchronous answer, if any.
    pub(crate) candidate: Option<Settlement>,
}

impl SyncPass {
    pub(crate) fn deferred(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_deferred()).count()
    }
}

/// Invoke each entry with `request`, strictly in order.
///
/// Never suspends: a listener's turn, including inspection of what it
/// returned, completes before the next listener is invoked.
pub(crate) fn invoke_all(
    shared: &Arc<ExchangeShared>,
    request: &Request,
    entries: &[ListenerEntry],
    mode: ResponseMode,
) -> SyncPass {
    let mut pass = SyncPass {
        outcomes: Vec::with_capacity(entries.len()),
        promises: Vec::new(),
        candidate: None,
    };

    for (index, entry) in entries.iter().enumerate() {
        let slot = Arc::new(ResponderSlot::new(index, entry.id, shared.clone()));
        let responder = Responder::new(slot.clone());

        let returned = catch_unwind(AssertUnwindSafe(|| {
            entry.listener.on_message(request, responder)
        }))
        .unwrap_or_else(|panic| Err(ListenerError::from_panic(panic)));

        let outcome = match returned {
            Ok(Invocation::Done) => InvocationOutcome::Value(None),
            Ok(Invocation::Value(value)) => InvocationOutcome::Value(Some(value)),
            Ok(Invocation::RequestAsync) => InvocationOutcome::DeferredCallback,
            Ok(Invocation::Promise(future)) => {
                pass.promises.push(PendingPromise {
                    index,
                    listener: entry.id,
                    future,
                });
                InvocationOutcome::DeferredPromise
            }
            Err(error) => InvocationOutcome::Thrown(error),
        };

        if outcome.is_deferred() {
            shared.add_outstanding();
        }
        let responded = slot.end_turn(outcome == InvocationOutcome::DeferredCallback);
        drop(slot);

        tracing::trace!(
            exchange = %shared.id(),
            index,
            listener = %entry.id,
            ?outcome,
            responded_in_turn = responded.is_some(),
            "listener turn complete"
        );

        let answer = match (responded, &outcome) {
            (Some(response), _) => Some(response),
            (None, InvocationOutcome::Thrown(error)) => Some(Err(error.clone())),
            (None, InvocationOutcome::Value(Some(value))) if mode == ResponseMode::EagerValues => {
                Some(Ok(value.clone()))
            }
            _ => None,
        };

        if let Some(result) = answer {
            if pass.candidate.is_none() {
                shared.record_candidate(index);
                pass.candidate = Some(Settlement {
                    index,
                    listener: entry.id,
                    result,
                });
            } else {
                tracing::debug!(
                    exchange = %shared.id(),
                    index,
                    listener = %entry.id,
                    "synchronous answer pre-empted by an earlier listener"
                );
            }
        }

        pass.outcomes.push(outcome);
    }

    pass
}

//! End-to-end dispatch scenarios
//!
//! Each test plays the sender and the receiving context:
//! - A listener that answers from a spawned task after a delay
//! - A fast promise beating a slow one registered first
//! - A synchronous throw pre-empting a rejected promise
//! - Envelope delivery and listener registration during dispatch

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use expect_test::expect;
use omsg::{
    DispatchConfig, Dispatcher, Error, Invocation, InvocationOutcome, ListenerError,
    MessageSender, NoListenerPolicy, Request, Responder, Response, ResponseMode,
};
use serde_json::json;

fn ping() -> Request {
    Request::new("ping").unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "current_thread")]
async fn test_delayed_callback_response() {
    omsg_test::init_tracing();
    let dispatcher = Dispatcher::new();
    dispatcher.on_message(|request, responder| {
        if request.message != "ping" {
            return Ok(Invocation::Done);
        }
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            responder.respond("pong").expect("first response");
        });
        Ok(Invocation::RequestAsync)
    });

    let result = dispatcher.dispatch(ping()).await_result().await;
    assert_eq!(result, Ok(Response::Value(json!("pong"))));
}

#[tokio::test(flavor = "current_thread")]
async fn test_fast_promise_beats_slow_promise_registered_first() {
    let dispatcher = Dispatcher::new();
    dispatcher.registry().register(omsg_test::never_settles());
    dispatcher.registry().register(omsg_test::resolves(json!("fast")));

    let exchange = dispatcher.dispatch(ping());
    assert_eq!(
        exchange.outcomes(),
        &[
            InvocationOutcome::DeferredPromise,
            InvocationOutcome::DeferredPromise
        ]
    );
    assert_eq!(
        exchange.await_result().await,
        Ok(Response::Value(json!("fast")))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn test_sync_throw_pre_empts_rejected_promise() {
    let dispatcher = Dispatcher::new();
    dispatcher.registry().register(omsg_test::rejects("promise rejected"));
    dispatcher.registry().register(omsg_test::throws("sync error"));

    let err = dispatcher.dispatch(ping()).await_result().await.unwrap_err();
    assert_eq!(err, Error::Listener(ListenerError::new("sync error")));
    expect!["sync error"].assert_eq(&err.to_string());
}

#[tokio::test(flavor = "current_thread")]
async fn test_echo_in_turn() {
    let dispatcher = Dispatcher::new();
    dispatcher.registry().register(omsg_test::echo());

    let request = Request::new(json!({"kind": "greet", "name": "ada"})).unwrap();
    let result = dispatcher.dispatch(request).await_result().await;
    assert_eq!(
        result.map(Response::into_value),
        Ok(json!({"kind": "greet", "name": "ada"}))
    );
}

// ============================================================================
// Envelopes
// ============================================================================

#[tokio::test(flavor = "current_thread")]
async fn test_deliver_passes_sender_to_listeners() {
    let dispatcher = Dispatcher::new();
    dispatcher.on_message(|request, responder| {
        responder.respond(json!({
            "from": request.sender.id,
            "to": request.message["to"],
        }))?;
        Ok(Invocation::Done)
    });

    let envelope = r#"{"message": {"to": "popup"}, "sender": {"id": "ext-a", "url": "about:blank"}}"#;
    let result = dispatcher.deliver(envelope).unwrap().await_result().await;
    assert_eq!(
        result,
        Ok(Response::Value(json!({"from": "ext-a", "to": "popup"})))
    );
}

#[test]
fn test_deliver_rejects_malformed_envelope() {
    let dispatcher = Dispatcher::new();
    dispatcher.registry().register(omsg_test::echo());

    let err = dispatcher.deliver(r#"{"message": "#).unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)), "{err:?}");
}

#[tokio::test(flavor = "current_thread")]
async fn test_request_round_trips_through_deliver() {
    let dispatcher = Dispatcher::new();
    dispatcher.on_message(|request, responder| {
        responder.respond(json!(request.sender.clone().id))?;
        Ok(Invocation::Done)
    });

    let request = ping().with_sender(MessageSender::with_id("content-script"));
    let exchange = dispatcher.deliver(&request.to_json().unwrap()).unwrap();
    assert_eq!(
        exchange.await_result().await,
        Ok(Response::Value(json!("content-script")))
    );
}

// ============================================================================
// Registry changes around a dispatch
// ============================================================================

#[tokio::test(flavor = "current_thread")]
async fn test_listener_registered_during_dispatch_is_not_invoked() {
    let invoked = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Dispatcher::new();
    dispatcher.on_message({
        let invoked = invoked.clone();
        let registry = dispatcher.registry().clone();
        move |_request, _responder| {
            invoked.lock().unwrap().push("outer");
            let invoked = invoked.clone();
            registry.register(omsg_test::listener(move |_request, _responder| {
                invoked.lock().unwrap().push("inner");
                Ok(Invocation::Done)
            }));
            Ok(Invocation::Done)
        }
    });

    let exchange = dispatcher.dispatch(ping());
    assert_eq!(exchange.outcomes().len(), 1);
    assert_eq!(exchange.await_result().await, Ok(Response::NoResponse));
    assert_eq!(*invoked.lock().unwrap(), vec!["outer"]);

    // The next dispatch sees it.
    let _ = dispatcher.dispatch(ping());
    assert_eq!(*invoked.lock().unwrap(), vec!["outer", "outer", "inner"]);
}

#[tokio::test(flavor = "current_thread")]
async fn test_unregistered_listener_is_skipped() {
    let dispatcher = Dispatcher::new();
    let id = dispatcher.registry().register(omsg_test::throws("gone"));
    dispatcher.registry().register(omsg_test::responds_in_turn(json!("kept")));

    assert!(dispatcher.unregister(id));
    let result = dispatcher.dispatch(ping()).await_result().await;
    assert_eq!(result, Ok(Response::Value(json!("kept"))));
}

static CALLS: AtomicUsize = AtomicUsize::new(0);

fn counting(_request: &Request, _responder: Responder) -> Result<Invocation, ListenerError> {
    CALLS.fetch_add(1, Ordering::SeqCst);
    Ok(Invocation::Done)
}

#[tokio::test(flavor = "current_thread")]
async fn test_same_listener_registered_twice_runs_twice() {
    let dispatcher = Dispatcher::new();
    dispatcher.registry().register(counting);
    dispatcher.registry().register(counting);

    let exchange = dispatcher.dispatch(ping());
    assert_eq!(exchange.outcomes().len(), 2);
    assert_eq!(CALLS.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_from_json() {
    let config = DispatchConfig::from_json(
        r#"{"name": "popup", "response_mode": "eager_values", "no_listener_policy": "reject"}"#,
    )
    .unwrap();
    assert_eq!(config.name.as_deref(), Some("popup"));
    assert_eq!(config.response_mode, ResponseMode::EagerValues);
    assert_eq!(config.no_listener_policy, NoListenerPolicy::Reject);

    let config = DispatchConfig::from_json("{}").unwrap();
    assert_eq!(config, DispatchConfig::default());

    let err = DispatchConfig::from_json(r#"{"response_mode": "sometimes"}"#).unwrap_err();
    assert!(matches!(err, Error::Internal(_)), "{err:?}");
}

#[tokio::test(flavor = "current_thread")]
async fn test_dispatcher_with_config() {
    let dispatcher = Dispatcher::with_config(DispatchConfig {
        name: Some("options-page".into()),
        response_mode: ResponseMode::EagerValues,
        no_listener_policy: NoListenerPolicy::NoResponse,
    });
    dispatcher.registry().register(omsg_test::returns(json!(1)));

    assert_eq!(dispatcher.config().name.as_deref(), Some("options-page"));
    let result = dispatcher.dispatch(ping()).await_result().await;
    assert_eq!(result, Ok(Response::Value(json!(1))));
}

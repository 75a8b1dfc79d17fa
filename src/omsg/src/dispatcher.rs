use serde::{Deserialize, Serialize};

use crate::exchange::{Exchange, ExchangeId, ExchangeShared, Response};
use crate::invocation::invoke_all;
use crate::{Error, Invocation, ListenerError, ListenerId, ListenerRegistry, Request, Responder};

/// Which synchronous return values count as responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Only responders and promises answer. A plain returned value is inert.
    #[default]
    Callback,

    /// A returned [`Invocation::Value`] is also an eager response, for
    /// receivers that answer by returning a value.
    EagerValues,
}

/// What a dispatch into a context with no listeners resolves to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoListenerPolicy {
    /// Resolve with [`Response::NoResponse`].
    #[default]
    NoResponse,

    /// Fail with [`Error::NoReceiver`].
    Reject,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Name used in log spans.
    pub name: Option<String>,

    pub response_mode: ResponseMode,

    pub no_listener_policy: NoListenerPolicy,
}

impl DispatchConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::internal_error(format!("invalid config: {e}")))
    }
}

/// Delivers one-time messages to the listeners of one receiving context.
///
/// The dispatcher owns its [`ListenerRegistry`]; cloning the dispatcher
/// shares the registry.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    registry: ListenerRegistry,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            registry: ListenerRegistry::new(),
            config,
        }
    }

    /// Set the "name" of this dispatcher -- used only for debugging logs.
    pub fn name(mut self, name: impl ToString) -> Self {
        self.config.name = Some(name.to_string());
        self
    }

    pub fn response_mode(mut self, mode: ResponseMode) -> Self {
        self.config.response_mode = mode;
        self
    }

    pub fn no_listener_policy(mut self, policy: NoListenerPolicy) -> Self {
        self.config.no_listener_policy = policy;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Register a closure as a listener.
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Request, Responder) -> Result<Invocation, ListenerError> + Send + Sync + 'static,
    {
        self.registry.register(listener)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        self.registry.unregister(id)
    }

    /// Decode a serialized request envelope and dispatch it.
    pub fn deliver(&self, serialized: &str) -> Result<Exchange, Error> {
        let request = Request::parse(serialized)?;
        Ok(self.dispatch(request))
    }

    /// Run the synchronous pass for `request`.
    ///
    /// Every listener registered right now is invoked once, in registration
    /// order, before this returns. The returned exchange may already be
    /// settled (see [`Exchange::state`]).
    pub fn dispatch(&self, request: Request) -> Exchange {
        let entries = self.registry.snapshot();
        let id = ExchangeId::new();
        let (shared, result_rx) = ExchangeShared::new(id);

        tracing::debug!(
            exchange = %id,
            dispatcher = ?self.config.name,
            listeners = entries.len(),
            "dispatch"
        );

        let pass = invoke_all(&shared, &request, &entries, self.config.response_mode);

        let no_response = match (entries.is_empty(), self.config.no_listener_policy) {
            (true, NoListenerPolicy::Reject) => Err(Error::NoReceiver),
            _ => Ok(Response::NoResponse),
        };
        let deferred = pass.deferred();
        shared.end_sync_pass(pass.candidate, deferred, no_response);

        Exchange::new(
            shared,
            pass.outcomes,
            pass.promises,
            result_rx,
            self.config.name.clone(),
        )
    }
}

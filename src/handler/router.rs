//! Dispatch router mapping `(verb, resource)` to handlers.
//!
//! Registration is additive and may happen at any time, including while
//! sessions are dispatching. Dispatch takes a snapshot of the handler list
//! and runs it without holding the lock, so a request racing a registration
//! may or may not see the newest handler.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::Reply;
use crate::error::ValidationError;
use crate::protocol::{IdGenerator, Request, Response, Status, Verb};

/// Result type for handler functions.
pub type HandlerResult = anyhow::Result<Reply>;

/// A request handler.
///
/// Implemented for every `Fn(&Request) -> HandlerResult`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: &Request) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> HandlerResult + Send + Sync + 'static,
{
    fn call(&self, request: &Request) -> HandlerResult {
        self(request)
    }
}

/// Wrapper that deserializes the request body before calling the handler.
///
/// A body that does not fit `T` is a handler failure.
pub struct TypedHandler<F, T> {
    handler: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> TypedHandler<F, T>
where
    F: Fn(T, &Request) -> HandlerResult + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T> Handler for TypedHandler<F, T>
where
    F: Fn(T, &Request) -> HandlerResult + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    fn call(&self, request: &Request) -> HandlerResult {
        let body = request.body.clone().unwrap_or(Value::Null);
        let parsed: T = serde_json::from_value(body)
            .map_err(|e| anyhow::anyhow!("invalid body for {} {}: {}", request.verb, request.resource, e))?;
        (self.handler)(parsed, request)
    }
}

/// A registered `(verb, resource)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub verb: Verb,
    pub resource: String,
    /// Number of handlers registered for the pair.
    pub handlers: usize,
}

type Routes = HashMap<Verb, HashMap<String, Vec<Arc<dyn Handler>>>>;

/// Verb/resource dispatch table.
///
/// Owned by the server and shared with each session by `Arc`.
pub struct Router {
    routes: RwLock<Routes>,
    ids: IdGenerator,
    diagnostics: bool,
}

impl Router {
    /// Empty router. Diagnostics follow the build profile.
    pub fn new() -> Self {
        Self::with_diagnostics(cfg!(debug_assertions))
    }

    /// Empty router; `diagnostics` controls whether `500` bodies carry a traceback.
    pub fn with_diagnostics(diagnostics: bool) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            ids: IdGenerator::new(),
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> bool {
        self.diagnostics
    }

    /// Register a handler closure. Handlers for the same pair run in
    /// registration order.
    pub fn register<F>(&self, verb: Verb, resource: impl Into<String>, handler: F)
    where
        F: Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_handler(verb, resource, Arc::new(handler));
    }

    /// Register a handler whose body is deserialized into `T` first.
    pub fn register_typed<T, F>(&self, verb: Verb, resource: impl Into<String>, handler: F)
    where
        F: Fn(T, &Request) -> HandlerResult + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.register_handler(verb, resource, Arc::new(TypedHandler::new(handler)));
    }

    /// Register any [`Handler`] implementation.
    pub fn register_handler(&self, verb: Verb, resource: impl Into<String>, handler: Arc<dyn Handler>) {
        let resource = resource.into();
        tracing::debug!("Registering handler for {} {}", verb, resource);

        self.routes
            .write()
            .entry(verb)
            .or_default()
            .entry(resource)
            .or_default()
            .push(handler);
    }

    /// Every registered pair, sorted by verb then resource.
    pub fn routes(&self) -> Vec<Route> {
        let routes = self.routes.read();
        let mut listed: Vec<Route> = routes
            .iter()
            .flat_map(|(verb, by_resource)| {
                by_resource.iter().map(|(resource, handlers)| Route {
                    verb: *verb,
                    resource: resource.clone(),
                    handlers: handlers.len(),
                })
            })
            .collect();
        listed.sort_by(|a, b| {
            (a.verb.as_str(), a.resource.as_str()).cmp(&(b.verb.as_str(), b.resource.as_str()))
        });
        listed
    }

    /// Run every handler registered for the request, in order.
    ///
    /// Returns one response per handler, or a single `404` when nothing is
    /// registered. A failing or panicking handler yields a `500` for itself
    /// only; the handlers after it still run.
    pub fn dispatch(&self, request: &Request) -> Vec<Response> {
        let handlers = {
            let routes = self.routes.read();
            let Some(by_resource) = routes.get(&request.verb) else {
                tracing::info!("No handler found for {}", request.verb);
                return vec![self.not_found(request)];
            };
            let Some(handlers) = by_resource.get(&request.resource) else {
                tracing::info!("No handler found for {} on {}", request.verb, request.resource);
                return vec![self.not_found(request)];
            };
            handlers.clone()
        };

        handlers
            .iter()
            .map(|handler| self.invoke(handler.as_ref(), request))
            .collect()
    }

    /// The single `400` answering a request that failed validation.
    pub fn reject(&self, error: &ValidationError) -> Response {
        Response::with_message(
            self.ids.next_id(),
            error.request_id.clone(),
            Status::BAD_REQUEST,
            error.reason.clone(),
        )
    }

    fn invoke(&self, handler: &dyn Handler, request: &Request) -> Response {
        match panic::catch_unwind(AssertUnwindSafe(|| handler.call(request))) {
            Ok(Ok(reply)) => self.respond(request, reply.code, reply.body),
            Ok(Err(error)) => {
                tracing::warn!(
                    "Internal error when executing {} on {}: {}",
                    request.verb,
                    request.resource,
                    error
                );
                self.internal_error(request, error.to_string(), || format!("{error:?}"))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    "Handler panicked when executing {} on {}: {}",
                    request.verb,
                    request.resource,
                    message
                );
                self.internal_error(request, message.clone(), || format!("handler panicked: {message}"))
            }
        }
    }

    fn internal_error(
        &self,
        request: &Request,
        message: String,
        traceback: impl FnOnce() -> String,
    ) -> Response {
        let body = if self.diagnostics {
            json!({ "message": message, "traceback": traceback() })
        } else {
            json!({ "message": message })
        };
        self.respond(request, Status::INTERNAL_ERROR, Some(body))
    }

    fn not_found(&self, request: &Request) -> Response {
        self.respond(request, Status::NOT_FOUND, None)
    }

    fn respond(&self, request: &Request, code: Status, body: Option<Value>) -> Response {
        Response::new(self.ids.next_id(), request.id.clone(), code, body)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

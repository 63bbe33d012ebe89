//! Handler registry and lifecycle notifications.
//!
//! Two deliberately separate mechanisms:
//!
//! - **RPC dispatch** is single-slot: each call name maps to exactly one
//!   callback, and the first registration for a name wins. Inbound requests
//!   are routed to that one callback.
//! - **Lifecycle notifications** ([`ClientEvent`]) are a broadcast: every
//!   subscriber observes every event. They are never used for RPC.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Error returned by a handler callback.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure description; forwarded to the remote caller
    /// inside the error ACK.
    pub message: String,
}

impl HandlerError {
    /// Create a handler error from any displayable value.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Outcome of dispatching an inbound request to the registry.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// No callback is registered for the requested name.
    #[error("no handler registered for {name:?}")]
    NoHandler {
        /// The requested call name.
        name: String,
    },

    /// The callback ran and failed.
    #[error("handler for {name:?} failed: {message}")]
    HandlerFailed {
        /// The requested call name.
        name: String,
        /// Failure description from the handler.
        message: String,
    },
}

/// Type-erased async handler callback.
type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Maps call names to handler callbacks (single-dispatch).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `name`.
    ///
    /// The first registration for a name wins; later registrations for the
    /// same name are ignored with a warning.
    pub fn register<F, Fut>(&self, name: &str, callback: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| Box::pin(callback(args)));
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(name) {
            tracing::warn!(name, "handler already registered, keeping the first");
            return;
        }
        handlers.insert(name.to_string(), handler);
    }

    /// Whether a handler is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Invoke the handler registered for `name` with `args`.
    ///
    /// # Errors
    ///
    /// Returns `NoHandler` when nothing is registered for `name`, or
    /// `HandlerFailed` when the callback itself fails. Neither outcome may
    /// tear down the caller's frame-processing loop.
    pub async fn dispatch(&self, name: &str, args: Vec<Value>) -> Result<Value, DispatchError> {
        let handler = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            handlers.get(name).cloned()
        };

        let Some(handler) = handler else {
            return Err(DispatchError::NoHandler {
                name: name.to_string(),
            });
        };

        handler(args)
            .await
            .map_err(|e| DispatchError::HandlerFailed {
                name: name.to_string(),
                message: e.message,
            })
    }
}

/// Lifecycle notification broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The handshake completed and the client is routable.
    Connected {
        /// The relay-assigned identity for this connection.
        connection_id: String,
    },
    /// The connection was torn down, explicitly or by a transport failure.
    Disconnected,
}

/// Fan-out channel for [`ClientEvent`] values.
pub struct LifecycleEvents {
    tx: broadcast::Sender<ClientEvent>,
}

impl LifecycleEvents {
    /// Create a channel retaining at most `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to lifecycle events. Each subscriber sees every event
    /// emitted after it subscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let registry = HandlerRegistry::new();
        registry.register("add", |args: Vec<Value>| async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        let result = registry.dispatch("add", vec![json!(2), json!(3)]).await;
        assert_eq!(result.expect("dispatch"), json!(5));
    }

    #[tokio::test]
    async fn test_dispatch_without_handler() {
        let registry = HandlerRegistry::new();
        let result = registry.dispatch("missing", vec![]).await;
        assert!(matches!(result, Err(DispatchError::NoHandler { .. })));
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let registry = HandlerRegistry::new();
        registry.register("answer", |_| async { Ok(json!("first")) });
        registry.register("answer", |_| async { Ok(json!("second")) });

        let result = registry.dispatch("answer", vec![]).await;
        assert_eq!(result.expect("dispatch"), json!("first"));
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported() {
        let registry = HandlerRegistry::new();
        registry.register("broken", |_| async { Err(HandlerError::new("boom")) });

        let result = registry.dispatch("broken", vec![]).await;
        match result {
            Err(DispatchError::HandlerFailed { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("expected HandlerFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_fan_out() {
        let events = LifecycleEvents::new(4);
        let mut first = events.subscribe();
        let mut second = events.subscribe();

        events.emit(ClientEvent::Connected {
            connection_id: "conn-1".to_string(),
        });

        let expected = ClientEvent::Connected {
            connection_id: "conn-1".to_string(),
        };
        assert_eq!(first.recv().await.expect("first"), expected);
        assert_eq!(second.recv().await.expect("second"), expected);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let events = LifecycleEvents::new(4);
        events.emit(ClientEvent::Disconnected);
    }
}

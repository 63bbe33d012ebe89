//! Dispatcher: routes inbound envelopes once a connection is live.
//!
//! Frames are handed over one at a time, in arrival order. Requests are
//! executed on spawned tasks so a slow handler never stalls unrelated
//! frames; the eventual ACK is attributed through the captured token.
//! Replies resolve the pending call for their token. Everything that does
//! not conform to the protocol is logged, counted, and dropped — never
//! fatal to the stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::calls::CallRegistry;
use crate::error::ClientError;
use crate::registry::HandlerRegistry;
use crate::wire::{Envelope, TYPE_ACK, TYPE_REQ};

/// Routes inbound frames to handlers and pending calls.
pub struct Dispatcher {
    /// This connection's relay-assigned identity.
    identity: String,
    handlers: Arc<HandlerRegistry>,
    calls: Arc<CallRegistry>,
    outbound: mpsc::UnboundedSender<Envelope>,
    protocol_errors: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Create a dispatcher for a connection with the given identity.
    pub fn new(
        identity: String,
        handlers: Arc<HandlerRegistry>,
        calls: Arc<CallRegistry>,
        outbound: mpsc::UnboundedSender<Envelope>,
        protocol_errors: Arc<AtomicU64>,
    ) -> Self {
        Self {
            identity,
            handlers,
            calls,
            outbound,
            protocol_errors,
        }
    }

    fn violation(&self, context: &str, envelope: &Envelope) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            kind = %envelope.payload.kind,
            from = %envelope.from,
            context,
            "dropping non-conforming frame"
        );
    }

    /// Process one inbound envelope.
    pub fn handle_frame(&self, envelope: Envelope) {
        if envelope.to != self.identity {
            self.violation("frame addressed to a different identity", &envelope);
            return;
        }

        match envelope.payload.kind.as_str() {
            TYPE_REQ => self.handle_request(envelope),
            TYPE_ACK => self.handle_reply(envelope),
            other => {
                tracing::warn!(kind = other, "unexpected payload type, dropping frame");
                self.protocol_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_request(&self, envelope: Envelope) {
        let Some(token) = envelope.payload.data.token.clone() else {
            self.violation("request without a token", &envelope);
            return;
        };
        let Some(name) = envelope.payload.data.name.clone() else {
            self.violation("request without a name", &envelope);
            return;
        };
        let args = envelope.payload.data.args.clone().unwrap_or_default();

        let handlers = Arc::clone(&self.handlers);
        let outbound = self.outbound.clone();
        let identity = self.identity.clone();
        let caller = envelope.from;

        // Handlers may suspend; run each on its own task so the frame loop
        // keeps draining unrelated traffic.
        tokio::spawn(async move {
            let ack = match handlers.dispatch(&name, args).await {
                Ok(ret) => Envelope::ack(&caller, &identity, &token, ret),
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "request handling failed, replying with error");
                    Envelope::ack_error(&caller, &identity, &token, &e.to_string())
                }
            };
            if outbound.send(ack).is_err() {
                tracing::debug!(token = %token, "connection closed before the reply could be sent");
            }
        });
    }

    fn handle_reply(&self, envelope: Envelope) {
        let Some(token) = envelope.payload.data.token.clone() else {
            self.violation("reply without a token", &envelope);
            return;
        };

        let reply = match envelope.payload.data.error {
            Some(message) => Err(ClientError::CallFailed { message }),
            None => Ok(envelope.payload.data.ret.unwrap_or(Value::Null)),
        };
        self.calls.resolve(&token, reply);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::registry::HandlerError;
    use crate::wire::Payload;

    struct Fixture {
        dispatcher: Dispatcher,
        calls: Arc<CallRegistry>,
        outbound_rx: mpsc::UnboundedReceiver<Envelope>,
        protocol_errors: Arc<AtomicU64>,
    }

    fn fixture(handlers: Arc<HandlerRegistry>) -> Fixture {
        let calls = Arc::new(CallRegistry::new("self"));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let protocol_errors = Arc::new(AtomicU64::new(0));
        let dispatcher = Dispatcher::new(
            "self-id".to_string(),
            handlers,
            Arc::clone(&calls),
            outbound_tx,
            Arc::clone(&protocol_errors),
        );
        Fixture {
            dispatcher,
            calls,
            outbound_rx,
            protocol_errors,
        }
    }

    #[tokio::test]
    async fn test_request_produces_ack_with_return_value() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("add", |args: Vec<Value>| async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        let mut fx = fixture(handlers);

        fx.dispatcher.handle_frame(Envelope::request(
            "self-id",
            "peer-id",
            "peer:1",
            "add",
            vec![json!(2), json!(3)],
        ));

        let ack = fx.outbound_rx.recv().await.expect("ack");
        assert_eq!(ack.to, "peer-id");
        assert_eq!(ack.from, "self-id");
        assert_eq!(ack.payload.kind, TYPE_ACK);
        assert_eq!(ack.payload.data.token.as_deref(), Some("peer:1"));
        assert_eq!(ack.payload.data.ret, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_request_without_handler_produces_error_ack() {
        let mut fx = fixture(Arc::new(HandlerRegistry::new()));

        fx.dispatcher.handle_frame(Envelope::request(
            "self-id",
            "peer-id",
            "peer:2",
            "missing",
            vec![],
        ));

        let ack = fx.outbound_rx.recv().await.expect("ack");
        assert_eq!(ack.payload.data.ret, None);
        let error = ack.payload.data.error.expect("error indicator");
        assert!(error.contains("missing"));
    }

    #[tokio::test]
    async fn test_failing_handler_produces_error_ack() {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("broken", |_| async { Err(HandlerError::new("boom")) });
        let mut fx = fixture(handlers);

        fx.dispatcher.handle_frame(Envelope::request(
            "self-id",
            "peer-id",
            "peer:3",
            "broken",
            vec![],
        ));

        let ack = fx.outbound_rx.recv().await.expect("ack");
        let error = ack.payload.data.error.expect("error indicator");
        assert!(error.contains("boom"));
    }

    #[tokio::test]
    async fn test_reply_resolves_pending_call() {
        let fx = fixture(Arc::new(HandlerRegistry::new()));
        let rx = fx.calls.register("self:1".to_string());

        fx.dispatcher
            .handle_frame(Envelope::ack("self-id", "peer-id", "self:1", json!("done")));

        assert_eq!(rx.await.expect("reply"), Ok(json!("done")));
        assert_eq!(fx.calls.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_fails_pending_call() {
        let fx = fixture(Arc::new(HandlerRegistry::new()));
        let rx = fx.calls.register("self:2".to_string());

        fx.dispatcher.handle_frame(Envelope::ack_error(
            "self-id",
            "peer-id",
            "self:2",
            "no handler",
        ));

        let reply = rx.await.expect("reply");
        assert_eq!(
            reply,
            Err(ClientError::CallFailed {
                message: "no handler".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_reply_token_is_not_fatal() {
        let fx = fixture(Arc::new(HandlerRegistry::new()));

        fx.dispatcher
            .handle_frame(Envelope::ack("self-id", "peer-id", "never-issued", json!(1)));

        assert_eq!(fx.calls.late_acks(), 1);
        assert_eq!(fx.protocol_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_unexpected_type_counts_protocol_error() {
        let fx = fixture(Arc::new(HandlerRegistry::new()));

        fx.dispatcher.handle_frame(Envelope {
            to: "self-id".to_string(),
            from: "peer-id".to_string(),
            payload: Payload {
                kind: "gossip".to_string(),
                data: Default::default(),
            },
        });

        assert_eq!(fx.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_misaddressed_frame_is_dropped() {
        let fx = fixture(Arc::new(HandlerRegistry::new()));
        let rx = fx.calls.register("self:9".to_string());

        fx.dispatcher
            .handle_frame(Envelope::ack("someone-else", "peer-id", "self:9", json!(1)));

        assert_eq!(fx.protocol_errors.load(Ordering::Relaxed), 1);
        // The pending call is untouched.
        assert_eq!(fx.calls.outstanding(), 1);
        drop(rx);
    }
}

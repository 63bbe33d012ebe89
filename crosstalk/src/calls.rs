//! Pending-call registry: correlation tokens and reply delivery.
//!
//! Every outbound call registers a token here and parks on a oneshot
//! channel. The entry is removed by exactly one of two events, whichever
//! comes first: the matching ACK ([`CallRegistry::resolve`]) or the call
//! deadline ([`CallRegistry::discard`]). Removal from the map is the single
//! state transition, so the losing event is always a no-op.
//!
//! Tokens are `<client id>:<sequence>` from a per-client monotonic counter.
//! Uniqueness is only needed among one client's outstanding calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ClientError;

/// Reply delivered to a waiting caller: the ACK's return value, or the
/// error the ACK carried instead.
pub type CallReply = Result<Value, ClientError>;

type PendingMap = HashMap<String, oneshot::Sender<CallReply>>;

/// Tracks outstanding calls for one client.
pub struct CallRegistry {
    client_id: String,
    seq: AtomicU64,
    pending: Mutex<PendingMap>,
    late_acks: AtomicU64,
}

impl CallRegistry {
    /// Create a registry issuing tokens prefixed with `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            late_acks: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a correlation token unique among this client's outstanding
    /// calls.
    pub fn next_token(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}:{}", self.client_id, seq)
    }

    /// Register a pending call and return the receiver its reply will be
    /// delivered on.
    pub fn register(&self, token: String) -> oneshot::Receiver<CallReply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(token, tx);
        rx
    }

    /// Deliver an ACK to the pending call for `token`.
    ///
    /// Returns `false` for a duplicate, late, or never-issued token; such
    /// ACKs are counted and dropped, never treated as fatal.
    pub fn resolve(&self, token: &str, reply: CallReply) -> bool {
        let Some(tx) = self.lock().remove(token) else {
            self.late_acks.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(token, "ack without a pending call, dropping");
            return false;
        };
        if tx.send(reply).is_err() {
            // The caller stopped waiting between removal and delivery.
            tracing::debug!(token, "pending caller gone before reply delivery");
        }
        true
    }

    /// Remove the pending call for `token` without delivering a reply
    /// (deadline expiry). Returns `false` if an ACK already claimed it.
    pub fn discard(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    /// Number of currently outstanding calls.
    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    /// Number of ACKs that arrived without a matching pending call.
    pub fn late_acks(&self) -> u64 {
        self.late_acks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_tokens_are_unique_and_prefixed() {
        let calls = CallRegistry::new("client-a");
        let first = calls.next_token();
        let second = calls.next_token();
        assert_ne!(first, second);
        assert!(first.starts_with("client-a:"));
    }

    #[tokio::test]
    async fn test_register_resolve_roundtrip() {
        let calls = CallRegistry::new("c");
        let token = calls.next_token();
        let rx = calls.register(token.clone());
        assert_eq!(calls.outstanding(), 1);

        assert!(calls.resolve(&token, Ok(json!(5))));
        assert_eq!(calls.outstanding(), 0);
        assert_eq!(rx.await.expect("reply"), Ok(json!(5)));
    }

    #[test]
    fn test_resolve_unknown_token_is_counted() {
        let calls = CallRegistry::new("c");
        assert!(!calls.resolve("c:999", Ok(json!(null))));
        assert_eq!(calls.late_acks(), 1);
    }

    #[test]
    fn test_discard_removes_entry() {
        let calls = CallRegistry::new("c");
        let token = calls.next_token();
        let _rx = calls.register(token.clone());

        assert!(calls.discard(&token));
        assert_eq!(calls.outstanding(), 0);
        // The entry is gone; the late ACK is a no-op.
        assert!(!calls.resolve(&token, Ok(json!(1))));
        assert_eq!(calls.late_acks(), 1);
    }

    #[test]
    fn test_resolve_and_discard_are_mutually_exclusive() {
        let calls = CallRegistry::new("c");
        let token = calls.next_token();
        let _rx = calls.register(token.clone());

        let resolved = calls.resolve(&token, Ok(json!(1)));
        let discarded = calls.discard(&token);
        assert!(resolved ^ discarded);
    }
}

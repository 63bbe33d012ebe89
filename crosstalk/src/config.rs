//! Client configuration.
//!
//! Defaults are merged with caller overrides once, at construction. There is
//! no ambient process-wide configuration and no environment lookup.

use std::time::Duration;

/// Default round-trip deadline for the handshake and for calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the lifecycle notification channel.
pub const DEFAULT_LISTENERS: usize = 100;

/// How the relay reports a connection's own identity after transport open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeConvention {
    /// The client sends a probe carrying a one-shot token; the relay echoes
    /// an envelope addressed to the sender (`to == from`) with the same
    /// token, and the identity is read from `to`.
    #[default]
    Loopback,

    /// The relay pushes a `whoami` message carrying the identity in
    /// `data.connection_id`. The probe is still sent, since some relays
    /// only react to inbound traffic; non-identity frames are dropped until
    /// the push arrives.
    Whoami,
}

/// Configuration for client behavior.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address to dial (`host:port`).
    pub endpoint: String,

    /// Deadline applied to the handshake and to each call round-trip.
    pub timeout: Duration,

    /// Maximum concurrent lifecycle-notification subscribers; bounds the
    /// broadcast channel capacity.
    pub listeners: usize,

    /// Handshake convention the relay speaks.
    pub handshake: HandshakeConvention,
}

impl ClientConfig {
    /// Create a configuration for the given endpoint with default settings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            listeners: DEFAULT_LISTENERS,
            handshake: HandshakeConvention::default(),
        }
    }

    /// Override the handshake/call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the lifecycle subscriber capacity.
    pub fn with_listeners(mut self, listeners: usize) -> Self {
        self.listeners = listeners;
        self
    }

    /// Override the handshake convention.
    pub fn with_handshake(mut self, handshake: HandshakeConvention) -> Self {
        self.handshake = handshake;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("127.0.0.1:4600");
        assert_eq!(config.endpoint, "127.0.0.1:4600");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.listeners, DEFAULT_LISTENERS);
        assert_eq!(config.handshake, HandshakeConvention::Loopback);
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::new("relay:9000")
            .with_timeout(Duration::from_millis(250))
            .with_listeners(8)
            .with_handshake(HandshakeConvention::Whoami);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.listeners, 8);
        assert_eq!(config.handshake, HandshakeConvention::Whoami);
    }
}

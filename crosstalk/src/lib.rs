//! # Crosstalk
//!
//! Relay-addressed RPC between processes over a single persistent socket.
//!
//! Each process holds one socket to a shared relay. The relay assigns every
//! connection an opaque identity and forwards envelopes between connections
//! by that identity; processes use it to invoke named handlers on each
//! other and await the reply, with any number of calls multiplexed over the
//! one socket.
//!
//! This crate provides:
//! - **Client**: connection lifecycle with a handshake that discovers the
//!   connection's own identity
//! - **Wire format**: a strict, versioned JSON envelope with length-prefixed
//!   framing
//! - **Call correlation**: token-based pairing of requests with their
//!   asynchronous replies, bounded by deadlines
//! - **SingleFlight**: the idempotency primitive that makes connect/close
//!   safe under concurrent invocation
//!
//! # Quick Start
//!
//! ```ignore
//! use crosstalk::{Client, ClientConfig};
//! use serde_json::json;
//!
//! let client = Client::new(ClientConfig::new("relay.internal:4600"));
//! client.register("add", |args| async move {
//!     let a = args[0].as_i64().unwrap_or(0);
//!     let b = args[1].as_i64().unwrap_or(0);
//!     Ok(json!(a + b))
//! });
//! client.connect().await?;
//!
//! // Another process, knowing this client's connection identity:
//! let sum = client.call(&peer_identity, "add", vec![json!(2), json!(3)]).await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Pending-call registry: correlation tokens and reply delivery.
pub mod calls;

/// The client: public API over one relay connection.
pub mod client;

/// Client configuration.
pub mod config;

/// Connection lifecycle: state machine, handshake, frame loops.
pub mod connection;

/// Dispatcher for inbound envelopes.
pub mod dispatch;

/// Error types for client operations.
pub mod error;

/// Handler registry and lifecycle notifications.
pub mod registry;

/// Single-flight guard for one-shot async operations.
pub mod single_flight;

/// Transport seam and TCP implementation.
pub mod transport;

/// Wire protocol: envelope schema and frame codec.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use calls::CallRegistry;
pub use client::Client;
pub use config::{ClientConfig, HandshakeConvention, DEFAULT_LISTENERS, DEFAULT_TIMEOUT};
pub use connection::ConnectionState;
pub use error::{ClientError, ClientResult};
pub use registry::{ClientEvent, DispatchError, HandlerError, HandlerRegistry};
pub use single_flight::SingleFlight;
pub use transport::{Connector, TcpConnector};
pub use wire::{Envelope, Payload, PayloadData, WireError, MAX_FRAME_SIZE};

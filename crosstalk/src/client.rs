//! The client: connection lifecycle, call correlation, and handler
//! registration behind one handle.
//!
//! A [`Client`] owns exactly one transport at a time and is cheap to clone;
//! clones share the same connection, handlers, and pending calls. Connect
//! and close are idempotent under concurrency: both run behind a reentrant
//! single-flight guard, so racing invocations coalesce onto one execution
//! and the client can be reconnected after a close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::calls::CallRegistry;
use crate::config::ClientConfig;
use crate::connection::{self, ConnState, ConnectionState, Link};
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, ClientResult};
use crate::registry::{ClientEvent, HandlerError, HandlerRegistry, LifecycleEvents};
use crate::single_flight::SingleFlight;
use crate::transport::{Connector, TcpConnector};
use crate::wire::Envelope;

/// A relay client: one persistent socket, addressable by the relay-assigned
/// connection identity, multiplexing request/response calls to peers.
pub struct Client<C: Connector = TcpConnector> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Connector> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<C: Connector> {
    /// Locally generated opaque identity; prefixes correlation tokens.
    client_id: String,
    config: ClientConfig,
    connector: C,
    handlers: Arc<HandlerRegistry>,
    calls: Arc<CallRegistry>,
    events: LifecycleEvents,
    conn: Mutex<ConnState>,
    connect_guard: SingleFlight<ClientResult<()>>,
    close_guard: SingleFlight<ClientResult<()>>,
    protocol_errors: Arc<AtomicU64>,
}

impl Client<TcpConnector> {
    /// Create a client for the given configuration, dialing over TCP.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: Connector> Client<C> {
    /// Create a client using a custom transport.
    pub fn with_connector(config: ClientConfig, connector: C) -> Self {
        let client_id = format!("client-{}", Uuid::new_v4());
        tracing::debug!(client_id = %client_id, endpoint = %config.endpoint, "client created");
        Self {
            inner: Arc::new(ClientInner {
                calls: Arc::new(CallRegistry::new(client_id.clone())),
                client_id,
                events: LifecycleEvents::new(config.listeners),
                config,
                connector,
                handlers: Arc::new(HandlerRegistry::new()),
                conn: Mutex::new(ConnState::new()),
                connect_guard: SingleFlight::reentrant(),
                close_guard: SingleFlight::reentrant(),
                protocol_errors: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// The locally generated client identity.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The relay-assigned identity for the current connection, if any.
    /// Peers address calls to this value. Changes across reconnects.
    pub fn connection_id(&self) -> Option<String> {
        let conn = self.inner.conn_lock();
        if conn.identity.is_empty() {
            None
        } else {
            Some(conn.identity.clone())
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.conn_lock().state
    }

    /// Whether the client is connected and routable.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of calls currently awaiting a reply.
    pub fn outstanding_calls(&self) -> usize {
        self.inner.calls.outstanding()
    }

    /// Number of non-conforming inbound frames dropped so far.
    pub fn protocol_errors(&self) -> u64 {
        self.inner.protocol_errors.load(Ordering::Relaxed)
    }

    /// Register a handler for inbound calls named `name`. The first
    /// registration for a name wins.
    pub fn register<F, Fut>(&self, name: &str, callback: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.inner.handlers.register(name, callback);
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Connect to the relay and learn this connection's identity.
    ///
    /// Concurrent invocations coalesce onto one handshake; after a close the
    /// client can connect again.
    ///
    /// # Errors
    ///
    /// `AlreadyConnected` when a connection is live, `HandshakeTimeout` when
    /// the relay does not report an identity in time (the half-open
    /// transport is discarded), or `Transport` for dial/socket failures.
    pub async fn connect(&self) -> ClientResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .connect_guard
            .run(async move { inner.do_connect().await })
            .await
    }

    /// Tear the connection down.
    ///
    /// Concurrent invocations coalesce; closing a client with no live
    /// transport is a no-op. Outstanding calls are left to their deadlines.
    pub async fn close(&self) -> ClientResult<()> {
        self.inner.close_shared().await
    }

    /// Invoke the handler named `name` on the peer at `to` and await its
    /// reply.
    ///
    /// # Errors
    ///
    /// `NotConnected` when no connection is live, `CallTimeout` when no ACK
    /// arrives within the configured deadline, or `CallFailed` when the
    /// peer reports a missing or failing handler.
    pub async fn call(&self, to: &str, name: &str, args: Vec<Value>) -> ClientResult<Value> {
        let (identity, outbound) = {
            let conn = self.inner.conn_lock();
            if conn.state != ConnectionState::Connected {
                return Err(ClientError::NotConnected);
            }
            let Some(link) = conn.link.as_ref() else {
                return Err(ClientError::NotConnected);
            };
            (conn.identity.clone(), link.outbound.clone())
        };

        let token = self.inner.calls.next_token();
        let reply_rx = self.inner.calls.register(token.clone());
        tracing::debug!(token = %token, to, name, "sending call");

        let envelope = Envelope::request(to, &identity, &token, name, args);
        if outbound.send(envelope).is_err() {
            self.inner.calls.discard(&token);
            return Err(ClientError::NotConnected);
        }

        match tokio::time::timeout(self.inner.config.timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                self.inner.calls.discard(&token);
                Err(ClientError::Transport {
                    message: "reply channel closed".to_string(),
                })
            }
            Err(_) => {
                // The deadline won the race; a late ACK finds no pending
                // call and is dropped by the registry.
                self.inner.calls.discard(&token);
                tracing::debug!(token = %token, "call expired without a reply");
                Err(ClientError::CallTimeout {
                    timeout: self.inner.config.timeout,
                })
            }
        }
    }
}

impl<C: Connector> ClientInner<C> {
    fn conn_lock(&self) -> MutexGuard<'_, ConnState> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn close_shared(self: &Arc<Self>) -> ClientResult<()> {
        let inner = Arc::clone(self);
        self.close_guard
            .run(async move { inner.do_close().await })
            .await
    }

    async fn do_connect(self: Arc<Self>) -> ClientResult<()> {
        {
            let mut conn = self.conn_lock();
            if conn.state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            conn.state = ConnectionState::Connecting;
        }
        tracing::debug!(endpoint = %self.config.endpoint, "connecting");

        let probe_token = self.calls.next_token();
        let handshake = tokio::time::timeout(self.config.timeout, async {
            let mut stream = self.connector.connect(&self.config.endpoint).await?;
            self.conn_lock().state = ConnectionState::AwaitingIdentity;
            let (identity, leftover) =
                connection::perform_handshake(&mut stream, self.config.handshake, &probe_token)
                    .await?;
            Ok::<_, ClientError>((stream, identity, leftover))
        })
        .await;

        let (stream, identity, leftover) = match handshake {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                self.conn_lock().state = ConnectionState::Disconnected;
                return Err(e);
            }
            Err(_elapsed) => {
                // The timed-out future was dropped, and the half-open
                // transport with it; the next connect starts clean.
                self.conn_lock().state = ConnectionState::Disconnected;
                return Err(ClientError::HandshakeTimeout {
                    timeout: self.config.timeout,
                });
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(
            identity.clone(),
            Arc::clone(&self.handlers),
            Arc::clone(&self.calls),
            outbound_tx.clone(),
            Arc::clone(&self.protocol_errors),
        );

        // A transport loss funnels into the same guarded close path as an
        // explicit close. The frame loop has already returned when this
        // runs, so the close can join it without waiting on itself.
        let weak = Arc::downgrade(&self);
        let on_transport_loss: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    let _ = inner.close_shared().await;
                });
            }
        });

        let writer = tokio::spawn(connection::writer_loop(
            write_half,
            outbound_rx,
            shutdown_rx.clone(),
        ));
        let reader = tokio::spawn(connection::reader_loop(
            read_half,
            leftover,
            dispatcher,
            shutdown_rx,
            Arc::clone(&self.protocol_errors),
            on_transport_loss,
        ));

        {
            let mut conn = self.conn_lock();
            conn.state = ConnectionState::Connected;
            conn.identity = identity.clone();
            conn.link = Some(Link {
                outbound: outbound_tx,
                shutdown: shutdown_tx,
                reader,
                writer,
            });
        }
        tracing::debug!(identity = %identity, "connected");
        self.events.emit(ClientEvent::Connected {
            connection_id: identity,
        });
        Ok(())
    }

    async fn do_close(self: Arc<Self>) -> ClientResult<()> {
        let link = {
            let mut conn = self.conn_lock();
            let Some(link) = conn.link.take() else {
                // Nothing to tear down; close on a disconnected client
                // (or one that already closed itself) is a no-op.
                return Ok(());
            };
            conn.state = ConnectionState::Closing;
            link
        };
        tracing::debug!("closing connection");

        let _ = link.shutdown.send(true);
        let _ = link.writer.await;
        let _ = link.reader.await;

        {
            let mut conn = self.conn_lock();
            conn.state = ConnectionState::Disconnected;
            conn.identity.clear();
        }
        self.events.emit(ClientEvent::Disconnected);
        Ok(())
    }
}

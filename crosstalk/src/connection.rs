//! Connection lifecycle: state machine, handshake, and the background
//! reader/writer tasks that own the two halves of the transport.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──transport open──► AwaitingIdentity
//!       ▲                                                          │
//!       │                                                 handshake reply
//!       │                                                          ▼
//!   Disconnected ◄──transport closed── Closing ◄──close()──── Connected
//! ```
//!
//! A transport error or unsolicited close while `AwaitingIdentity` or
//! `Connected` funnels into the same close path as an explicit `close()`;
//! the caller guards that path so the two cannot race.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::HandshakeConvention;
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, ClientResult};
use crate::wire::{
    self, Envelope, TYPE_LOOPBACK, TYPE_WHOAMI,
};

/// Read chunk size for the frame loop.
const READ_CHUNK_SIZE: usize = 4096;

/// Client connection state, mutated only by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; the client is constructed or fully closed.
    Disconnected,
    /// Dialing the relay.
    Connecting,
    /// Transport open, probe sent, waiting for the identity reply.
    AwaitingIdentity,
    /// Handshake complete; calls are routable.
    Connected,
    /// Teardown in progress.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingIdentity => "awaiting-identity",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Handles to a live connection's background tasks and outbound queue.
pub(crate) struct Link {
    /// Queue drained by the writer task; senders never block on socket I/O.
    pub outbound: mpsc::UnboundedSender<Envelope>,
    /// Shutdown signal observed by both tasks.
    pub shutdown: watch::Sender<bool>,
    /// Frame-parsing task owning the read half.
    pub reader: JoinHandle<()>,
    /// Queue-draining task owning the write half.
    pub writer: JoinHandle<()>,
}

/// Connection state owned by one client.
pub(crate) struct ConnState {
    pub state: ConnectionState,
    /// Relay-assigned identity; empty exactly while disconnected.
    pub identity: String,
    pub link: Option<Link>,
}

impl ConnState {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            identity: String::new(),
            link: None,
        }
    }
}

/// Drive the handshake on a freshly opened transport.
///
/// Sends the probe, then reads frames until one matches the configured
/// convention; every other frame received during the handshake is dropped.
/// Returns the learned identity plus any bytes read beyond the identity
/// frame, which must be fed to the frame loop.
///
/// The caller bounds this with the configured timeout and discards the
/// transport on expiry.
pub(crate) async fn perform_handshake<S>(
    stream: &mut S,
    convention: HandshakeConvention,
    probe_token: &str,
) -> ClientResult<(String, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let probe = wire::encode_frame(&Envelope::probe(probe_token))
        .map_err(|e| ClientError::Transport {
            message: e.to_string(),
        })?;
    stream.write_all(&probe).await?;
    tracing::debug!(probe_token, "handshake probe sent");

    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ClientError::Transport {
                message: "connection closed during handshake".to_string(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        loop {
            let (body, consumed) = match wire::try_split_frame(&buf) {
                Ok(Some(split)) => split,
                Ok(None) => break,
                Err(e) => {
                    return Err(ClientError::Transport {
                        message: e.to_string(),
                    })
                }
            };

            let envelope = match wire::decode_envelope(body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(error = %e, "dropping malformed frame during handshake");
                    buf.drain(..consumed);
                    continue;
                }
            };
            buf.drain(..consumed);

            if let Some(identity) = identity_from(&envelope, convention, probe_token) {
                tracing::debug!(identity = %identity, "handshake complete");
                return Ok((identity, buf));
            }
            tracing::debug!(kind = %envelope.payload.kind, "ignoring frame during handshake");
        }
    }
}

/// Extract this connection's identity from a handshake-phase frame, if the
/// frame is the identity reply the convention promises.
fn identity_from(
    envelope: &Envelope,
    convention: HandshakeConvention,
    probe_token: &str,
) -> Option<String> {
    match convention {
        HandshakeConvention::Loopback => {
            let echoed = envelope.payload.kind == TYPE_LOOPBACK
                && envelope.payload.data.token.as_deref() == Some(probe_token)
                && !envelope.to.is_empty()
                && envelope.to == envelope.from;
            echoed.then(|| envelope.to.clone())
        }
        HandshakeConvention::Whoami => {
            if envelope.payload.kind != TYPE_WHOAMI {
                return None;
            }
            envelope
                .payload
                .data
                .connection_id
                .clone()
                .filter(|id| !id.is_empty())
        }
    }
}

/// Frame loop: owns the read half, parses inbound frames, and hands each
/// envelope to the dispatcher in arrival order.
///
/// Exits on the shutdown signal (explicit close), or on transport
/// EOF/error/unrecoverable framing, in which case `on_transport_loss` is
/// invoked to funnel the teardown through the guarded close path.
pub(crate) async fn reader_loop<R>(
    mut reader: R,
    mut buf: Vec<u8>,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
    protocol_errors: Arc<AtomicU64>,
    on_transport_loss: Box<dyn FnOnce() + Send>,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                tracing::debug!("frame loop stopping on shutdown signal");
                return;
            }

            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => {
                        tracing::debug!("transport closed by peer");
                        on_transport_loss();
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(error = %e, "transport read failed");
                        on_transport_loss();
                        return;
                    }
                };
                buf.extend_from_slice(&chunk[..n]);

                loop {
                    let (body, consumed) = match wire::try_split_frame(&buf) {
                        Ok(Some(split)) => split,
                        Ok(None) => break,
                        Err(e) => {
                            // Framing cannot be resynchronized.
                            tracing::warn!(error = %e, "unrecoverable framing error, dropping connection");
                            protocol_errors.fetch_add(1, Ordering::Relaxed);
                            on_transport_loss();
                            return;
                        }
                    };

                    match wire::decode_envelope(body) {
                        Ok(envelope) => dispatcher.handle_frame(envelope),
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed frame");
                            protocol_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    buf.drain(..consumed);
                }
            }
        }
    }
}

/// Writer loop: owns the write half and drains the outbound queue.
///
/// Exits on the shutdown signal, when every sender is gone, or on a write
/// failure (the frame loop observes the broken socket and triggers the
/// close path).
pub(crate) async fn writer_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                tracing::debug!("writer stopping on shutdown signal");
                break;
            }

            maybe = outbound.recv() => {
                let Some(envelope) = maybe else { break };
                let frame = match wire::encode_frame(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unencodable outbound frame");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&frame).await {
                    tracing::debug!(error = %e, "transport write failed");
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

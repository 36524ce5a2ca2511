//! WebSocket Session Transport
//!
//! Runs a read pump and a write pump per upgraded socket.
//!
//! - Read pump: a `"ping"` text frame is answered with `"pong"` on the
//!   outbound text channel. Any other text or binary frame is forwarded as
//!   raw bytes to the caller's forward channel. A close frame, read error
//!   or end of stream drops the forward sender, which the route handler
//!   sees as "client gone".
//! - Write pump: selects over the outbound text channel, the outbound
//!   binary channel and the session cancellation token.
//!
//! Either pump ending cancels the session; writes after that are refused.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::metrics;

/// Inbound keep-alive marker.
pub const PING: &str = "ping";

/// Reply to [`PING`].
pub const PONG: &str = "pong";

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, pumps not running yet.
    Connecting,
    /// Pumps running.
    Open,
    /// A pump ended, shutting down.
    Closing,
    /// Both pumps done.
    Closed,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SessionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    /// Move forward only; a later state is never overwritten by an earlier one.
    fn advance(&self, state: SessionState) {
        self.0.fetch_max(state.as_u8(), Ordering::AcqRel);
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Outbound write failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session is closing or closed.
    #[error("session closed")]
    Closed,

    /// The outbound buffer is full; the frame was dropped.
    #[error("session write buffer full")]
    Full,
}

impl<T> From<TrySendError<T>> for SessionError {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(_) => Self::Full,
            TrySendError::Closed(_) => Self::Closed,
        }
    }
}

// =============================================================================
// Session Handle
// =============================================================================

/// Write side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    text: mpsc::Sender<String>,
    binary: mpsc::Sender<Bytes>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] once the session is shutting down,
    /// [`SessionError::Full`] if the write buffer is full.
    pub fn write_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        self.text.try_send(text.into()).map_err(SessionError::from)
    }

    /// Queue a binary frame.
    ///
    /// # Errors
    ///
    /// Same as [`write_text`](Self::write_text).
    pub fn write_binary(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        self.binary.try_send(data.into()).map_err(SessionError::from)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Stop both pumps.
    pub fn close(&self) {
        self.state.advance(SessionState::Closing);
        self.cancel.cancel();
    }

    /// Resolves once the session starts shutting down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Token cancelled when the session shuts down.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// =============================================================================
// Session
// =============================================================================

/// Spawn the pumps for an upgraded socket.
///
/// Inbound frames other than pings go to `forward`. `buffer` bounds each
/// outbound channel. The session also stops when `parent` is cancelled.
pub fn start(
    socket: WebSocket,
    forward: mpsc::Sender<Bytes>,
    buffer: usize,
    parent: &CancellationToken,
) -> SessionHandle {
    let (sink, stream) = socket.split();
    let (text_tx, text_rx) = mpsc::channel(buffer.max(1));
    let (binary_tx, binary_rx) = mpsc::channel(buffer.max(1));
    let handle = SessionHandle {
        text: text_tx.clone(),
        binary: binary_tx,
        state: Arc::new(StateCell(AtomicU8::new(SessionState::Connecting.as_u8()))),
        cancel: parent.child_token(),
    };

    let state = Arc::clone(&handle.state);
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        write_pump(sink, text_rx, binary_rx, cancel.clone()).await;
        cancel.cancel();
        state.set(SessionState::Closed);
        metrics::websocket_session_closed();
        tracing::debug!("WebSocket session closed");
    });

    let state = Arc::clone(&handle.state);
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        read_pump(stream, forward, text_tx, cancel.clone()).await;
        state.advance(SessionState::Closing);
        cancel.cancel();
    });

    handle.state.advance(SessionState::Open);
    metrics::websocket_session_opened();
    handle
}

/// Receive frames until the peer goes away or `cancel` fires.
///
/// `forward` is dropped on return.
pub async fn read_pump<S, E>(
    mut stream: S,
    forward: mpsc::Sender<Bytes>,
    pong: mpsc::Sender<String>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let payload = match next {
            Some(Ok(Message::Text(text))) if text.as_str() == PING => {
                if pong.try_send(PONG.to_string()).is_err() {
                    tracing::debug!("Pong dropped");
                }
                continue;
            }
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "WebSocket read failed");
                break;
            }
        };
        match forward.try_send(payload) {
            // A pending signal already means "re-attach".
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

/// Send queued frames until `cancel` fires, both queues close, or the sink
/// fails. Frames still queued at that point are dropped.
pub async fn write_pump<Si>(
    mut sink: Si,
    mut text: mpsc::Receiver<String>,
    mut binary: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(t) = text.recv() => Message::Text(t.into()),
            Some(b) = binary.recv() => Message::Binary(b),
            else => break,
        };
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "WebSocket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

// =============================================================================
// Tests
// =============================================================================

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// Bytes requested from the upstream socket per read. Each read becomes at
/// most one WebSocket message.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Largest WebSocket message (and frame) accepted from a client.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// How long teardown waits for either transport to accept its close.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Per-session tuning shared by every relay the gateway starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub read_buffer_size: usize,
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl RelayConfig {
    /// WebSocket settings for the client side of a session. Inbound messages
    /// are written to the peer without any pause, so their size is capped
    /// here instead.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Draining,
    Closed,
}

/// One of the two transports of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The WebSocket client.
    Client,
    /// The TCP peer node.
    Upstream,
}

/// Why a session ended. Never surfaced past the session itself.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport closed")]
    TransportClosed,
    #[error("transport reset")]
    TransportReset,
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::TransportReset,
            io::ErrorKind::UnexpectedEof => Self::TransportClosed,
            _ => Self::Io(err),
        }
    }
}

impl From<tungstenite::Error> for RelayError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::TransportClosed
            }
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                Self::TransportReset
            }
            tungstenite::Error::Io(err) => err.into(),
            other => Self::Io(io::Error::other(other)),
        }
    }
}

/// Outcome of a finished session.
#[derive(Debug)]
pub struct SessionSummary {
    /// The transport whose closing or failure ended the session.
    pub closed_by: Side,
    pub reason: RelayError,
    pub bytes_to_client: u64,
    pub messages_to_client: u64,
    pub bytes_to_upstream: u64,
    pub messages_to_upstream: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes: u64,
    messages: u64,
}

impl Counters {
    fn record(&mut self, len: usize) {
        self.bytes += len as u64;
        self.messages += 1;
    }
}

/// Relays bytes between one WebSocket client and one upstream stream.
///
/// Upstream data is read in chunks and each chunk is sent to the client as
/// a binary message. The next read is not issued until that message has
/// been flushed to the client transport, so a slow client stalls the peer
/// through TCP backpressure instead of growing a buffer here. Client
/// messages are written to the peer as they arrive, bounded only by the
/// WebSocket message size limit.
///
/// When either side closes or fails, the other side is closed and the
/// session ends.
pub struct RelaySession<C, U> {
    connection_id: uuid::Uuid,
    client: WebSocketStream<C>,
    upstream: U,
    read_buffer_size: usize,
    state: watch::Sender<SessionState>,
}

impl<C, U> RelaySession<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(connection_id: uuid::Uuid, client: WebSocketStream<C>, upstream: U) -> Self {
        let (state, _) = watch::channel(SessionState::Open);
        Self {
            connection_id,
            client,
            upstream,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            state,
        }
    }

    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Watch the session's state as it runs.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Relay until one side ends, then tear both down.
    pub async fn run(self) -> SessionSummary {
        let Self {
            connection_id,
            client,
            upstream,
            read_buffer_size,
            state,
        } = self;

        let (client_tx, mut client_rx) = client.split();
        let (mut upstream_rx, upstream_tx) = tokio::io::split(upstream);
        let mut teardown = Teardown {
            client_tx,
            upstream_tx,
            state,
        };

        let mut to_client = Counters::default();
        let mut to_upstream = Counters::default();

        let (closed_by, reason) = tokio::select! {
            end = forward_to_client(
                &mut upstream_rx,
                &mut teardown.client_tx,
                read_buffer_size,
                &mut to_client,
            ) => end,
            end = forward_to_upstream(
                &mut client_rx,
                &mut teardown.upstream_tx,
                &mut to_upstream,
            ) => end,
        };

        debug!(%connection_id, ?closed_by, %reason, "relay ended; closing both sides");
        teardown.close().await;

        SessionSummary {
            closed_by,
            reason,
            bytes_to_client: to_client.bytes,
            messages_to_client: to_client.messages,
            bytes_to_upstream: to_upstream.bytes,
            messages_to_upstream: to_upstream.messages,
        }
    }
}

/// Upstream -> client.
async fn forward_to_client<R, S>(
    reader: &mut R,
    sink: &mut S,
    read_buffer_size: usize,
    counters: &mut Counters,
) -> (Side, RelayError)
where
    R: AsyncRead + Unpin,
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let mut buf = BytesMut::with_capacity(read_buffer_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => return (Side::Upstream, RelayError::TransportClosed),
            Ok(len) => {
                trace!(len, "upstream chunk");
                // Resolves only once the frame is flushed; no read until then.
                if let Err(err) = sink.send(Message::binary(buf.freeze())).await {
                    return (Side::Client, err.into());
                }
                counters.record(len);
            }
            Err(err) => return (Side::Upstream, err.into()),
        }
    }
}

/// Client -> upstream.
async fn forward_to_upstream<S, W>(
    stream: &mut S,
    writer: &mut W,
    counters: &mut Counters,
) -> (Side, RelayError)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(next) = stream.next().await {
        let written = match next {
            Ok(Message::Binary(data)) => writer.write_all(&data).await.map(|()| data.len()),
            Ok(Message::Text(text)) => writer.write_all(text.as_bytes()).await.map(|()| text.len()),
            Ok(Message::Close(frame)) => {
                trace!(?frame, "client sent close");
                return (Side::Client, RelayError::TransportClosed);
            }
            // Ping / pong are answered by the WebSocket layer.
            Ok(_) => continue,
            Err(err) => return (Side::Client, err.into()),
        };

        match written {
            Ok(len) => counters.record(len),
            Err(err) => return (Side::Upstream, err.into()),
        }
    }

    (Side::Client, RelayError::TransportClosed)
}

/// Write halves of both transports plus the session state.
struct Teardown<C, U> {
    client_tx: SplitSink<WebSocketStream<C>, Message>,
    upstream_tx: WriteHalf<U>,
    state: watch::Sender<SessionState>,
}

impl<C, U> Teardown<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    /// Close both transports at once, so a stalled side never holds the
    /// other half-open. Returns `false` if the session was already closed,
    /// in which case nothing is done.
    async fn close(&mut self) -> bool {
        if *self.state.borrow() != SessionState::Open {
            return false;
        }
        self.state.send_replace(SessionState::Draining);

        let (client, upstream) = tokio::join!(
            tokio::time::timeout(CLOSE_GRACE, self.client_tx.close()),
            tokio::time::timeout(CLOSE_GRACE, self.upstream_tx.shutdown()),
        );

        match client {
            Ok(Ok(())) => {}
            Ok(Err(err)) => trace!(%err, "client close failed"),
            Err(_) => debug!("client did not accept close in time"),
        }
        match upstream {
            Ok(Ok(())) => {}
            Ok(Err(err)) => trace!(%err, "upstream shutdown failed"),
            Err(_) => debug!("upstream did not accept shutdown in time"),
        }

        self.state.send_replace(SessionState::Closed);
        true
    }
}

//! Live board feed over the server's WebSocket channel.
//!
//! [`BoardFeed::connect`] opens the socket, introduces the user with
//! `Hello` and waits for `Welcome`. After that a background reader splits
//! incoming frames in two: control replies (`Joined`, `Left`, `Error`) feed
//! the pending [`BoardFeed::join`]/[`BoardFeed::leave`] call, and group
//! events queue up for [`BoardFeed::next_event`].
//!
//! Delivery is whatever the server pushes while a group is joined. Nothing
//! is replayed after a reconnect. The reader never waits on the event queue:
//! when it is full the event is dropped and counted, and a caller keeping a
//! replica reloads it once [`BoardFeed::dropped_events`] moves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use taskboard_proto::channel::{self, BoardEvent, ChannelMessage};
use taskboard_proto::ids::{GroupId, ObserverId, UserId};

type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for opening the socket.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for any control reply (`Welcome`, `Joined`, `Left`).
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the queue between the reader task and `next_event`.
pub const EVENT_QUEUE: usize = 256;

/// Capacity of the control reply queue.
const REPLY_QUEUE: usize = 16;

/// Errors from the live feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The server URL cannot be turned into a WebSocket URL.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    /// The connection was closed.
    #[error("feed connection closed")]
    ConnectionClosed,

    /// Connecting or waiting for a reply took too long.
    #[error("feed operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The server refused a request (for example joining a group the user
    /// does not belong to).
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// Socket or framing failure.
    #[error("feed I/O error: {0}")]
    Io(String),
}

/// Derives the live channel URL from an HTTP base URL
/// (`http://host:port` -> `ws://host:port/ws`).
///
/// # Errors
///
/// Returns [`FeedError::InvalidUrl`] for unparsable URLs or unsupported
/// schemes.
pub fn feed_url(server_url: &str) -> Result<Url, FeedError> {
    let mut url = Url::parse(server_url).map_err(|e| FeedError::InvalidUrl(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(FeedError::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| FeedError::InvalidUrl(server_url.to_string()))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// A subscribed live channel.
pub struct BoardFeed {
    observer_id: ObserverId,
    ws_sender: Mutex<WsSender>,
    replies: Mutex<mpsc::Receiver<ChannelMessage>>,
    events: Mutex<mpsc::Receiver<(GroupId, BoardEvent)>>,
    connected: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    reply_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl BoardFeed {
    /// Connects to the live channel at `url` as `user`, using the default
    /// timeouts.
    ///
    /// # Errors
    ///
    /// See [`BoardFeed::connect_with_timeouts`].
    pub async fn connect(url: &Url, user: UserId) -> Result<Self, FeedError> {
        Self::connect_with_timeouts(url, user, CONNECT_TIMEOUT, REPLY_TIMEOUT).await
    }

    /// Connects and completes the `Hello`/`Welcome` handshake.
    ///
    /// # Errors
    ///
    /// - [`FeedError::Timeout`] if connecting or the handshake takes too long.
    /// - [`FeedError::Unreachable`] if the server refuses the connection.
    /// - [`FeedError::Rejected`] if the server answers `Hello` with an error.
    /// - [`FeedError::ConnectionClosed`] / [`FeedError::Io`] otherwise.
    pub async fn connect_with_timeouts(
        url: &Url,
        user: UserId,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<Self, FeedError> {
        let connecting = connect_async(url.as_str());
        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connecting)
            .await
            .map_err(|_| {
                tracing::warn!(url = %url, "feed connect timed out");
                FeedError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %url, err = %e, "feed connect failed");
                map_ws_connect_error(e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = channel::encode(&ChannelMessage::Hello { user_id: user })
            .map_err(|e| FeedError::Io(e.to_string()))?;
        ws_sender
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|e| FeedError::Io(format!("failed to send Hello: {e}")))?;

        let ack = tokio::time::timeout(reply_timeout, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url = %url, "welcome timed out");
                FeedError::Timeout
            })?;

        let observer_id = match ack {
            Some(Ok(Message::Binary(data))) => match channel::decode(&data) {
                Ok(ChannelMessage::Welcome { observer_id }) => observer_id,
                Ok(ChannelMessage::Error { reason }) => return Err(FeedError::Rejected(reason)),
                Ok(other) => {
                    tracing::warn!(?other, "unexpected reply to hello");
                    return Err(FeedError::Io("unexpected reply to hello".to_string()));
                }
                Err(e) => return Err(FeedError::Io(format!("malformed welcome: {e}"))),
            },
            Some(Ok(Message::Close(_))) | None => return Err(FeedError::ConnectionClosed),
            Some(Ok(_)) => return Err(FeedError::Io("unexpected non-binary frame".to_string())),
            Some(Err(e)) => return Err(FeedError::Io(e.to_string())),
        };
        tracing::info!(observer_id = %observer_id, user = %user, url = %url, "feed connected");

        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let connected = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));
        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            reply_tx,
            event_tx,
            Arc::clone(&connected),
            Arc::clone(&dropped),
        ));

        Ok(Self {
            observer_id,
            ws_sender: Mutex::new(ws_sender),
            replies: Mutex::new(reply_rx),
            events: Mutex::new(event_rx),
            connected,
            dropped,
            reply_timeout,
            reader_handle,
        })
    }

    /// The observer id the server assigned to this connection.
    #[must_use]
    pub const fn observer_id(&self) -> ObserverId {
        self.observer_id
    }

    /// Whether the socket is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Number of events discarded because the event queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Subscribes to a group's events and waits for `Joined`.
    ///
    /// # Errors
    ///
    /// [`FeedError::Rejected`] if the user is not a member; otherwise
    /// connection or timeout errors.
    pub async fn join(&self, group_id: GroupId) -> Result<(), FeedError> {
        self.request(ChannelMessage::JoinGroup { group_id }, |reply| {
            matches!(reply, ChannelMessage::Joined { group_id: g } if *g == group_id)
        })
        .await?;
        tracing::info!(group_id = %group_id, "joined group feed");
        Ok(())
    }

    /// Unsubscribes from a group and waits for `Left`.
    ///
    /// # Errors
    ///
    /// Connection or timeout errors.
    pub async fn leave(&self, group_id: GroupId) -> Result<(), FeedError> {
        self.request(ChannelMessage::LeaveGroup { group_id }, |reply| {
            matches!(reply, ChannelMessage::Left { group_id: g } if *g == group_id)
        })
        .await?;
        tracing::info!(group_id = %group_id, "left group feed");
        Ok(())
    }

    /// Waits for the next event from any joined group.
    ///
    /// # Errors
    ///
    /// [`FeedError::ConnectionClosed`] once the socket is gone and the queue
    /// is drained.
    pub async fn next_event(&self) -> Result<(GroupId, BoardEvent), FeedError> {
        let mut rx = self.events.lock().await;
        rx.recv().await.ok_or(FeedError::ConnectionClosed)
    }

    /// Like [`BoardFeed::next_event`], giving up after `timeout`.
    ///
    /// Returns `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// [`FeedError::ConnectionClosed`] if the socket is gone.
    pub async fn next_event_within(
        &self,
        timeout: Duration,
    ) -> Result<Option<(GroupId, BoardEvent)>, FeedError> {
        match tokio::time::timeout(timeout, self.next_event()).await {
            Ok(event) => event.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Closes the socket. The server drops this observer from every group.
    pub async fn close(&self) {
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.send(Message::Close(None)).await {
            tracing::debug!(err = %e, "close frame not sent");
        }
        self.connected.store(false, Ordering::Relaxed);
    }

    async fn send(&self, msg: &ChannelMessage) -> Result<(), FeedError> {
        if !self.is_connected() {
            return Err(FeedError::ConnectionClosed);
        }
        let bytes = channel::encode(msg).map_err(|e| FeedError::Io(e.to_string()))?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Binary(bytes.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "feed send failed");
            self.connected.store(false, Ordering::Relaxed);
            FeedError::ConnectionClosed
        })
    }

    async fn request(
        &self,
        msg: ChannelMessage,
        is_ack: impl Fn(&ChannelMessage) -> bool,
    ) -> Result<(), FeedError> {
        let mut replies = self.replies.lock().await;
        self.send(&msg).await?;
        let wait = async {
            loop {
                match replies.recv().await {
                    Some(ChannelMessage::Error { reason }) => {
                        return Err(FeedError::Rejected(reason));
                    }
                    Some(reply) if is_ack(&reply) => return Ok(()),
                    Some(other) => tracing::debug!(?other, "skipping unrelated reply"),
                    None => return Err(FeedError::ConnectionClosed),
                }
            }
        };
        tokio::time::timeout(self.reply_timeout, wait)
            .await
            .map_err(|_| FeedError::Timeout)?
    }
}

impl Drop for BoardFeed {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Reads frames until the socket closes, routing control replies and
/// events to their queues without ever waiting on either. Malformed frames
/// are logged and skipped.
async fn reader_loop(
    mut ws_reader: WsReader,
    replies: mpsc::Sender<ChannelMessage>,
    events: mpsc::Sender<(GroupId, BoardEvent)>,
    connected: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Binary(data)) => match channel::decode(&data) {
                Ok(ChannelMessage::Event { group_id, event }) => {
                    tracing::trace!(group_id = %group_id, event = event.name(), "event received");
                    match events.try_send((group_id, event)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::warn!(group_id = %group_id, dropped = total, "event queue full, dropping event");
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                Ok(
                    reply @ (ChannelMessage::Joined { .. }
                    | ChannelMessage::Left { .. }
                    | ChannelMessage::Error { .. }),
                ) => match replies.try_send(reply) {
                    Ok(()) => {}
                    Err(TrySendError::Full(reply)) => {
                        tracing::warn!(?reply, "no caller waiting for reply, dropping it");
                    }
                    Err(TrySendError::Closed(_)) => break,
                },
                Ok(other) => tracing::debug!(?other, "unexpected feed message"),
                Err(e) => tracing::warn!(err = %e, "malformed feed frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("feed closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "feed read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("feed reader exiting");
}

fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> FeedError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) =>
        {
            FeedError::Unreachable(io_err.to_string())
        }
        WsError::Http(response) => {
            FeedError::Io(format!("HTTP error during upgrade: status {}", response.status()))
        }
        other => FeedError::Io(other.to_string()),
    }
}

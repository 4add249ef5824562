//! WebSocket client for the room server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - The `hello` handshake
//! - Room subscriptions that leave the room when dropped
//! - Typed room events for the application
//!
//! Nothing is queued while disconnected: missed events are never replayed,
//! so after a reconnect the caller refetches the board.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::backoff::{ReconnectPolicy, ReconnectStep, Reconnector};
use crate::model::{RoomId, SessionId, UserId};
use crate::protocol::{ClientFrame, ProtocolError, ServerEvent, ServerFrame};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// Outbound frame buffer
    pub outbound_buffer: usize,
    /// Inbound event buffer
    pub event_buffer: usize,
    /// Time allowed for `welcome` after `hello`
    pub handshake_timeout: Duration,
    /// Upper bound on one persistence round trip
    pub persist_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            outbound_buffer: 256,
            event_buffer: 256,
            handshake_timeout: Duration::from_secs(5),
            persist_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; waits for [`SyncClient::retry`].
    Offline,
    /// Credentials refused; waits for [`SyncClient::set_credential`].
    AuthRejected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Handshake completed
    Connected {
        session_id: SessionId,
        user_id: UserId,
    },
    /// A reconnect completed. The previous room, if any, is rejoined right
    /// after this event, so cached board state must be refetched.
    Reconnected { room_id: Option<RoomId> },
    /// Connection lost
    Disconnected,
    /// A room event
    Remote {
        room_id: RoomId,
        seq: u64,
        origin: Option<SessionId>,
        event: ServerEvent,
    },
    /// Events were dropped for this session; refetch the board.
    ResyncRequired { room_id: RoomId },
    ServerError { message: String },
    Pong,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("transport lost")]
    TransportLost,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("offline after exhausting reconnect attempts")]
    Offline,
    #[error("not possible while {0:?}")]
    InvalidState(ConnectionState),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Outbound half of the current connection plus the joined room.
#[derive(Default)]
struct Link {
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    room: Option<RoomId>,
}

fn lock(link: &Mutex<Link>) -> std::sync::MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Membership of one room. Dropping it leaves the room.
pub struct RoomSubscription {
    room_id: RoomId,
    link: Arc<Mutex<Link>>,
}

impl RoomSubscription {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Leave the room now.
    pub fn leave(self) {}
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        let mut link = lock(&self.link);
        if link.room != Some(self.room_id) {
            return;
        }
        link.room = None;
        if let Some(tx) = &link.outgoing {
            match (ClientFrame::LeaveRoom {
                room_id: self.room_id,
            })
            .encode()
            {
                Ok(frame) => {
                    if tx.try_send(frame).is_err() {
                        log::debug!("leave-room for {} not sent", self.room_id);
                    }
                }
                Err(e) => log::warn!("Failed to encode leave-room: {e}"),
            }
        }
    }
}

/// The sync client.
///
/// All methods take `&self`, so one client can be shared behind an `Arc`
/// between the application and the reconciliation controller.
pub struct SyncClient {
    config: ClientConfig,
    credential: RwLock<String>,
    display_name: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Session assigned by the last `welcome`
    identity: RwLock<Option<(SessionId, UserId)>>,

    link: Arc<Mutex<Link>>,

    /// Bumped per connection; stale reader tasks compare against it
    epoch: Arc<AtomicU64>,

    reconnector: tokio::sync::Mutex<Reconnector>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, credential: impl Into<String>, display_name: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let reconnector = Reconnector::new(config.reconnect.clone());
        Self {
            config,
            credential: RwLock::new(credential.into()),
            display_name: display_name.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            identity: RwLock::new(None),
            link: Arc::new(Mutex::new(Link::default())),
            epoch: Arc::new(AtomicU64::new(0)),
            reconnector: tokio::sync::Mutex::new(reconnector),
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and complete the handshake.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&self) -> Result<(SessionId, UserId), ClientError> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::AuthRejected {
                return Err(ClientError::InvalidState(*state));
            }
            if *state != ConnectionState::Reconnecting {
                *state = ConnectionState::Connecting;
            }
        }

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.config.url).await {
            Ok(conn) => conn,
            Err(e) => {
                self.fall_back().await;
                return Err(ClientError::Transport(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = ClientFrame::Hello {
            credential: self.credential.read().await.clone(),
            display_name: self.display_name.clone(),
        }
        .encode()?;
        if let Err(e) = ws_writer.send(Message::Binary(hello.into())).await {
            self.fall_back().await;
            return Err(ClientError::Transport(e.to_string()));
        }

        let reply = tokio::time::timeout(self.config.handshake_timeout, next_server_frame(&mut ws_reader)).await;
        let (session_id, user_id) = match reply {
            Ok(Ok(Some(ServerFrame::Welcome { session_id, user_id }))) => (session_id, user_id),
            Ok(Ok(Some(ServerFrame::AuthRejected { reason }))) => {
                log::warn!("Authentication rejected: {reason}");
                *self.state.write().await = ConnectionState::AuthRejected;
                self.reconnector.lock().await.on_auth_rejected();
                return Err(ClientError::AuthRejected(reason));
            }
            Ok(Ok(Some(other))) => {
                self.fall_back().await;
                return Err(ClientError::Handshake(format!("unexpected {other:?}")));
            }
            Ok(Ok(None)) => {
                self.fall_back().await;
                return Err(ClientError::TransportLost);
            }
            Ok(Err(e)) => {
                self.fall_back().await;
                return Err(e);
            }
            Err(_) => {
                self.fall_back().await;
                return Err(ClientError::Handshake("timed out waiting for welcome".into()));
            }
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // Outgoing message channel
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.outbound_buffer.max(1));
        lock(&self.link).outgoing = Some(out_tx);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            // Sender dropped: disconnect requested
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let link = self.link.clone();
        let current = self.epoch.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerFrame::decode(&bytes) {
                            Ok(frame) => {
                                if let Some(event) = frame_event(frame) {
                                    if event_tx.send(event).await.is_err() {
                                        log::debug!("Event receiver dropped");
                                    }
                                }
                            }
                            Err(e) => log::warn!("Failed to decode server frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost, unless a newer connection took over
            if current.load(Ordering::SeqCst) == epoch {
                lock(&link).outgoing = None;
                *state.write().await = ConnectionState::Disconnected;
                log::info!("Connection lost");
                let _ = event_tx.send(ClientEvent::Disconnected).await;
            }
        });

        *self.identity.write().await = Some((session_id, user_id));
        *self.state.write().await = ConnectionState::Connected;
        self.reconnector.lock().await.on_connected();
        log::info!("Connected to {} as session {session_id}", self.config.url);
        let _ = self.event_tx.send(ClientEvent::Connected { session_id, user_id }).await;
        Ok((session_id, user_id))
    }

    async fn fall_back(&self) {
        let mut state = self.state.write().await;
        if *state != ConnectionState::Reconnecting {
            *state = ConnectionState::Disconnected;
        }
    }

    /// Reconnect under the backoff policy and rejoin the previous room.
    ///
    /// Ends in `Connected`, `Offline` (attempts exhausted) or `AuthRejected`.
    pub async fn reconnect(&self) -> Result<(SessionId, UserId), ClientError> {
        self.drop_connection();
        loop {
            let step = self.reconnector.lock().await.on_failure();
            match step {
                ReconnectStep::RetryAfter { attempt, delay } => {
                    *self.state.write().await = ConnectionState::Reconnecting;
                    log::info!("Reconnect attempt {attempt} in {delay:?}");
                    tokio::time::sleep(delay).await;
                    match self.connect().await {
                        Ok(identity) => {
                            let room_id = lock(&self.link).room;
                            // Queued ahead of the new room's events.
                            let _ = self.event_tx.send(ClientEvent::Reconnected { room_id }).await;
                            if let Some(room_id) = room_id {
                                self.send(ClientFrame::JoinRoom { room_id }).await?;
                            }
                            return Ok(identity);
                        }
                        Err(e @ ClientError::AuthRejected(_)) => return Err(e),
                        Err(e) => log::warn!("Reconnect attempt {attempt} failed: {e}"),
                    }
                }
                ReconnectStep::GiveUp => {
                    let mut state = self.state.write().await;
                    if *state == ConnectionState::AuthRejected {
                        return Err(ClientError::InvalidState(*state));
                    }
                    *state = ConnectionState::Offline;
                    log::warn!("Offline, waiting for an explicit retry");
                    return Err(ClientError::Offline);
                }
            }
        }
    }

    /// Explicit user retry from the `Offline` state.
    pub async fn retry(&self) -> Result<(SessionId, UserId), ClientError> {
        if !self.reconnector.lock().await.retry() {
            return Err(ClientError::InvalidState(self.connection_state().await));
        }
        self.reconnect().await
    }

    /// Supply fresh credentials after an auth refusal.
    pub async fn set_credential(&self, credential: impl Into<String>) {
        *self.credential.write().await = credential.into();
        self.reconnector.lock().await.reset();
        let mut state = self.state.write().await;
        if *state == ConnectionState::AuthRejected {
            *state = ConnectionState::Disconnected;
        }
    }

    /// Subscribe to a room. The previous room, if any, is left by the server.
    pub async fn join_room(&self, room_id: RoomId) -> Result<RoomSubscription, ClientError> {
        self.send(ClientFrame::JoinRoom { room_id }).await?;
        lock(&self.link).room = Some(room_id);
        Ok(RoomSubscription {
            room_id,
            link: self.link.clone(),
        })
    }

    /// Send a frame on the current connection.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            return Err(ClientError::TransportLost);
        }
        let encoded = frame.encode()?;
        let tx = lock(&self.link).outgoing.clone().ok_or(ClientError::TransportLost)?;
        tx.send(encoded).await.map_err(|_| ClientError::TransportLost)
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(ClientFrame::Ping).await
    }

    /// Close the connection and forget the room.
    pub async fn disconnect(&self) {
        self.drop_connection();
        lock(&self.link).room = None;
        *self.identity.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    fn drop_connection(&self) {
        // The reader of the old connection must not report the drop.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.link).outgoing = None;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.identity.read().await.map(|(session_id, _)| session_id)
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.identity.read().await.map(|(_, user_id)| user_id)
    }

    /// Room the client is subscribed to.
    pub fn room(&self) -> Option<RoomId> {
        lock(&self.link).room
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

/// Next decoded server frame, skipping control messages. `None` on close.
async fn next_server_frame(ws_reader: &mut WsReader) -> Result<Option<ServerFrame>, ClientError> {
    while let Some(msg) = ws_reader.next().await {
        match msg.map_err(|e| ClientError::Transport(e.to_string()))? {
            Message::Binary(data) => {
                let bytes: Vec<u8> = data.into();
                return Ok(Some(ServerFrame::decode(&bytes)?));
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

fn frame_event(frame: ServerFrame) -> Option<ClientEvent> {
    match frame {
        ServerFrame::Event {
            room_id,
            seq,
            origin,
            event,
        } => Some(ClientEvent::Remote {
            room_id,
            seq,
            origin,
            event,
        }),
        ServerFrame::ResyncRequired { room_id } => Some(ClientEvent::ResyncRequired { room_id }),
        ServerFrame::Error { message } => Some(ClientEvent::ServerError { message }),
        ServerFrame::Pong => Some(ClientEvent::Pong),
        other => {
            log::warn!("Unexpected frame after handshake: {other:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn client() -> SyncClient {
        SyncClient::new(ClientConfig::new("ws://127.0.0.1:1"), "token", "Alice")
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:9090");
        assert_eq!(config.outbound_buffer, 256);
        assert_eq!(config.persist_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.session_id().await.is_none());
        assert!(client.room().is_none());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = client();
        assert_eq!(client.send_ping().await, Err(ClientError::TransportLost));
        assert!(client.join_room(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port() {
        let client = client();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_goes_offline() {
        let config = ClientConfig {
            url: "ws://127.0.0.1:1".into(),
            reconnect: ReconnectPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: 0.0,
            },
            ..Default::default()
        };
        let client = SyncClient::new(config, "token", "Alice");
        assert_eq!(client.reconnect().await, Err(ClientError::Offline));
        assert_eq!(client.connection_state().await, ConnectionState::Offline);

        // A retry runs the policy again and ends offline once more.
        assert_eq!(client.retry().await, Err(ClientError::Offline));
    }

    #[tokio::test]
    async fn test_retry_only_from_offline() {
        let client = client();
        assert_eq!(
            client.retry().await,
            Err(ClientError::InvalidState(ConnectionState::Disconnected))
        );
    }

    #[test]
    fn test_frame_event_mapping() {
        let room_id = Uuid::new_v4();
        assert_eq!(
            frame_event(ServerFrame::ResyncRequired { room_id }),
            Some(ClientEvent::ResyncRequired { room_id })
        );
        assert_eq!(frame_event(ServerFrame::Pong), Some(ClientEvent::Pong));
        assert_eq!(
            frame_event(ServerFrame::AuthRejected { reason: "late".into() }),
            None
        );
    }

    #[test]
    fn test_dropping_subscription_without_connection() {
        let link = Arc::new(Mutex::new(Link::default()));
        let room_id = Uuid::new_v4();
        lock(&link).room = Some(room_id);
        drop(RoomSubscription {
            room_id,
            link: link.clone(),
        });
        assert!(lock(&link).room.is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_sends_leave() {
        let (tx, mut rx) = mpsc::channel(4);
        let room_id = Uuid::new_v4();
        let link = Arc::new(Mutex::new(Link {
            outgoing: Some(tx),
            room: Some(room_id),
        }));
        RoomSubscription {
            room_id,
            link: link.clone(),
        }
        .leave();

        let frame = ClientFrame::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame, ClientFrame::LeaveRoom { room_id });
    }
}

//! WebSocket room server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  hello ► welcome
//!            ├── RoomHub ─┬─ SessionRegistry (who is in which room)
//! Client B ──┘            └─ EventBus ── RoomChannel(board) ── seq-stamped fan-out
//!                                              │
//!                                   ┌──────────┼───────────┐
//!                                   ▼          ▼           ▼
//!                                Client A   Client B    Client C
//! ```
//!
//! The server is a relay: it authenticates connections, tracks room
//! membership and fans intents out as room events. Authoritative writes go
//! from each client to the persistence collaborator; the server never
//! touches item state.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::broadcast::{Envelope, EventBus};
use crate::model::{ClientOpId, RoomId, SessionId, UserId};
use crate::protocol::{
    Audience, ClientFrame, DisplayInfo, PresenceEntry, ProtocolError, ServerEvent, ServerFrame,
};
use crate::registry::{JoinOutcome, LeaveOutcome, SessionRegistry};

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per room
    pub max_sessions_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Time allowed between accept and the `Hello` frame
    pub handshake_timeout: Duration,
    /// Recent `client_op_id`s remembered per session
    pub dedupe_window: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            handshake_timeout: Duration::from_secs(5),
            dedupe_window: 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_handshakes: u64,
    pub duplicate_ops: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("room {0} is full")]
    RoomFull(RoomId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Room membership plus event fan-out.
///
/// Membership changes run under one lock so a joiner's greeting, the
/// presence events and the registry always agree.
pub struct RoomHub {
    registry: Mutex<SessionRegistry>,
    bus: EventBus,
    max_sessions_per_room: usize,
}

impl RoomHub {
    pub fn new(broadcast_capacity: usize, max_sessions_per_room: usize) -> Self {
        Self {
            registry: Mutex::new(SessionRegistry::new()),
            bus: EventBus::new(broadcast_capacity),
            max_sessions_per_room,
        }
    }

    pub async fn register(&self, session_id: SessionId, user_id: UserId, display: DisplayInfo) {
        self.registry.lock().await.register(session_id, user_id, display);
    }

    /// Subscribe `session_id` to `room_id`.
    ///
    /// The returned receiver is created before the greeting is published, so
    /// the joiner sees `room:joined` first and every later room event.
    pub async fn join(
        &self,
        session_id: SessionId,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<(broadcast::Receiver<Arc<Envelope>>, JoinOutcome), HubError> {
        let mut registry = self.registry.lock().await;
        let already_member = registry.room_of(&session_id) == Some(room_id);
        if !already_member && registry.member_count(&room_id) >= self.max_sessions_per_room {
            return Err(HubError::RoomFull(room_id));
        }

        let outcome = registry.join(session_id, room_id, user_id);
        if let Some(left) = &outcome.left {
            self.announce_leave(session_id, left).await?;
        }

        let rx = self.bus.subscribe(room_id).await;
        self.bus
            .broadcast(
                room_id,
                ServerEvent::RoomJoined {
                    room_id,
                    presence: outcome.presence.clone(),
                },
                Some(session_id),
                Audience::Origin,
            )
            .await?;
        if !outcome.already_member {
            self.bus
                .broadcast(
                    room_id,
                    ServerEvent::PresenceJoined {
                        room_id,
                        entry: outcome.entry.clone(),
                    },
                    Some(session_id),
                    Audience::Others,
                )
                .await?;
            log::info!(
                "{} ({session_id}) joined room {room_id}, {} present",
                outcome.entry.display.name,
                outcome.presence.len()
            );
        }
        Ok((rx, outcome))
    }

    /// Unsubscribe from the current room. No-op when not subscribed.
    pub async fn leave(&self, session_id: SessionId) -> Result<Option<LeaveOutcome>, HubError> {
        let mut registry = self.registry.lock().await;
        let left = registry.leave(session_id);
        if let Some(left) = &left {
            self.announce_leave(session_id, left).await?;
        }
        Ok(left)
    }

    /// Forget the session. Safe to call twice.
    pub async fn disconnect(&self, session_id: SessionId) -> Result<Option<LeaveOutcome>, HubError> {
        let mut registry = self.registry.lock().await;
        let left = registry.disconnect(session_id);
        if let Some(left) = &left {
            self.announce_leave(session_id, left).await?;
        }
        Ok(left)
    }

    async fn announce_leave(&self, session_id: SessionId, left: &LeaveOutcome) -> Result<(), HubError> {
        self.bus
            .broadcast(
                left.room_id,
                ServerEvent::PresenceLeft {
                    room_id: left.room_id,
                    session_id,
                    user_id: left.entry.user_id,
                },
                Some(session_id),
                Audience::Others,
            )
            .await?;
        if left.room_empty {
            self.bus.remove(&left.room_id).await;
            log::info!("Room {} removed (empty)", left.room_id);
        } else {
            log::info!("{session_id} left room {}", left.room_id);
        }
        Ok(())
    }

    /// Relay an event into `room_id`.
    pub async fn publish(
        &self,
        room_id: RoomId,
        event: ServerEvent,
        origin: Option<SessionId>,
        audience: Audience,
    ) -> Result<Option<Arc<Envelope>>, HubError> {
        Ok(self.bus.broadcast(room_id, event, origin, audience).await?)
    }

    pub async fn touch(&self, session_id: &SessionId) {
        self.registry.lock().await.touch(session_id);
    }

    pub async fn room_of(&self, session_id: &SessionId) -> Option<RoomId> {
        self.registry.lock().await.room_of(session_id)
    }

    pub async fn presence(&self, room_id: &RoomId) -> Vec<PresenceEntry> {
        self.registry.lock().await.list_presence(room_id)
    }

    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.session_count()
    }

    pub async fn room_count(&self) -> usize {
        self.bus.room_count().await
    }

    /// Registry indexes agree and every occupied room has a channel.
    pub async fn is_consistent(&self) -> bool {
        let registry = self.registry.lock().await;
        registry.is_consistent() && registry.room_count() == self.bus.room_count().await
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

/// Bounded set of recently seen operation ids.
struct RecentOps {
    order: VecDeque<ClientOpId>,
    seen: HashSet<ClientOpId>,
    capacity: usize,
}

impl RecentOps {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// `false` if `id` was already seen.
    fn insert(&mut self, id: ClientOpId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// The room server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<RoomHub>,
    auth: Arc<dyn Authenticator>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, auth: Arc<dyn Authenticator>) -> Self {
        let hub = Arc::new(RoomHub::new(
            config.broadcast_capacity,
            config.max_sessions_per_room,
        ));
        Self {
            config,
            hub,
            auth,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let auth = self.auth.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, auth, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<RoomHub>,
        auth: Arc<dyn Authenticator>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = match Self::handshake(&mut ws_sender, &mut ws_receiver, addr, &hub, auth.as_ref(), &config).await {
            Ok(Some((session_id, user_id))) => {
                let result = Self::session_loop(
                    &mut ws_sender,
                    &mut ws_receiver,
                    addr,
                    session_id,
                    user_id,
                    &hub,
                    &stats,
                    &config,
                )
                .await;
                // Cleanup: leave the room and forget the session
                if let Err(e) = hub.disconnect(session_id).await {
                    log::warn!("Cleanup of session {session_id} failed: {e}");
                }
                result
            }
            Ok(None) => {
                stats.write().await.rejected_handshakes += 1;
                Ok(())
            }
            Err(e) => Err(e),
        };

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = hub.room_count().await;
        result
    }

    /// Wait for `Hello` and authenticate it. `None` means the connection was refused.
    async fn handshake(
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        addr: SocketAddr,
        hub: &RoomHub,
        auth: &dyn Authenticator,
        config: &ServerConfig,
    ) -> Result<Option<(SessionId, UserId)>, BoxError> {
        let first = tokio::time::timeout(config.handshake_timeout, next_frame(ws_receiver)).await;
        let (credential, display_name) = match first {
            Ok(Ok(Some(ClientFrame::Hello {
                credential,
                display_name,
            }))) => (credential, display_name),
            Ok(Ok(Some(other))) => {
                log::warn!("Expected hello from {addr}, got {other:?}");
                send_frame(
                    ws_sender,
                    &ServerFrame::AuthRejected {
                        reason: "expected hello".into(),
                    },
                )
                .await?;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(None);
            }
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => {
                log::warn!("Bad handshake frame from {addr}: {e}");
                return Ok(None);
            }
            Err(_) => {
                log::info!("Handshake timeout for {addr}");
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(None);
            }
        };

        let identity = match auth.authenticate(&credential).await {
            Ok(identity) => identity,
            Err(e) => {
                log::info!("Rejected connection from {addr}: {e}");
                send_frame(ws_sender, &ServerFrame::AuthRejected { reason: e.to_string() }).await?;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(None);
            }
        };

        let session_id = Uuid::new_v4();
        let name = if display_name.trim().is_empty() {
            identity.display_name
        } else {
            display_name
        };
        hub.register(session_id, identity.user_id, DisplayInfo::for_user(identity.user_id, name))
            .await;
        send_frame(
            ws_sender,
            &ServerFrame::Welcome {
                session_id,
                user_id: identity.user_id,
            },
        )
        .await?;
        log::info!("Session {session_id} authenticated as {} from {addr}", identity.user_id);
        Ok(Some((session_id, identity.user_id)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn session_loop(
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        addr: SocketAddr,
        session_id: SessionId,
        user_id: UserId,
        hub: &RoomHub,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), BoxError> {
        let mut room: Option<RoomId> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Envelope>>> = None;
        let mut recent_ops = RecentOps::new(config.dedupe_window);

        let heartbeat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let frame = match ClientFrame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    send_frame(ws_sender, &ServerFrame::Error { message: e.to_string() }).await?;
                                    continue;
                                }
                            };
                            hub.touch(&session_id).await;

                            match frame {
                                ClientFrame::Hello { .. } => {
                                    send_frame(ws_sender, &ServerFrame::Error {
                                        message: "already authenticated".into(),
                                    }).await?;
                                }
                                ClientFrame::JoinRoom { room_id } => {
                                    match hub.join(session_id, room_id, user_id).await {
                                        Ok((rx, _)) => {
                                            broadcast_rx = Some(rx);
                                            room = Some(room_id);
                                        }
                                        Err(e) => {
                                            log::info!("Session {session_id} could not join {room_id}: {e}");
                                            send_frame(ws_sender, &ServerFrame::Error { message: e.to_string() }).await?;
                                        }
                                    }
                                }
                                ClientFrame::LeaveRoom { room_id } => {
                                    if room == Some(room_id) {
                                        hub.leave(session_id).await?;
                                        broadcast_rx = None;
                                        room = None;
                                    } else {
                                        log::debug!("Session {session_id} left {room_id} it was not in");
                                    }
                                }
                                ClientFrame::Ping => {
                                    send_frame(ws_sender, &ServerFrame::Pong).await?;
                                }
                                intent => {
                                    let Some(room_id) = room else {
                                        send_frame(ws_sender, &ServerFrame::Error {
                                            message: "not in a room".into(),
                                        }).await?;
                                        continue;
                                    };
                                    if let Some(op_id) = intent.client_op_id() {
                                        if !recent_ops.insert(op_id) {
                                            log::debug!("Dropping repeated op {op_id} from {session_id}");
                                            stats.write().await.duplicate_ops += 1;
                                            continue;
                                        }
                                    }
                                    match intent.into_event(session_id, user_id) {
                                        Ok(Some(event)) => {
                                            log::debug!("Relaying {} from {session_id} in {room_id}", event.name());
                                            let audience = event.audience();
                                            hub.publish(room_id, event, Some(session_id), audience).await?;
                                        }
                                        Ok(None) => {}
                                        Err(e) => {
                                            log::warn!("Refused intent from {session_id}: {e}");
                                            send_frame(ws_sender, &ServerFrame::Error { message: e.to_string() }).await?;
                                        }
                                    }
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room event
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // Not in a room yet, wait forever
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(envelope) => {
                            if envelope.is_for(session_id) {
                                ws_sender.send(Message::Binary(envelope.frame.to_vec().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Session {session_id} lagged by {n} messages");
                            if let Some(room_id) = room {
                                send_frame(ws_sender, &ServerFrame::ResyncRequired { room_id }).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            broadcast_rx = None;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if last_seen.elapsed() > heartbeat * 3 {
                        log::info!("Session {session_id} timed out");
                        break;
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.hub.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }
}

/// Next decoded client frame, skipping control messages. `None` on close.
async fn next_frame(ws_receiver: &mut WsReceiver) -> Result<Option<ClientFrame>, BoxError> {
    while let Some(msg) = ws_receiver.next().await {
        match msg? {
            Message::Binary(data) => {
                let bytes: Vec<u8> = data.into();
                return Ok(Some(ClientFrame::decode(&bytes)?));
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

async fn send_frame(ws_sender: &mut WsSender, frame: &ServerFrame) -> Result<(), BoxError> {
    let encoded = frame.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

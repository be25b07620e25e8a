//! WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Master ──┐                       ┌──► room "a1b2c3" ── RoomGroup ──► members
//!          ├── RelayServer ────────┤
//! Peer   ──┘   (one task per conn) └──► room "d4e5f6" ── RoomGroup ──► members
//! ```
//!
//! The relay answers room control itself (`create room`, `join room`) and
//! forwards every other frame untouched to the other members of the
//! sender's room. It never inspects file content and keeps no state
//! besides room membership.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{Envelope, MemberKind, RoomGroup, RoomManager};
use crate::error::ProtocolError;
use crate::protocol::{Frame, ShareMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room, owner included
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Length of generated room ids (hex characters, 1 to 32)
    pub room_id_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            max_peers_per_room: 16,
            broadcast_capacity: 256,
            room_id_len: 6,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub rooms_created: u64,
    pub active_rooms: usize,
}

/// Fresh room id: the first `len` hex digits of a v4 UUID.
pub fn generate_room_id(len: usize) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..len.clamp(1, hex.len())].to_string()
}

/// Canonical form of a room id typed by a user.
pub fn normalize_room_id(room_id: &str) -> String {
    room_id.trim().to_ascii_lowercase()
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

/// Room membership of one connection.
struct Membership {
    room_id: String,
    member_id: Uuid,
    room: Arc<RoomGroup>,
    rx: broadcast::Receiver<Arc<Envelope>>,
}

/// Room id draws before `create room` gives up.
const MAX_ROOM_ID_ATTEMPTS: usize = 64;

type ConnResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> ConnResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<Membership> = None;
        let outcome = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            addr,
            &mut membership,
            &rooms,
            &stats,
            &config,
        )
        .await;

        if let Some(m) = membership.take() {
            Self::leave(m, &rooms, &stats).await;
        }
        stats.write().await.active_connections -= 1;
        outcome
    }

    /// Move frames between the socket and the room until either side ends.
    async fn pump(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        addr: SocketAddr,
        membership: &mut Option<Membership>,
        rooms: &RoomManager,
        stats: &RwLock<RelayStats>,
        config: &RelayConfig,
    ) -> ConnResult {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let frame = match Frame::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            stats.write().await.total_frames += 1;

                            let reply =
                                Self::on_frame(frame, data.to_vec(), membership, rooms, stats, config).await;
                            if let Some(reply) = reply {
                                let bytes = encode_reply(reply)?;
                                ws_sender.send(Message::Binary(bytes.into())).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                envelope = async {
                    match membership.as_mut() {
                        Some(m) => m.rx.recv().await,
                        // Outside any room: nothing to forward
                        None => std::future::pending().await,
                    }
                } => {
                    match envelope {
                        Ok(envelope) => {
                            let own = membership.as_ref().map(|m| m.member_id);
                            if Some(envelope.sender) == own {
                                continue;
                            }
                            ws_sender.send(Message::Binary(envelope.bytes.clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {addr} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Handle one decoded frame; returns the direct reply, if any.
    async fn on_frame(
        frame: Frame,
        raw: Vec<u8>,
        membership: &mut Option<Membership>,
        rooms: &RoomManager,
        stats: &RwLock<RelayStats>,
        config: &RelayConfig,
    ) -> Option<ShareMessage> {
        match frame.message {
            ShareMessage::CreateRoom => {
                if let Some(m) = membership.take() {
                    Self::leave(m, rooms, stats).await;
                }
                let mut created = None;
                for _ in 0..MAX_ROOM_ID_ATTEMPTS {
                    let candidate = generate_room_id(config.room_id_len);
                    if let Some(room) = rooms.create(&candidate).await {
                        created = Some((candidate, room));
                        break;
                    }
                }
                let Some((room_id, room)) = created else {
                    log::warn!(
                        "No free room id of length {} after {MAX_ROOM_ID_ATTEMPTS} attempts",
                        config.room_id_len
                    );
                    return Some(ShareMessage::RoomError {
                        reason: "no free room id".to_string(),
                    });
                };
                let rx = room.add_member(frame.sender, MemberKind::Owner).await;
                {
                    let mut s = stats.write().await;
                    s.rooms_created += 1;
                    s.active_rooms = rooms.room_count().await;
                }
                log::info!("Room {room_id} created by {}", frame.sender);
                *membership = Some(Membership {
                    room_id: room_id.clone(),
                    member_id: frame.sender,
                    room,
                    rx,
                });
                Some(ShareMessage::RoomCreated { room_id })
            }

            ShareMessage::JoinRoom { room_id } => {
                let normalized = normalize_room_id(&room_id);
                if membership.as_ref().is_some_and(|m| m.room_id == normalized) {
                    log::debug!("{} is already in room {normalized}", frame.sender);
                    return Some(ShareMessage::JoinedRoom { room_id: normalized });
                }
                match rooms.get(&normalized).await {
                    None => {
                        log::info!("Join of unknown room {normalized:?} by {}", frame.sender);
                        return Some(ShareMessage::RoomError {
                            reason: format!("room {normalized} not found"),
                        });
                    }
                    Some(room) if room.member_count().await >= config.max_peers_per_room => {
                        return Some(ShareMessage::RoomError {
                            reason: format!("room {normalized} is full"),
                        });
                    }
                    Some(_) => {}
                }
                // Leaving may remove the old room; look the target up again after.
                if let Some(m) = membership.take() {
                    Self::leave(m, rooms, stats).await;
                }
                let joined = rooms
                    .join(&normalized, frame.sender, MemberKind::Guest, config.max_peers_per_room)
                    .await;
                let (room, rx) = match joined {
                    Ok(joined) => joined,
                    Err(refusal) => {
                        log::info!("Join of room {normalized} by {} refused: {refusal}", frame.sender);
                        return Some(ShareMessage::RoomError {
                            reason: format!("room {normalized} {refusal}"),
                        });
                    }
                };
                log::info!("{} joined room {normalized}", frame.sender);
                *membership = Some(Membership {
                    room_id: normalized.clone(),
                    member_id: frame.sender,
                    room,
                    rx,
                });
                Some(ShareMessage::JoinedRoom { room_id: normalized })
            }

            ref message if message.is_room_control() => {
                log::debug!("Ignoring relay-only event '{}' from a client", message.event_name());
                None
            }

            message => {
                match membership.as_ref() {
                    Some(m) => {
                        let delivered = m.room.send(Envelope {
                            sender: frame.sender,
                            bytes: raw,
                        });
                        log::trace!(
                            "Relayed '{}' in room {} to {} receivers",
                            message.event_name(),
                            m.room_id,
                            delivered.saturating_sub(1)
                        );
                    }
                    None => {
                        log::debug!("Dropping '{}' from a connection outside any room", message.event_name());
                    }
                }
                None
            }
        }
    }

    async fn leave(membership: Membership, rooms: &RoomManager, stats: &RwLock<RelayStats>) {
        membership.room.remove_member(&membership.member_id).await;
        if rooms.remove_if_empty(&membership.room_id).await {
            log::info!("Room {} removed (empty)", membership.room_id);
        }
        stats.write().await.active_rooms = rooms.room_count().await;
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

fn encode_reply(message: ShareMessage) -> Result<Vec<u8>, ProtocolError> {
    Frame::new(Uuid::nil(), message).encode()
}

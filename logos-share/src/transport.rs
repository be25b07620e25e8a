//! Transport channel: named-event pub/sub between session participants.
//!
//! - [`WsTransport`]: WebSocket client talking to a [`RelayServer`]
//! - [`MemoryTransport`]: in-process channel with a test handle
//!
//! [`RelayServer`]: crate::relay::RelayServer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{Frame, ShareMessage};

/// What a transport subscription delivers.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ShareMessage),
    /// Non-fatal failure; the channel may still work.
    Error(TransportError),
    /// The remote end went away. No more events follow.
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one event to the other participants.
    async fn emit(&self, message: ShareMessage) -> Result<(), TransportError>;

    /// Take the incoming event receiver. Only the first call gets it.
    fn subscribe(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// WebSocket transport.
///
/// A writer task drains the outgoing queue into the socket; a reader task
/// decodes frames into [`TransportEvent`]s.
pub struct WsTransport {
    sender_id: Uuid,
    outgoing_tx: mpsc::Sender<Message>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    reader: JoinHandle<()>,
    closed: AtomicBool,
    url: String,
}

impl WsTransport {
    /// Connect to a relay at `url` (e.g. `ws://127.0.0.1:9191`).
    pub async fn connect(url: impl Into<String>, capacity: usize) -> Result<Self, TransportError> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(capacity);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(capacity);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = ws_writer.send(msg).await {
                    log::warn!("WebSocket send failed: {e}");
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        // Reader task: decode incoming frames
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(frame) => TransportEvent::Message(frame.message),
                        Err(e) => TransportEvent::Error(e.into()),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = event_tx
                            .send(TransportEvent::Error(TransportError::Socket(e.to_string())))
                            .await;
                        break;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    // Subscriber gone
                    return;
                }
            }
            let _ = event_tx.send(TransportEvent::Closed).await;
        });

        log::info!("Connected to relay at {url}");
        Ok(Self {
            sender_id: Uuid::new_v4(),
            outgoing_tx: out_tx,
            event_rx: Mutex::new(Some(event_rx)),
            reader,
            closed: AtomicBool::new(false),
            url,
        })
    }

    pub fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn emit(&self, message: ShareMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        log::debug!("emit '{}'", message.event_name());
        let encoded = Frame::new(self.sender_id, message).encode()?;
        self.outgoing_tx
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.lock().ok()?.take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
        self.reader.abort();
        log::info!("Closed connection to {}", self.url);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Default)]
struct MemoryShared {
    sent: Mutex<Vec<ShareMessage>>,
    closed: AtomicBool,
}

/// In-process transport. Outgoing messages are recorded; incoming ones are
/// injected through a [`MemoryHandle`].
pub struct MemoryTransport {
    shared: Arc<MemoryShared>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

/// Test-side view of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<MemoryShared>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> (Self, MemoryHandle) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let shared = Arc::new(MemoryShared::default());
        let handle = MemoryHandle {
            shared: shared.clone(),
            event_tx: event_tx.clone(),
        };
        let transport = Self {
            shared,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        };
        (transport, handle)
    }
}

impl MemoryHandle {
    /// Deliver `message` as if it came from the remote side.
    pub async fn deliver(&self, message: ShareMessage) -> Result<(), TransportError> {
        self.event_tx
            .send(TransportEvent::Message(message))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Deliver an arbitrary transport event.
    pub async fn deliver_event(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Everything emitted so far, oldest first.
    pub fn sent(&self) -> Vec<ShareMessage> {
        self.shared.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Drain the emitted messages.
    pub fn take_sent(&self) -> Vec<ShareMessage> {
        self.shared
            .sent
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn emit(&self, message: ShareMessage) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.shared
            .sent
            .lock()
            .map_err(|e| TransportError::Socket(e.to_string()))?
            .push(message);
        Ok(())
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.lock().ok()?.take()
    }

    async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            let _ = self.event_tx.try_send(TransportEvent::Closed);
        }
    }
}

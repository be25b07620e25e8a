//! Session controller: role state, room lifecycle and event dispatch.
//!
//! ```text
//!                create_room ──► CreatingRoom ──(room created)──► Master
//! Unbound ──┤
//!                join_room ───► AwaitingJoinAck ──(joined room)──► Peer
//!                                                   └─► request files structure
//! any ──dispose──► Unbound (terminal)
//! ```
//!
//! Transport events and editor notifications are received one at a time
//! on a single task, so session and guard state need no locking. Editor
//! notifications are drained before the next transport event so that the
//! echoes of a remote apply are classified before another apply lands.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::ShareConfig;
use crate::editor::{EditorEvent, EditorSurface};
use crate::error::{ShareError, TransportError};
use crate::guard::{Admission, EchoGuard, Notification};
use crate::protocol::{ChangeEvent, DocPath, LoadFileRequest, ShareMessage, TreeSnapshot};
use crate::transport::{Transport, TransportEvent, WsTransport};
use crate::tree;
use crate::workspace::{self, WorkspaceStore};

/// Which side of the share this session is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unbound,
    /// Owns the canonical tree and answers structure/content queries.
    Master,
    /// Mirrors the Master's workspace.
    Peer,
}

/// Full session state, including the transitional waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    CreatingRoom,
    AwaitingJoinAck { requested: String },
    Master { room_id: String },
    Peer { room_id: String },
}

impl SessionState {
    pub fn role(&self) -> Role {
        match self {
            Self::Master { .. } => Role::Master,
            Self::Peer { .. } => Role::Peer,
            _ => Role::Unbound,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Master { room_id } | Self::Peer { room_id } => Some(room_id),
            _ => None,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, Self::CreatingRoom | Self::AwaitingJoinAck { .. })
    }
}

enum Input {
    Transport(TransportEvent),
    Editor(EditorEvent),
}

struct Subscriptions {
    transport: mpsc::Receiver<TransportEvent>,
    editor: mpsc::Receiver<EditorEvent>,
}

/// One side of a shared workspace.
pub struct ShareSession<T, S, E>
where
    T: Transport,
    S: WorkspaceStore,
    E: EditorSurface,
{
    config: ShareConfig,
    transport: T,
    store: Arc<S>,
    editor: Arc<E>,
    state: SessionState,
    guard: EchoGuard,
    /// `None` once disposed.
    subscriptions: Option<Subscriptions>,
    /// Why the last create/join ended without an ack.
    rejection: Option<String>,
}

impl<S, E> ShareSession<WsTransport, S, E>
where
    S: WorkspaceStore,
    E: EditorSurface,
{
    /// Connect to the relay named in `config` and build a session on it.
    pub async fn connect(config: ShareConfig, store: Arc<S>, editor: Arc<E>) -> Result<Self, ShareError> {
        let transport = WsTransport::connect(config.server_url.clone(), config.channel_capacity).await?;
        Self::new(config, transport, store, editor)
    }
}

impl<T, S, E> ShareSession<T, S, E>
where
    T: Transport,
    S: WorkspaceStore,
    E: EditorSurface,
{
    /// Build a session, taking both event subscriptions.
    pub fn new(config: ShareConfig, transport: T, store: Arc<S>, editor: Arc<E>) -> Result<Self, ShareError> {
        let transport_rx = transport.subscribe().ok_or(ShareError::SubscriptionTaken)?;
        let editor_rx = editor.subscribe().ok_or(ShareError::SubscriptionTaken)?;
        Ok(Self {
            config,
            transport,
            store,
            editor,
            state: SessionState::Unbound,
            guard: EchoGuard::new(),
            subscriptions: Some(Subscriptions {
                transport: transport_rx,
                editor: editor_rx,
            }),
            rejection: None,
        })
    }

    // ── Room lifecycle ──────────────────────────────────────────────

    /// Ask the relay for a new room and become its Master.
    ///
    /// Returns the room id assigned by the relay.
    pub async fn create_room(&mut self) -> Result<String, ShareError> {
        self.begin(SessionState::CreatingRoom)?;
        if let Err(e) = self.transport.emit(ShareMessage::CreateRoom).await {
            self.state = SessionState::Unbound;
            return Err(e.into());
        }
        self.await_ack("create room", "create room").await
    }

    /// Join an existing room as Peer.
    ///
    /// Returns the id the relay acknowledged, which may be a normalized
    /// form of `room_id`. The file structure is requested right away.
    pub async fn join_room(&mut self, room_id: impl Into<String>) -> Result<String, ShareError> {
        let room_id = room_id.into();
        if room_id.trim().is_empty() {
            return Err(ShareError::RoomRejected {
                request: "join room",
                reason: "room id is empty".into(),
            });
        }
        self.begin(SessionState::AwaitingJoinAck {
            requested: room_id.clone(),
        })?;
        if let Err(e) = self.transport.emit(ShareMessage::JoinRoom { room_id }).await {
            self.state = SessionState::Unbound;
            return Err(e.into());
        }
        self.await_ack("join room", "joined room").await
    }

    /// Close the transport and release both subscriptions.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn dispose(&mut self) {
        let Some(subscriptions) = self.subscriptions.take() else {
            return;
        };
        drop(subscriptions);
        self.transport.close().await;
        if let Some(room_id) = self.state.room_id() {
            log::info!("Left room {room_id}");
        }
        self.state = SessionState::Unbound;
        self.guard.reset();
    }

    fn begin(&mut self, state: SessionState) -> Result<(), ShareError> {
        if self.subscriptions.is_none() {
            return Err(ShareError::Disposed);
        }
        if let Some(room_id) = self.state.room_id() {
            log::info!("Replacing session in room {room_id}");
        }
        self.guard.reset();
        self.rejection = None;
        self.state = state;
        Ok(())
    }

    async fn await_ack(&mut self, request: &'static str, ack: &'static str) -> Result<String, ShareError> {
        let deadline = tokio::time::Instant::now() + self.config.ack_timeout();
        loop {
            if let Some(room_id) = self.state.room_id() {
                return Ok(room_id.to_string());
            }
            if !self.state.is_pending() {
                let reason = self.rejection.take().unwrap_or_else(|| "no acknowledgment".into());
                return Err(ShareError::RoomRejected { request, reason });
            }
            match tokio::time::timeout_at(deadline, self.next_input()).await {
                Ok(Some(input)) => self.dispatch(input).await,
                Ok(None) => {
                    self.state = SessionState::Unbound;
                    return Err(TransportError::Closed.into());
                }
                Err(_) => {
                    log::warn!("No '{ack}' acknowledgment within {:?}", self.config.ack_timeout());
                    self.state = SessionState::Unbound;
                    return Err(ShareError::AckTimeout(ack));
                }
            }
        }
    }

    // ── Event loop ──────────────────────────────────────────────────

    /// Process inputs until the session is disposed or both sources end.
    pub async fn run(&mut self) {
        while self.step().await {}
        log::debug!("Session loop finished");
    }

    /// Wait for and process one input. `false` when no source is left.
    pub async fn step(&mut self) -> bool {
        match self.next_input().await {
            Some(input) => {
                self.dispatch(input).await;
                true
            }
            None => false,
        }
    }

    /// Process every input that is already queued, without waiting.
    /// Returns how many were handled.
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Some(input) = self.try_next_input() {
            self.dispatch(input).await;
            handled += 1;
        }
        handled
    }

    async fn next_input(&mut self) -> Option<Input> {
        let subs = self.subscriptions.as_mut()?;
        tokio::select! {
            biased;
            Some(event) = subs.editor.recv() => Some(Input::Editor(event)),
            Some(event) = subs.transport.recv() => Some(Input::Transport(event)),
            else => None,
        }
    }

    fn try_next_input(&mut self) -> Option<Input> {
        let subs = self.subscriptions.as_mut()?;
        if let Ok(event) = subs.editor.try_recv() {
            return Some(Input::Editor(event));
        }
        subs.transport.try_recv().ok().map(Input::Transport)
    }

    async fn dispatch(&mut self, input: Input) {
        let result = match input {
            Input::Transport(TransportEvent::Message(message)) => self.on_message(message).await,
            Input::Transport(TransportEvent::Error(e)) => {
                log::warn!("Transport error: {e}");
                Ok(())
            }
            Input::Transport(TransportEvent::Closed) => {
                log::warn!("Transport closed");
                if self.state.is_pending() {
                    self.rejection = Some("transport closed".into());
                    self.state = SessionState::Unbound;
                }
                Ok(())
            }
            Input::Editor(EditorEvent::ActiveDocumentChanged { path }) => self.on_editor_switch(path).await,
            Input::Editor(EditorEvent::DocumentTextChanged { path, text }) => {
                self.on_document_change(path, text).await
            }
        };
        if let Err(e) = result {
            log::error!("Session error: {e}");
        }
    }

    // ── Transport events ────────────────────────────────────────────

    async fn on_message(&mut self, message: ShareMessage) -> Result<(), ShareError> {
        log::debug!("received '{}' as {:?}", message.event_name(), self.role());
        match message {
            ShareMessage::RoomCreated { room_id } => {
                if self.state != SessionState::CreatingRoom {
                    return self.drop_violation("create room");
                }
                log::info!("Created room {room_id}");
                self.state = SessionState::Master { room_id };
                Ok(())
            }
            ShareMessage::JoinedRoom { room_id } => {
                let SessionState::AwaitingJoinAck { requested } = &self.state else {
                    return self.drop_violation("joined room");
                };
                if *requested != room_id {
                    log::debug!("Relay normalized room id {requested:?} to {room_id:?}");
                }
                log::info!("Joined room {room_id}");
                self.state = SessionState::Peer { room_id };
                self.transport.emit(ShareMessage::RequestFilesStructure).await?;
                Ok(())
            }
            ShareMessage::RoomError { reason } => {
                if self.state.is_pending() {
                    log::warn!("Room request refused: {reason}");
                    self.rejection = Some(reason);
                    self.state = SessionState::Unbound;
                } else {
                    log::warn!("Ignoring room error while {:?}: {reason}", self.role());
                }
                Ok(())
            }
            ShareMessage::RequestFilesStructure => {
                if self.role() != Role::Master {
                    return self.drop_violation("request files structure");
                }
                self.send_files_structure().await
            }
            ShareMessage::FilesStructure(snapshot) => {
                if self.role() != Role::Peer {
                    return self.drop_violation("files structure");
                }
                self.materialize(snapshot).await;
                Ok(())
            }
            ShareMessage::LoadFile(request) => {
                if self.role() != Role::Master {
                    return self.drop_violation("load file");
                }
                self.serve_file(request).await
            }
            ShareMessage::CodeChange(change) => {
                if self.role() == Role::Unbound {
                    return self.drop_violation("code change");
                }
                self.apply_remote_change(change).await
            }
            ShareMessage::CreateRoom | ShareMessage::JoinRoom { .. } => {
                self.drop_violation("room request")
            }
        }
    }

    fn drop_violation(&self, event: &str) -> Result<(), ShareError> {
        log::warn!("Dropping '{event}' received while {:?}", self.state);
        Ok(())
    }

    async fn send_files_structure(&mut self) -> Result<(), ShareError> {
        let files = self.store.list_all_files().await?;
        let snapshot = tree::encode_paths(&files);
        log::info!(
            "Sending files structure: {} files, {} top-level entries",
            files.len(),
            snapshot.children.len()
        );
        self.transport.emit(ShareMessage::FilesStructure(snapshot)).await?;
        Ok(())
    }

    async fn materialize(&mut self, snapshot: TreeSnapshot) {
        let report = tree::materialize(&snapshot, self.store.as_ref()).await;
        if report.is_clean() {
            log::info!(
                "Workspace reconciled: {} new files, {} already present",
                report.files_created,
                report.files_existing
            );
        } else {
            log::warn!(
                "Workspace partially reconciled: {} failures, {} files skipped",
                report.failures.len(),
                report.skipped.len()
            );
        }
    }

    async fn serve_file(&mut self, request: LoadFileRequest) -> Result<(), ShareError> {
        let pattern = workspace::exact_pattern(&request.file_path);
        let Some(path) = self.store.find_files(&pattern).await?.into_iter().next() else {
            log::debug!("Requested file {} not found", request.file_path);
            return Ok(());
        };
        let Some(code) = self.store.open_document(&path).await? else {
            return Ok(());
        };
        self.transport
            .emit(ShareMessage::CodeChange(ChangeEvent::new(path, code)))
            .await?;
        Ok(())
    }

    async fn apply_remote_change(&mut self, change: ChangeEvent) -> Result<(), ShareError> {
        let ChangeEvent { file_path, code } = change;
        tree::ensure_document(&file_path, self.store.as_ref()).await?;

        let switches = self.editor.active_document().await.as_ref() != Some(&file_path);
        self.editor.open_or_show_document(&file_path).await?;
        let changes = self.editor.active_document_text().await.as_deref() != Some(code.as_str());
        if changes {
            self.editor.replace_active_document_content(&code).await?;
        }

        let mut apply = self.guard.begin_remote_apply();
        if switches {
            apply.arm_switch();
        }
        if changes {
            apply.arm_change();
        }
        apply.commit(code);
        log::debug!("Applied remote content to {file_path}");
        Ok(())
    }

    // ── Editor notifications ────────────────────────────────────────

    async fn on_editor_switch(&mut self, path: Option<PathBuf>) -> Result<(), ShareError> {
        let role = self.role();
        if role == Role::Unbound {
            return Ok(());
        }
        let Some(path) = path else {
            return Ok(());
        };
        let text = self.editor.active_document_text().await.unwrap_or_default();
        if !self.admit(Notification::EditorSwitch, &text) {
            return Ok(());
        }
        let Some(doc) = self.relative(&path) else {
            return Ok(());
        };
        let message = match role {
            Role::Peer => ShareMessage::LoadFile(LoadFileRequest { file_path: doc }),
            _ => ShareMessage::CodeChange(ChangeEvent::new(doc, text)),
        };
        self.transport.emit(message).await?;
        Ok(())
    }

    async fn on_document_change(&mut self, path: PathBuf, text: String) -> Result<(), ShareError> {
        if self.role() == Role::Unbound {
            return Ok(());
        }
        if !self.admit(Notification::DocumentChange, &text) {
            return Ok(());
        }
        let Some(doc) = self.relative(&path) else {
            return Ok(());
        };
        self.transport
            .emit(ShareMessage::CodeChange(ChangeEvent::new(doc, text)))
            .await?;
        Ok(())
    }

    fn admit(&mut self, notification: Notification, text: &str) -> bool {
        match self.guard.admit(notification, text) {
            Admission::Local => true,
            verdict => {
                log::trace!("Suppressed {notification:?} ({verdict:?})");
                false
            }
        }
    }

    fn relative(&self, path: &std::path::Path) -> Option<DocPath> {
        let doc = DocPath::relative_to(self.store.root(), path);
        if doc.is_none() {
            log::debug!("Ignoring {} outside the workspace", path.display());
        }
        doc
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        self.state.room_id()
    }

    pub fn is_disposed(&self) -> bool {
        self.subscriptions.is_none()
    }

    pub fn last_applied_remote_content(&self) -> Option<&str> {
        self.guard.last_applied()
    }

    pub fn config(&self) -> &ShareConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn editor(&self) -> &Arc<E> {
        &self.editor
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

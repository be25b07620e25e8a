//! Editor surface seam.
//!
//! The host editor owns documents and tells the session about local
//! activity through [`EditorEvent`]s. [`HeadlessEditor`] is a buffer-only
//! surface over a [`WorkspaceStore`] that behaves like a host editor:
//! opening another document fires `ActiveDocumentChanged`, replacing
//! content fires `DocumentTextChanged`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::EditorError;
use crate::protocol::DocPath;
use crate::workspace::WorkspaceStore;

/// Local editor notification. Paths are absolute, as the host reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    /// Another document became active (`None`: no editor open).
    ActiveDocumentChanged { path: Option<PathBuf> },
    /// A document's text changed; carries the full new text.
    DocumentTextChanged { path: PathBuf, text: String },
}

#[async_trait]
pub trait EditorSurface: Send + Sync {
    /// Workspace-relative path of the active document.
    async fn active_document(&self) -> Option<DocPath>;

    /// Full text of the active document.
    async fn active_document_text(&self) -> Option<String>;

    /// Replace the whole content of the active document.
    async fn replace_active_document_content(&self, text: &str) -> Result<(), EditorError>;

    /// Open `path`, or bring it to front if already open, and make it active.
    async fn open_or_show_document(&self, path: &DocPath) -> Result<(), EditorError>;

    /// Take the notification receiver. Only the first call gets it.
    fn subscribe(&self) -> Option<mpsc::Receiver<EditorEvent>>;
}

#[derive(Debug, Default)]
struct Buffer {
    path: Option<DocPath>,
    text: String,
}

/// Buffer-only editor writing through to a workspace store.
pub struct HeadlessEditor<S: WorkspaceStore> {
    store: Arc<S>,
    active: Mutex<Buffer>,
    event_tx: mpsc::Sender<EditorEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<EditorEvent>>>,
}

impl<S: WorkspaceStore> HeadlessEditor<S> {
    pub fn new(store: Arc<S>, capacity: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        Self {
            store,
            active: Mutex::new(Buffer::default()),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
        }
    }

    /// Simulate the user typing: replace the active buffer and notify.
    pub async fn type_text(&self, text: &str) -> Result<(), EditorError> {
        self.replace_active_document_content(text).await
    }

    /// Simulate the user switching to `path`.
    pub async fn switch_to(&self, path: &DocPath) -> Result<(), EditorError> {
        self.open_or_show_document(path).await
    }

    fn abs(&self, path: &DocPath) -> PathBuf {
        path.to_path(self.store.root())
    }

    async fn notify(&self, event: EditorEvent) {
        // Nobody listening is fine for a headless surface.
        if self.event_tx.send(event).await.is_err() {
            log::trace!("Editor notification dropped: no subscriber");
        }
    }
}

#[async_trait]
impl<S: WorkspaceStore> EditorSurface for HeadlessEditor<S> {
    async fn active_document(&self) -> Option<DocPath> {
        self.active.lock().await.path.clone()
    }

    async fn active_document_text(&self) -> Option<String> {
        let buffer = self.active.lock().await;
        buffer.path.as_ref().map(|_| buffer.text.clone())
    }

    async fn replace_active_document_content(&self, text: &str) -> Result<(), EditorError> {
        let path = {
            let mut buffer = self.active.lock().await;
            let path = buffer.path.clone().ok_or(EditorError::NoActiveDocument)?;
            if buffer.text == text {
                return Ok(());
            }
            buffer.text = text.to_string();
            path
        };
        self.store.write_document(&path, text).await?;
        self.notify(EditorEvent::DocumentTextChanged {
            path: self.abs(&path),
            text: text.to_string(),
        })
        .await;
        Ok(())
    }

    async fn open_or_show_document(&self, path: &DocPath) -> Result<(), EditorError> {
        let text = self
            .store
            .open_document(path)
            .await?
            .ok_or_else(|| EditorError::Open {
                path: path.to_string(),
                reason: "no such document".to_string(),
            })?;
        {
            let mut buffer = self.active.lock().await;
            if buffer.path.as_ref() == Some(path) {
                return Ok(());
            }
            buffer.path = Some(path.clone());
            buffer.text = text;
        }
        self.notify(EditorEvent::ActiveDocumentChanged {
            path: Some(self.abs(path)),
        })
        .await;
        Ok(())
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<EditorEvent>> {
        self.event_rx.lock().ok()?.take()
    }
}

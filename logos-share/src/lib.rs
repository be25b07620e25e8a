//! # logos-share: Shared-workspace sync for Logos
//!
//! One editor instance (the Master) shares its workspace through a relay;
//! any number of others (Peers) join the room, rebuild the file tree
//! locally and exchange whole-document changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                     ┌──────────────┐
//! │ ShareSession │ ◄──── WebSocket ──► │ RelayServer  │
//! │ (Master)     │     bincode frames  │ (rooms)      │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Workspace    │                     │ RoomGroup    │
//! │ + Editor     │                     │ (fan-out)    │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                     ┌───────┴──────┐
//!                                     │ ShareSession │
//!                                     │ (Peer)       │
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Events, file-tree nodes and the bincode frame
//! - [`transport`]: Event-oriented channel to the relay
//! - [`workspace`]: File store behind a glob-based trait
//! - [`editor`]: Host editor surface and a headless implementation
//! - [`tree`]: Path list to tree encoding and tree materialization
//! - [`guard`]: Echo suppression for remotely applied content
//! - [`session`]: Master/Peer session controller
//! - [`broadcast`] / [`relay`]: The room relay server

pub mod broadcast;
pub mod config;
pub mod editor;
pub mod error;
pub mod guard;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod transport;
pub mod tree;
pub mod workspace;

// Re-exports for convenience
pub use config::ShareConfig;
pub use editor::{EditorEvent, EditorSurface, HeadlessEditor};
pub use error::{EditorError, ProtocolError, ShareError, StoreError, TransportError};
pub use guard::{Admission, EchoGuard, Notification};
pub use protocol::{ChangeEvent, DocPath, Frame, LoadFileRequest, ShareMessage, TreeNode, TreeSnapshot};
pub use relay::{RelayConfig, RelayServer};
pub use session::{Role, SessionState, ShareSession};
pub use transport::{MemoryHandle, MemoryTransport, Transport, TransportEvent, WsTransport};
pub use tree::MaterializeReport;
pub use workspace::{FsWorkspace, MemoryWorkspace, WorkspaceStore};

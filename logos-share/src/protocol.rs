//! Wire protocol for workspace sharing.
//!
//! Every transport event is one [`ShareMessage`] variant wrapped in a
//! [`Frame`] carrying the sender id, bincode-encoded into a single
//! WebSocket binary message:
//!
//! ```text
//! ┌───────────┬──────────────┬─────────────────────────────┐
//! │ sender    │ variant tag  │ payload (variant-specific)  │
//! │ 16 bytes  │ varint       │ variable                    │
//! └───────────┴──────────────┴─────────────────────────────┘
//! ```
//!
//! Content always travels as whole documents; there is no diffing.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Validated path of a document relative to the workspace root.
///
/// Always has at least one segment; no segment is empty, `.`, `..`, or
/// contains a separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct DocPath(Vec<String>);

impl DocPath {
    /// Build from segments, validating each one.
    pub fn new<I, S>(segments: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(ProtocolError::InvalidPath(String::new()));
        }
        for segment in &segments {
            let bad = segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains('/')
                || segment.contains('\\');
            if bad {
                return Err(ProtocolError::InvalidPath(segments.join("/")));
            }
        }
        Ok(Self(segments))
    }

    /// Parse a `/`-separated relative path such as `src/main.rs`.
    pub fn parse(path: &str) -> Result<Self, ProtocolError> {
        Self::new(path.split('/'))
    }

    /// Path of `absolute` relative to `root`, if it lies inside it.
    pub fn relative_to(root: &Path, absolute: &Path) -> Option<Self> {
        let rel = absolute.strip_prefix(root).ok()?;
        let mut segments = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Self::new(segments).ok()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Final segment.
    pub fn file_name(&self) -> &str {
        // Never empty by construction.
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// Every proper ancestor, shortest first (`a`, `a/b` for `a/b/c.txt`).
    pub fn ancestors(&self) -> Vec<DocPath> {
        (1..self.0.len())
            .map(|n| DocPath(self.0[..n].to_vec()))
            .collect()
    }

    /// Child path `self/name`.
    pub fn join(&self, name: impl Into<String>) -> Result<Self, ProtocolError> {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self::new(segments)
    }

    /// Absolute location under `root`.
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(&self.0);
        path
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl TryFrom<Vec<String>> for DocPath {
    type Error = ProtocolError;

    fn try_from(segments: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(segments)
    }
}

impl From<DocPath> for Vec<String> {
    fn from(path: DocPath) -> Self {
        path.0
    }
}

/// One entry of a workspace tree snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub filename: String,
    pub is_directory: bool,
    /// Leaf only: text after the final `.` of the filename.
    #[serde(default)]
    pub extension: Option<String>,
    /// Directory only.
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn directory(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            is_directory: true,
            extension: None,
            children: Vec::new(),
        }
    }

    pub fn file(filename: impl Into<String>) -> Self {
        let filename = filename.into();
        let extension = extension_of(&filename);
        Self {
            filename,
            is_directory: false,
            extension,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<TreeNode>) -> Self {
        self.children = children;
        self
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_directory
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TreeNode::node_count).sum::<usize>()
    }

    fn sort_recursive(&mut self) {
        self.children.sort_by(|a, b| a.filename.cmp(&b.filename));
        for child in &mut self.children {
            child.sort_recursive();
        }
    }
}

/// Substring after the final `.`, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    filename
        .rfind('.')
        .map(|idx| filename[idx + 1..].to_string())
}

/// Wire form of an entire workspace tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub children: Vec<TreeNode>,
}

impl TreeSnapshot {
    pub fn new(children: Vec<TreeNode>) -> Self {
        Self { children }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.children.iter().map(TreeNode::node_count).sum()
    }

    /// Copy with every level ordered by filename, for structural comparison.
    pub fn sorted(&self) -> Self {
        let mut root = TreeNode::directory("").with_children(self.children.clone());
        root.sort_recursive();
        Self::new(root.children)
    }
}

/// Full content of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub file_path: DocPath,
    pub code: String,
}

impl ChangeEvent {
    pub fn new(file_path: DocPath, code: impl Into<String>) -> Self {
        Self {
            file_path,
            code: code.into(),
        }
    }
}

/// Peer asks the Master for a document's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadFileRequest {
    pub file_path: DocPath,
}

/// Discriminant of [`ShareMessage`], useful for logging and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    CreateRoom = 1,
    RoomCreated = 2,
    JoinRoom = 3,
    JoinedRoom = 4,
    RoomError = 5,
    RequestFilesStructure = 6,
    FilesStructure = 7,
    LoadFile = 8,
    CodeChange = 9,
}

/// One named transport event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareMessage {
    /// Ask the relay for a fresh room.
    CreateRoom,
    /// Relay acknowledgment of `CreateRoom` with the assigned id.
    RoomCreated { room_id: String },
    JoinRoom { room_id: String },
    /// Join acknowledgment; carries the relay-normalized id.
    JoinedRoom { room_id: String },
    /// Room creation or join was refused.
    RoomError { reason: String },
    RequestFilesStructure,
    FilesStructure(TreeSnapshot),
    LoadFile(LoadFileRequest),
    CodeChange(ChangeEvent),
}

impl ShareMessage {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CreateRoom => EventKind::CreateRoom,
            Self::RoomCreated { .. } => EventKind::RoomCreated,
            Self::JoinRoom { .. } => EventKind::JoinRoom,
            Self::JoinedRoom { .. } => EventKind::JoinedRoom,
            Self::RoomError { .. } => EventKind::RoomError,
            Self::RequestFilesStructure => EventKind::RequestFilesStructure,
            Self::FilesStructure(_) => EventKind::FilesStructure,
            Self::LoadFile(_) => EventKind::LoadFile,
            Self::CodeChange(_) => EventKind::CodeChange,
        }
    }

    /// Event name as used on the channel.
    pub fn event_name(&self) -> &'static str {
        match self.kind() {
            EventKind::CreateRoom | EventKind::RoomCreated => "create room",
            EventKind::JoinRoom => "join room",
            EventKind::JoinedRoom => "joined room",
            EventKind::RoomError => "room error",
            EventKind::RequestFilesStructure => "request files structure",
            EventKind::FilesStructure => "files structure",
            EventKind::LoadFile => "load file",
            EventKind::CodeChange => "code change",
        }
    }

    /// Room-control events are answered by the relay rather than fanned out.
    pub fn is_room_control(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::CreateRoom
                | EventKind::RoomCreated
                | EventKind::JoinRoom
                | EventKind::JoinedRoom
                | EventKind::RoomError
        )
    }
}

/// A message plus the id of the connection that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub sender: Uuid,
    pub message: ShareMessage,
}

impl Frame {
    pub fn new(sender: Uuid, message: ShareMessage) -> Self {
        Self { sender, message }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_path_parse() {
        let path = DocPath::parse("src/lib.rs").unwrap();
        assert_eq!(path.segments(), &["src".to_string(), "lib.rs".to_string()]);
        assert_eq!(path.file_name(), "lib.rs");
        assert_eq!(path.to_string(), "src/lib.rs");
    }

    #[test]
    fn test_doc_path_rejects_bad_segments() {
        assert!(DocPath::parse("").is_err());
        assert!(DocPath::parse("a//b").is_err());
        assert!(DocPath::parse("../etc/passwd").is_err());
        assert!(DocPath::parse("a/./b").is_err());
        assert!(DocPath::new(Vec::<String>::new()).is_err());
        assert!(DocPath::new(["a\\b"]).is_err());
    }

    #[test]
    fn test_doc_path_relative_to() {
        let root = Path::new("/work/project");
        let rel = DocPath::relative_to(root, Path::new("/work/project/a/b.txt")).unwrap();
        assert_eq!(rel.to_string(), "a/b.txt");

        assert!(DocPath::relative_to(root, Path::new("/elsewhere/b.txt")).is_none());
        assert!(DocPath::relative_to(root, root).is_none());
    }

    #[test]
    fn test_doc_path_ancestors_and_join() {
        let path = DocPath::parse("a/b/c.txt").unwrap();
        let ancestors: Vec<String> = path.ancestors().iter().map(|p| p.to_string()).collect();
        assert_eq!(ancestors, vec!["a", "a/b"]);

        let joined = DocPath::parse("a").unwrap().join("b.rs").unwrap();
        assert_eq!(joined.to_string(), "a/b.rs");
        assert!(DocPath::parse("a").unwrap().join("").is_err());
    }

    #[test]
    fn test_doc_path_to_path() {
        let path = DocPath::parse("a/b.txt").unwrap();
        assert_eq!(path.to_path(Path::new("/root")), PathBuf::from("/root/a/b.txt"));
    }

    #[test]
    fn test_extension_rules() {
        assert_eq!(TreeNode::file("a.txt").extension.as_deref(), Some("txt"));
        assert_eq!(TreeNode::file("archive.tar.gz").extension.as_deref(), Some("gz"));
        assert_eq!(TreeNode::file("Makefile").extension, None);
        assert_eq!(TreeNode::file(".gitignore").extension.as_deref(), Some("gitignore"));
        assert_eq!(TreeNode::directory("src.d").extension, None);
    }

    #[test]
    fn test_tree_node_json_field_names() {
        let node = TreeNode::file("a.txt");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["filename"], "a.txt");
        assert_eq!(json["isDirectory"], false);
        assert_eq!(json["extension"], "txt");

        let change = ChangeEvent::new(DocPath::parse("x/y.md").unwrap(), "hi");
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["filePath"], serde_json::json!(["x", "y.md"]));
        assert_eq!(json["code"], "hi");
    }

    #[test]
    fn test_invalid_path_rejected_on_decode() {
        let json = serde_json::json!({ "filePath": ["a", ""], "code": "x" });
        assert!(serde_json::from_value::<ChangeEvent>(json).is_err());
    }

    #[test]
    fn test_frame_carries_snapshot() {
        let snapshot = TreeSnapshot::new(vec![
            TreeNode::directory("src").with_children(vec![TreeNode::file("main.rs")]),
            TreeNode::file("README.md"),
        ]);
        let sender = Uuid::new_v4();
        let frame = Frame::new(sender, ShareMessage::FilesStructure(snapshot.clone()));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.message, ShareMessage::FilesStructure(snapshot));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Frame::decode(&garbage).is_err());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ShareMessage::CreateRoom.event_name(), "create room");
        assert_eq!(
            ShareMessage::RoomCreated { room_id: "x".into() }.event_name(),
            "create room"
        );
        assert_eq!(
            ShareMessage::JoinedRoom { room_id: "x".into() }.event_name(),
            "joined room"
        );
        assert_eq!(
            ShareMessage::RequestFilesStructure.event_name(),
            "request files structure"
        );
        let load = ShareMessage::LoadFile(LoadFileRequest {
            file_path: DocPath::parse("a").unwrap(),
        });
        assert_eq!(load.event_name(), "load file");
        assert!(!load.is_room_control());
        assert!(ShareMessage::CreateRoom.is_room_control());
    }

    #[test]
    fn test_sorted_snapshot() {
        let snapshot = TreeSnapshot::new(vec![
            TreeNode::file("b.txt"),
            TreeNode::directory("a").with_children(vec![TreeNode::file("z"), TreeNode::file("y")]),
        ]);
        let sorted = snapshot.sorted();
        assert_eq!(sorted.children[0].filename, "a");
        assert_eq!(sorted.children[0].children[0].filename, "y");
        assert_eq!(sorted.children[1].filename, "b.txt");
        assert_eq!(snapshot.node_count(), 4);
    }
}

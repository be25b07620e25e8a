//! Echo suppression for remotely applied content.
//!
//! Applying a `code change` makes the host editor fire its own
//! notifications (an editor switch for the open, a document change for the
//! replace). Those must not be sent back out as new local edits.
//!
//! ```text
//! remote code change
//!       │
//!       ▼
//! begin_remote_apply() ── open/replace in editor ── commit(content)
//!                                                      │ arms markers
//!                                                      ▼
//! editor notification ──► admit() ──► SystemOriginated | Echo | Local
//! ```
//!
//! The two markers are independent one-shots: each absorbs exactly one
//! notification of its own kind.

/// Kind of local editor notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The active editor changed to another document.
    EditorSwitch,
    /// The text of a document changed.
    DocumentChange,
}

/// Verdict on a local notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Caused by our own remote apply; a marker was consumed.
    SystemOriginated,
    /// Text equals the last remote content; the record was cleared.
    Echo,
    /// A genuine local edit that should be transmitted.
    Local,
}

impl Admission {
    pub fn is_local(self) -> bool {
        self == Admission::Local
    }
}

/// Per-session suppression state.
#[derive(Debug, Default)]
pub struct EchoGuard {
    last_applied: Option<String>,
    switch_marker: bool,
    change_marker: bool,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start applying remote content. Nothing is armed until `commit`.
    pub fn begin_remote_apply(&mut self) -> RemoteApply<'_> {
        RemoteApply {
            guard: self,
            arm_switch: false,
            arm_change: false,
        }
    }

    /// Classify a local notification carrying the document's current text.
    pub fn admit(&mut self, notification: Notification, text: &str) -> Admission {
        let marker = match notification {
            Notification::EditorSwitch => &mut self.switch_marker,
            Notification::DocumentChange => &mut self.change_marker,
        };
        if std::mem::take(marker) {
            return Admission::SystemOriginated;
        }
        if self.last_applied.as_deref() == Some(text) {
            self.last_applied = None;
            return Admission::Echo;
        }
        Admission::Local
    }

    pub fn last_applied(&self) -> Option<&str> {
        self.last_applied.as_deref()
    }

    pub fn is_armed(&self, notification: Notification) -> bool {
        match notification {
            Notification::EditorSwitch => self.switch_marker,
            Notification::DocumentChange => self.change_marker,
        }
    }

    /// Forget everything; used when a new session replaces the old one.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// An in-progress remote apply.
///
/// Dropping it without [`commit`](RemoteApply::commit) leaves the guard as
/// it was, so a failed apply cannot swallow a later local edit.
#[must_use = "a remote apply does nothing until committed"]
pub struct RemoteApply<'a> {
    guard: &'a mut EchoGuard,
    arm_switch: bool,
    arm_change: bool,
}

impl RemoteApply<'_> {
    /// The apply will cause one editor-switch notification.
    pub fn arm_switch(&mut self) {
        self.arm_switch = true;
    }

    /// The apply will cause one document-change notification.
    pub fn arm_change(&mut self) {
        self.arm_change = true;
    }

    /// Record `content` as applied and arm the selected markers.
    ///
    /// Markers still pending from an earlier apply stay armed: their
    /// notification has not been delivered yet.
    pub fn commit(self, content: impl Into<String>) {
        self.guard.last_applied = Some(content.into());
        self.guard.switch_marker |= self.arm_switch;
        self.guard.change_marker |= self.arm_change;
    }
}

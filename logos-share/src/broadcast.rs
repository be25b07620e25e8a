//! Room fan-out for the relay.
//!
//! Every room owns one tokio broadcast channel. A frame sent into a room
//! reaches every member's receiver once; each connection drops the frames
//! it sent itself.
//!
//! ```text
//! Master ──frame──► RoomGroup ──┬──► Master (skipped: own frame)
//!                               ├──► Peer A
//!                               └──► Peer B
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// An encoded frame tagged with the connection that sent it.
#[derive(Debug)]
pub struct Envelope {
    pub sender: Uuid,
    pub bytes: Vec<u8>,
}

/// Which part a member plays in its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// Created the room.
    Owner,
    /// Joined an existing room.
    Guest,
}

/// Statistics for monitoring a room.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub members: usize,
}

/// Broadcast group for a single room.
pub struct RoomGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    members: RwLock<HashMap<Uuid, MemberKind>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl RoomGroup {
    /// `capacity` frames are buffered per member before a slow member lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a member and hand back its receiver.
    pub async fn add_member(&self, id: Uuid, kind: MemberKind) -> broadcast::Receiver<Arc<Envelope>> {
        self.members.write().await.insert(id, kind);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, id: &Uuid) -> Option<MemberKind> {
        self.members.write().await.remove(id)
    }

    /// Fan a frame out to all members. Returns how many receivers got it.
    pub fn send(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(Arc::new(envelope)).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, id: &Uuid) -> bool {
        self.members.read().await.contains_key(id)
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Why [`RoomManager::join`] refused a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRefusal {
    NotFound,
    Full,
}

impl std::fmt::Display for JoinRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinRefusal::NotFound => f.write_str("not found"),
            JoinRefusal::Full => f.write_str("is full"),
        }
    }
}

/// Maps room ids to their broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<RoomGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Create a room under `room_id`. `None` if the id is taken.
    pub async fn create(&self, room_id: &str) -> Option<Arc<RoomGroup>> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(room_id) {
            return None;
        }
        let room = Arc::new(RoomGroup::new(self.default_capacity));
        rooms.insert(room_id.to_string(), room.clone());
        Some(room)
    }

    /// Add a member to an existing room.
    ///
    /// The room map stays locked while the member is added, so a concurrent
    /// [`remove_if_empty`](Self::remove_if_empty) cannot orphan the room.
    pub async fn join(
        &self,
        room_id: &str,
        id: Uuid,
        kind: MemberKind,
        max_members: usize,
    ) -> Result<(Arc<RoomGroup>, broadcast::Receiver<Arc<Envelope>>), JoinRefusal> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(room_id).ok_or(JoinRefusal::NotFound)?;
        if room.member_count().await >= max_members {
            return Err(JoinRefusal::Full);
        }
        let rx = room.add_member(id, kind).await;
        Ok((room.clone(), rx))
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<RoomGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Remove a room once its last member has left.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.member_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_member() {
        let room = RoomGroup::new(16);
        let id = Uuid::new_v4();

        let _rx = room.add_member(id, MemberKind::Owner).await;
        assert_eq!(room.member_count().await, 1);
        assert!(room.has_member(&id).await);

        assert_eq!(room.remove_member(&id).await, Some(MemberKind::Owner));
        assert_eq!(room.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_member() {
        let room = RoomGroup::new(16);
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let mut rx_owner = room.add_member(owner, MemberKind::Owner).await;
        let mut rx_guest = room.add_member(guest, MemberKind::Guest).await;

        let count = room.send(Envelope {
            sender: owner,
            bytes: vec![1, 2, 3],
        });
        assert_eq!(count, 2);

        assert_eq!(rx_owner.recv().await.unwrap().sender, owner);
        let got = rx_guest.recv().await.unwrap();
        assert_eq!(got.bytes, vec![1, 2, 3]);

        let stats = room.stats().await;
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.members, 2);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let manager = RoomManager::new(16);
        assert!(manager.create("abc123").await.is_some());
        assert!(manager.create("abc123").await.is_none());
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(manager.active_rooms().await, vec!["abc123".to_string()]);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let manager = RoomManager::new(16);
        let room1 = manager.create("one").await.unwrap();
        let room2 = manager.create("two").await.unwrap();

        let mut rx1 = room1.add_member(Uuid::new_v4(), MemberKind::Owner).await;
        let _rx2 = room2.add_member(Uuid::new_v4(), MemberKind::Owner).await;

        room2.send(Envelope {
            sender: Uuid::new_v4(),
            bytes: vec![9],
        });
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cleanup_only_when_empty() {
        let manager = RoomManager::new(16);
        let room = manager.create("r").await.unwrap();
        let id = Uuid::new_v4();
        let _rx = room.add_member(id, MemberKind::Owner).await;

        assert!(!manager.remove_if_empty("r").await);
        room.remove_member(&id).await;
        assert!(manager.remove_if_empty("r").await);
        assert!(manager.get("r").await.is_none());
    }

    #[tokio::test]
    async fn test_join_existing_room() {
        let manager = RoomManager::new(16);
        let room = manager.create("r").await.unwrap();
        let _owner = room.add_member(Uuid::new_v4(), MemberKind::Owner).await;

        let guest = Uuid::new_v4();
        let (joined, _rx) = manager.join("r", guest, MemberKind::Guest, 2).await.unwrap();
        assert!(Arc::ptr_eq(&joined, &room));
        assert!(room.has_member(&guest).await);

        assert_eq!(
            manager.join("r", Uuid::new_v4(), MemberKind::Guest, 2).await.err(),
            Some(JoinRefusal::Full)
        );
        assert_eq!(
            manager.join("nope", Uuid::new_v4(), MemberKind::Guest, 2).await.err(),
            Some(JoinRefusal::NotFound)
        );
    }
}

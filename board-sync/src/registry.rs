//! Session registry: which session is subscribed to which room.
//!
//! Two indexes are kept in lockstep:
//!
//! ```text
//! sessions: SessionId ──► Session { room: Option<RoomId>, .. }
//! rooms:    RoomId    ──► {SessionId, ..}
//! ```
//!
//! A session is in at most one room. Every mutation updates both maps, so
//! `session.room == Some(r)` exactly when `rooms[r]` contains the session.
//! The registry only returns outcomes; the hub turns them into room events.

use std::collections::{HashMap, HashSet};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::model::{RoomId, SessionId, UserId};
use crate::protocol::{DisplayInfo, PresenceEntry};

/// One connected participant.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display: DisplayInfo,
    pub room: Option<RoomId>,
    /// When the session joined its current room (ms since epoch)
    pub joined_at_ms: u64,
    pub last_seen: Instant,
}

impl Session {
    fn presence(&self) -> PresenceEntry {
        PresenceEntry {
            session_id: self.session_id,
            user_id: self.user_id,
            display: self.display.clone(),
            joined_at_ms: self.joined_at_ms,
        }
    }
}

/// Result of a [`SessionRegistry::join`].
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub room_id: RoomId,
    /// The joining session as others will see it.
    pub entry: PresenceEntry,
    /// Everyone in the room after the join, the joiner included.
    pub presence: Vec<PresenceEntry>,
    /// Implicit leave of the previous room, if there was one.
    pub left: Option<LeaveOutcome>,
    /// The session was already in this room; nothing changed.
    pub already_member: bool,
}

/// Result of a leave or disconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    pub entry: PresenceEntry,
    /// No session is left in the room.
    pub room_empty: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    rooms: HashMap<RoomId, HashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly authenticated session. Returns `false` if it already exists.
    pub fn register(&mut self, session_id: SessionId, user_id: UserId, display: DisplayInfo) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }
        self.sessions.insert(
            session_id,
            Session {
                session_id,
                user_id,
                display,
                room: None,
                joined_at_ms: 0,
                last_seen: Instant::now(),
            },
        );
        true
    }

    /// Subscribe `session_id` to `room_id`, leaving its previous room first.
    ///
    /// Unknown sessions are registered on the fly with a default display.
    pub fn join(&mut self, session_id: SessionId, room_id: RoomId, user_id: UserId) -> JoinOutcome {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.last_seen = Instant::now();
            if session.room == Some(room_id) {
                let entry = session.presence();
                return JoinOutcome {
                    room_id,
                    entry,
                    presence: self.list_presence(&room_id),
                    left: None,
                    already_member: true,
                };
            }
        }

        let left = self.leave(session_id);

        let session = self.sessions.entry(session_id).or_insert_with(|| Session {
            session_id,
            user_id,
            display: DisplayInfo::for_user(user_id, short_name(user_id)),
            room: None,
            joined_at_ms: 0,
            last_seen: Instant::now(),
        });
        session.room = Some(room_id);
        session.joined_at_ms = now_ms();
        let entry = session.presence();
        self.rooms.entry(room_id).or_default().insert(session_id);

        JoinOutcome {
            room_id,
            entry,
            presence: self.list_presence(&room_id),
            left,
            already_member: false,
        }
    }

    /// Unsubscribe `session_id` from its room. No-op when it is not subscribed.
    pub fn leave(&mut self, session_id: SessionId) -> Option<LeaveOutcome> {
        let session = self.sessions.get_mut(&session_id)?;
        let room_id = session.room.take()?;
        let entry = session.presence();

        let room_empty = match self.rooms.get_mut(&room_id) {
            Some(members) => {
                members.remove(&session_id);
                members.is_empty()
            }
            None => true,
        };
        if room_empty {
            self.rooms.remove(&room_id);
        }

        Some(LeaveOutcome {
            room_id,
            entry,
            room_empty,
        })
    }

    /// Leave plus forget the session entirely. Safe to call repeatedly.
    pub fn disconnect(&mut self, session_id: SessionId) -> Option<LeaveOutcome> {
        let left = self.leave(session_id);
        self.sessions.remove(&session_id);
        left
    }

    /// Everyone in `room_id`, oldest join first.
    pub fn list_presence(&self, room_id: &RoomId) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .rooms
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|sid| self.sessions.get(sid))
            .map(Session::presence)
            .collect();
        entries.sort_by(|a, b| {
            a.joined_at_ms
                .cmp(&b.joined_at_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        entries
    }

    /// Refresh `last_seen` for a session.
    pub fn touch(&mut self, session_id: &SessionId) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_seen = Instant::now();
        }
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn room_of(&self, session_id: &SessionId) -> Option<RoomId> {
        self.sessions.get(session_id).and_then(|s| s.room)
    }

    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, HashSet::len)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Check that both indexes agree.
    pub fn is_consistent(&self) -> bool {
        let forward = self.sessions.values().all(|s| match s.room {
            Some(room) => self
                .rooms
                .get(&room)
                .is_some_and(|members| members.contains(&s.session_id)),
            None => true,
        });
        let backward = self.rooms.iter().all(|(room, members)| {
            !members.is_empty()
                && members
                    .iter()
                    .all(|sid| self.sessions.get(sid).and_then(|s| s.room) == Some(*room))
        });
        forward && backward
    }
}

fn short_name(user_id: UserId) -> String {
    let full = user_id.to_string();
    format!("User-{}", &full[..8])
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ids() -> (SessionId, UserId) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_join_returns_presence_including_joiner() {
        let mut reg = SessionRegistry::new();
        let room = Uuid::new_v4();
        let (s1, u1) = ids();
        let (s2, u2) = ids();

        let first = reg.join(s1, room, u1);
        assert_eq!(first.presence.len(), 1);
        assert!(first.left.is_none());

        let second = reg.join(s2, room, u2);
        assert_eq!(second.presence.len(), 2);
        assert_eq!(second.entry.session_id, s2);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_register_keeps_display() {
        let mut reg = SessionRegistry::new();
        let (s, u) = ids();
        assert!(reg.register(s, u, DisplayInfo::for_user(u, "Alice")));
        assert!(!reg.register(s, u, DisplayInfo::for_user(u, "Again")));

        let outcome = reg.join(s, Uuid::new_v4(), u);
        assert_eq!(outcome.entry.display.name, "Alice");
    }

    #[test]
    fn test_join_other_room_leaves_previous() {
        let mut reg = SessionRegistry::new();
        let (r1, r2) = (Uuid::new_v4(), Uuid::new_v4());
        let (s, u) = ids();

        reg.join(s, r1, u);
        let outcome = reg.join(s, r2, u);

        let left = outcome.left.expect("previous room should be left");
        assert_eq!(left.room_id, r1);
        assert!(left.room_empty);
        assert_eq!(reg.room_of(&s), Some(r2));
        assert_eq!(reg.member_count(&r1), 0);
        assert_eq!(reg.room_count(), 1);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_rejoin_same_room_is_noop() {
        let mut reg = SessionRegistry::new();
        let room = Uuid::new_v4();
        let (s, u) = ids();
        reg.join(s, room, u);
        let again = reg.join(s, room, u);
        assert!(again.already_member);
        assert!(again.left.is_none());
        assert_eq!(reg.member_count(&room), 1);
    }

    #[test]
    fn test_leave_when_not_subscribed_is_noop() {
        let mut reg = SessionRegistry::new();
        let (s, u) = ids();
        assert!(reg.leave(s).is_none());
        reg.register(s, u, DisplayInfo::for_user(u, "x"));
        assert!(reg.leave(s).is_none());
        assert_eq!(reg.session_count(), 1);
    }

    #[test]
    fn test_leave_reports_remaining_members() {
        let mut reg = SessionRegistry::new();
        let room = Uuid::new_v4();
        let (s1, u1) = ids();
        let (s2, u2) = ids();
        reg.join(s1, room, u1);
        reg.join(s2, room, u2);

        let left = reg.leave(s1).unwrap();
        assert!(!left.room_empty);
        assert_eq!(reg.list_presence(&room).len(), 1);
        assert_eq!(reg.session_count(), 2);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut reg = SessionRegistry::new();
        let room = Uuid::new_v4();
        let (s, u) = ids();
        reg.join(s, room, u);

        assert!(reg.disconnect(s).is_some());
        assert!(reg.disconnect(s).is_none());
        assert_eq!(reg.session_count(), 0);
        assert_eq!(reg.room_count(), 0);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_presence_of_unknown_room_is_empty() {
        let reg = SessionRegistry::new();
        assert!(reg.list_presence(&Uuid::new_v4()).is_empty());
    }
}

//! Client-side presence: who is in the room and what they are doing.
//!
//! Built purely from room events; the server is the source of truth for
//! membership, the view only mirrors it.
//!
//! ```text
//! room:joined ───────► replace member list
//! presence:joined ───► add member
//! presence:left ─────► drop member (unknown session: ignored)
//! presence:typing ───► set / clear activity indicator
//!                            │
//!                            ▼
//!                   cleanup_idle() expires indicators
//!                   whose peer went quiet
//! ```
//!
//! Outgoing hints are throttled so a drag does not flood the room with
//! `presence:typing` frames.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::model::{SessionId, UserId};
use crate::protocol::{Activity, ClientFrame, PresenceEntry, ServerEvent};

// ───────────────────────────────────────────────────────────────────
// Remote peers
// ───────────────────────────────────────────────────────────────────

/// A live activity indicator of one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityIndicator {
    pub activity: Activity,
    pub item_id: Option<Uuid>,
    pub since: Instant,
}

/// Presence state of one remote session.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub entry: PresenceEntry,
    pub activity: Option<ActivityIndicator>,
    last_update: Instant,
}

impl RemotePeer {
    fn new(entry: PresenceEntry) -> Self {
        Self {
            entry,
            activity: None,
            last_update: Instant::now(),
        }
    }

    /// No activity update for `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() >= timeout
    }

    pub fn user_id(&self) -> UserId {
        self.entry.user_id
    }
}

// ───────────────────────────────────────────────────────────────────
// PresenceView
// ───────────────────────────────────────────────────────────────────

pub struct PresenceView {
    local_session: SessionId,
    peers: HashMap<SessionId, RemotePeer>,
    /// Indicators older than this are dropped by `cleanup_idle`.
    idle_timeout: Duration,
    hint_interval: Duration,
    last_hint: Option<(Activity, Option<Uuid>, bool, Instant)>,
}

impl PresenceView {
    pub fn new(local_session: SessionId) -> Self {
        Self {
            local_session,
            peers: HashMap::new(),
            idle_timeout: Duration::from_secs(10),
            hint_interval: Duration::from_millis(250),
            last_hint: None,
        }
    }

    pub fn with_timeouts(local_session: SessionId, idle_timeout: Duration, hint_interval: Duration) -> Self {
        let mut view = Self::new(local_session);
        view.idle_timeout = idle_timeout;
        view.hint_interval = hint_interval;
        view
    }

    /// Apply a room event. Returns `true` if the view changed.
    pub fn handle_event(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::RoomJoined { presence, .. } => {
                self.peers = presence
                    .iter()
                    .filter(|entry| entry.session_id != self.local_session)
                    .map(|entry| (entry.session_id, RemotePeer::new(entry.clone())))
                    .collect();
                true
            }
            ServerEvent::PresenceJoined { entry, .. } => {
                if entry.session_id == self.local_session {
                    return false;
                }
                self.peers
                    .insert(entry.session_id, RemotePeer::new(entry.clone()));
                true
            }
            ServerEvent::PresenceLeft { session_id, .. } => {
                // A leave for a session we never saw is stale; nothing to do.
                self.peers.remove(session_id).is_some()
            }
            ServerEvent::PresenceTyping {
                session_id,
                item_id,
                activity,
                active,
                ..
            } => match self.peers.get_mut(session_id) {
                Some(peer) => {
                    peer.last_update = Instant::now();
                    peer.activity = active.then(|| ActivityIndicator {
                        activity: *activity,
                        item_id: *item_id,
                        since: Instant::now(),
                    });
                    true
                }
                None => {
                    log::trace!("presence:typing from untracked session {session_id}");
                    false
                }
            },
            _ => false,
        }
    }

    /// Outgoing activity hint, or `None` if an identical one went out recently.
    ///
    /// Turning an activity off is never throttled.
    pub fn local_hint(&mut self, item_id: Option<Uuid>, activity: Activity, active: bool) -> Option<ClientFrame> {
        if active {
            if let Some((last_activity, last_item, last_active, at)) = self.last_hint {
                if last_active
                    && last_activity == activity
                    && last_item == item_id
                    && at.elapsed() < self.hint_interval
                {
                    return None;
                }
            }
        }
        self.last_hint = Some((activity, item_id, active, Instant::now()));
        Some(ClientFrame::Typing {
            item_id,
            activity,
            active,
        })
    }

    /// Expire indicators of peers that stopped sending updates.
    pub fn cleanup_idle(&mut self) -> Vec<SessionId> {
        let timeout = self.idle_timeout;
        let mut expired = Vec::new();
        for (session_id, peer) in self.peers.iter_mut() {
            if peer.activity.is_some() && peer.is_idle(timeout) {
                peer.activity = None;
                expired.push(*session_id);
            }
        }
        expired
    }

    /// Peers currently doing something with `item_id`.
    pub fn activity_on(&self, item_id: Uuid) -> Vec<(&PresenceEntry, Activity)> {
        self.peers
            .values()
            .filter_map(|peer| {
                let indicator = peer.activity.as_ref()?;
                (indicator.item_id == Some(item_id)).then_some((&peer.entry, indicator.activity))
            })
            .collect()
    }

    /// Remote members, oldest join first.
    pub fn members(&self) -> Vec<&PresenceEntry> {
        let mut members: Vec<&PresenceEntry> = self.peers.values().map(|p| &p.entry).collect();
        members.sort_by(|a, b| {
            a.joined_at_ms
                .cmp(&b.joined_at_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        members
    }

    pub fn peer(&self, session_id: &SessionId) -> Option<&RemotePeer> {
        self.peers.get(session_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_session(&self) -> SessionId {
        self.local_session
    }

    /// Forget everything (on leave or reconnect).
    pub fn clear(&mut self) {
        self.peers.clear();
        self.last_hint = None;
    }

    /// Take over a new session id after reconnecting.
    pub fn reset(&mut self, local_session: SessionId) {
        self.local_session = local_session;
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DisplayInfo;
    use std::thread;

    fn entry(joined_at_ms: u64) -> PresenceEntry {
        let user_id = Uuid::new_v4();
        PresenceEntry {
            session_id: Uuid::new_v4(),
            user_id,
            display: DisplayInfo::for_user(user_id, "Peer"),
            joined_at_ms,
        }
    }

    fn typing(entry: &PresenceEntry, item_id: Option<Uuid>, active: bool) -> ServerEvent {
        ServerEvent::PresenceTyping {
            session_id: entry.session_id,
            user_id: entry.user_id,
            item_id,
            activity: Activity::Moving,
            active,
        }
    }

    #[test]
    fn test_room_joined_excludes_self() {
        let me = entry(1);
        let other = entry(2);
        let mut view = PresenceView::new(me.session_id);
        view.handle_event(&ServerEvent::RoomJoined {
            room_id: Uuid::new_v4(),
            presence: vec![me.clone(), other.clone()],
        });
        assert_eq!(view.peer_count(), 1);
        assert!(view.peer(&other.session_id).is_some());
    }

    #[test]
    fn test_join_and_leave() {
        let mut view = PresenceView::new(Uuid::new_v4());
        let peer = entry(5);
        let room_id = Uuid::new_v4();
        assert!(view.handle_event(&ServerEvent::PresenceJoined {
            room_id,
            entry: peer.clone(),
        }));
        assert!(view.handle_event(&ServerEvent::PresenceLeft {
            room_id,
            session_id: peer.session_id,
            user_id: peer.user_id,
        }));
        assert_eq!(view.peer_count(), 0);
    }

    #[test]
    fn test_stale_leave_is_ignored() {
        let mut view = PresenceView::new(Uuid::new_v4());
        let changed = view.handle_event(&ServerEvent::PresenceLeft {
            room_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        });
        assert!(!changed);
    }

    #[test]
    fn test_activity_indicator_set_and_cleared() {
        let mut view = PresenceView::new(Uuid::new_v4());
        let peer = entry(1);
        view.handle_event(&ServerEvent::PresenceJoined {
            room_id: Uuid::new_v4(),
            entry: peer.clone(),
        });

        let item = Uuid::new_v4();
        view.handle_event(&typing(&peer, Some(item), true));
        let active = view.activity_on(item);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1, Activity::Moving);

        view.handle_event(&typing(&peer, Some(item), false));
        assert!(view.activity_on(item).is_empty());
    }

    #[test]
    fn test_idle_indicators_expire() {
        let mut view = PresenceView::with_timeouts(
            Uuid::new_v4(),
            Duration::from_millis(5),
            Duration::from_millis(0),
        );
        let peer = entry(1);
        view.handle_event(&ServerEvent::PresenceJoined {
            room_id: Uuid::new_v4(),
            entry: peer.clone(),
        });
        view.handle_event(&typing(&peer, None, true));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(view.cleanup_idle(), vec![peer.session_id]);
        assert!(view.peer(&peer.session_id).unwrap().activity.is_none());
        // Membership survives, only the indicator expires.
        assert_eq!(view.peer_count(), 1);
    }

    #[test]
    fn test_local_hints_are_throttled() {
        let mut view = PresenceView::new(Uuid::new_v4());
        let item = Some(Uuid::new_v4());
        assert!(view.local_hint(item, Activity::Moving, true).is_some());
        assert!(view.local_hint(item, Activity::Moving, true).is_none());
        assert!(view.local_hint(item, Activity::Moving, false).is_some());
    }

    #[test]
    fn test_members_sorted_by_join_time() {
        let mut view = PresenceView::new(Uuid::new_v4());
        let late = entry(20);
        let early = entry(10);
        view.handle_event(&ServerEvent::RoomJoined {
            room_id: Uuid::new_v4(),
            presence: vec![late.clone(), early.clone()],
        });
        let members = view.members();
        assert_eq!(members[0].session_id, early.session_id);
        assert_eq!(members[1].session_id, late.session_id);
    }
}

//! Room broadcaster: ordered fan-out of room events.
//!
//! Each room owns one tokio broadcast channel, so every subscriber observes
//! the room's events in the same order. Events are encoded once and shared
//! as `Arc` between receivers; audience filtering (`others` / `all` /
//! `origin`) happens on the receiving side via [`Envelope::is_for`].
//!
//! ```text
//! publish(room, event, origin, audience)
//!       │  seq += 1 (under the room's publish lock)
//!       ▼
//! broadcast::Sender<Arc<Envelope>> ──► rx(session A)  is_for(A)?
//!                                  ──► rx(session B)  is_for(B)?
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};

use crate::model::{RoomId, SessionId};
use crate::protocol::{Audience, ProtocolError, ServerEvent, ServerFrame};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// One published room event.
#[derive(Debug)]
pub struct Envelope {
    pub room_id: RoomId,
    pub seq: u64,
    pub origin: Option<SessionId>,
    pub audience: Audience,
    pub event: ServerEvent,
    /// Pre-encoded `ServerFrame::Event`, shared by all receivers
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether `session` should receive this envelope.
    pub fn is_for(&self, session: SessionId) -> bool {
        match self.audience {
            Audience::All => true,
            Audience::Others => self.origin != Some(session),
            Audience::Origin => self.origin == Some(session),
        }
    }
}

/// Broadcast channel of a single room.
pub struct RoomChannel {
    room_id: RoomId,
    sender: broadcast::Sender<Arc<Envelope>>,
    /// Last sequence number; held while sending so seq matches channel order
    seq: Mutex<u64>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl RoomChannel {
    pub fn new(room_id: RoomId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            room_id,
            sender,
            seq: Mutex::new(0),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Publish `event` to the room. Returns the envelope that was sent.
    pub fn publish(
        &self,
        event: ServerEvent,
        origin: Option<SessionId>,
        audience: Audience,
    ) -> Result<Arc<Envelope>, ProtocolError> {
        let mut seq = self.seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = *seq + 1;

        let frame = ServerFrame::Event {
            room_id: self.room_id,
            seq: next,
            origin,
            event: event.clone(),
        }
        .encode()?;

        let envelope = Arc::new(Envelope {
            room_id: self.room_id,
            seq: next,
            origin,
            audience,
            event,
            frame: Arc::new(frame),
        });

        *seq = next;
        if self.sender.send(envelope.clone()).is_err() {
            // Nobody subscribed: the event is simply not delivered.
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(envelope)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Sequence number of the last published event.
    pub fn last_seq(&self) -> u64 {
        *self.seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Room id → channel. Rooms are created on first subscription.
pub struct EventBus {
    rooms: RwLock<HashMap<RoomId, Arc<RoomChannel>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Get or create the channel for `room_id`.
    pub async fn channel(&self, room_id: RoomId) -> Arc<RoomChannel> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(RoomChannel::new(room_id, self.capacity)))
            .clone()
    }

    pub async fn subscribe(&self, room_id: RoomId) -> broadcast::Receiver<Arc<Envelope>> {
        self.channel(room_id).await.subscribe()
    }

    /// Deliver `event` to the room's subscribers selected by `audience`.
    ///
    /// Publishing to a room nobody subscribed to is a no-op.
    pub async fn broadcast(
        &self,
        room_id: RoomId,
        event: ServerEvent,
        origin: Option<SessionId>,
        audience: Audience,
    ) -> Result<Option<Arc<Envelope>>, ProtocolError> {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(&room_id).cloned()
        };
        match room {
            Some(room) => {
                log::trace!("room {room_id}: publishing {}", event.name());
                room.publish(event, origin, audience).map(Some)
            }
            None => {
                log::debug!("room {room_id}: dropping {} (no channel)", event.name());
                Ok(None)
            }
        }
    }

    /// Drop the room's channel.
    pub async fn remove(&self, room_id: &RoomId) -> bool {
        self.rooms.write().await.remove(room_id).is_some()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self, room_id: &RoomId) -> Option<BroadcastStats> {
        self.rooms.read().await.get(room_id).map(|r| r.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContainerRef;
    use uuid::Uuid;

    fn moved() -> ServerEvent {
        let list = ContainerRef::List(Uuid::new_v4());
        ServerEvent::ItemMoved {
            item_id: Uuid::new_v4(),
            from: list,
            to: list,
            new_position: 1536.0,
        }
    }

    #[test]
    fn test_envelope_audience_filter() {
        let origin = Uuid::new_v4();
        let other = Uuid::new_v4();
        let channel = RoomChannel::new(Uuid::new_v4(), 8);
        let _rx = channel.subscribe();

        let others = channel.publish(moved(), Some(origin), Audience::Others).unwrap();
        assert!(!others.is_for(origin));
        assert!(others.is_for(other));

        let all = channel.publish(moved(), Some(origin), Audience::All).unwrap();
        assert!(all.is_for(origin) && all.is_for(other));

        let only = channel.publish(moved(), Some(origin), Audience::Origin).unwrap();
        assert!(only.is_for(origin));
        assert!(!only.is_for(other));
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let channel = RoomChannel::new(Uuid::new_v4(), 64);
        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();

        for _ in 0..10 {
            channel.publish(moved(), None, Audience::All).unwrap();
        }

        for rx in [&mut rx1, &mut rx2] {
            let mut last = 0;
            for _ in 0..10 {
                let env = rx.recv().await.unwrap();
                assert_eq!(env.seq, last + 1);
                last = env.seq;
            }
        }
        assert_eq!(channel.last_seq(), 10);
    }

    #[tokio::test]
    async fn test_frame_decodes_to_same_event() {
        let channel = RoomChannel::new(Uuid::new_v4(), 8);
        let mut rx = channel.subscribe();
        let event = moved();
        channel.publish(event.clone(), None, Audience::Others).unwrap();

        let env = rx.recv().await.unwrap();
        assert_eq!(env.event, event);
        match ServerFrame::decode(&env.frame).unwrap() {
            ServerFrame::Event { seq, event: decoded, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(decoded, event);
            }
            other => panic!("Expected Event frame, got {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_counts_drop() {
        let channel = RoomChannel::new(Uuid::new_v4(), 8);
        channel.publish(moved(), None, Audience::All).unwrap();
        let stats = channel.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.subscribers, 0);
    }

    #[tokio::test]
    async fn test_bus_creates_room_once() {
        let bus = EventBus::new(16);
        let room = Uuid::new_v4();
        let a = bus.channel(room).await;
        let b = bus.channel(room).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(bus.room_count().await, 1);
        assert_eq!(a.capacity(), 16);
    }

    #[tokio::test]
    async fn test_bus_broadcast_to_unknown_room_is_noop() {
        let bus = EventBus::new(16);
        let sent = bus
            .broadcast(Uuid::new_v4(), moved(), None, Audience::All)
            .await
            .unwrap();
        assert!(sent.is_none());
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let bus = EventBus::new(16);
        let (r1, r2) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx1 = bus.subscribe(r1).await;
        let mut rx2 = bus.subscribe(r2).await;

        bus.broadcast(r1, moved(), None, Audience::All).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().room_id, r1);
        assert!(rx2.try_recv().is_err());

        assert!(bus.remove(&r1).await);
        assert_eq!(bus.active_rooms().await, vec![r2]);
    }
}

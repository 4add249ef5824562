//! Reconciliation controller: one optimistic gesture end to end.
//!
//! ```text
//! Idle ─► GestureStarted ─► PositionComputed ─► OptimisticallyApplied ─┬─► Confirmed ─► Idle
//!          (presence hint)   (allocate, maybe       (cache + item:moved  │
//!                             rebalance first)        to the room)       └─► RolledBack ─► Idle
//!                                                                            (restore + revert
//!                                                                             broadcast)
//! ```
//!
//! The controller is the only place where persistence and transport errors
//! turn into rollbacks and user-facing [`Notification`]s. The cache lock is
//! never held across an await; the only suspension point of a gesture is the
//! persistence call (plus best-effort sends on the room link).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::{
    CacheError, ClientOperation, ConfirmOutcome, OpKind, OptimisticCache, RejectOutcome,
    RemoteEffect, Snapshot,
};
use crate::client::{ClientError, ClientEvent, SyncClient};
use crate::model::{ContainerId, ContainerRef, Item, ItemId, ItemKind, ItemPatch, NewItem, Placement, SessionId};
use crate::persistence::{CanonicalState, PersistError, PersistRequest, PersistResponse, Persistence};
use crate::position::{neighbors, AllocationExhausted, AllocatorConfig};
use crate::presence::PresenceView;
use crate::protocol::{Activity, ClientFrame, ServerEvent};

/// Outbound side of a room: where the controller sends its intents.
#[async_trait]
pub trait RoomLink: Send + Sync {
    async fn publish(&self, frame: ClientFrame) -> Result<(), ClientError>;

    /// Bring a dropped link back and rejoin its room.
    ///
    /// Links that cannot reconnect report the loss.
    async fn recover(&self) -> Result<(), ClientError> {
        Err(ClientError::TransportLost)
    }
}

#[async_trait]
impl RoomLink for SyncClient {
    async fn publish(&self, frame: ClientFrame) -> Result<(), ClientError> {
        self.send(frame).await
    }

    async fn recover(&self) -> Result<(), ClientError> {
        self.reconnect().await.map(|_| ())
    }
}

#[async_trait]
impl<T: RoomLink + ?Sized> RoomLink for Arc<T> {
    async fn publish(&self, frame: ClientFrame) -> Result<(), ClientError> {
        (**self).publish(frame).await
    }

    async fn recover(&self) -> Result<(), ClientError> {
        (**self).recover().await
    }
}

/// Where a gesture currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GesturePhase {
    Idle,
    GestureStarted,
    PositionComputed,
    OptimisticallyApplied,
    Confirmed,
    RolledBack,
}

/// User-facing report of a write that did not stick.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: OpKind,
    pub item: Option<ItemId>,
    pub reason: PersistError,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            OpKind::Move => "move",
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Rebalance => "reorder",
        };
        match self.item {
            Some(item) => write!(f, "Could not {what} item {item}: {}", self.reason),
            None => write!(f, "Could not {what}: {}", self.reason),
        }
    }
}

/// How an optimistic operation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Persisted. `corrected` is set when the stored state differed from
    /// the optimistic one and a correction went out to the room.
    Confirmed { item: Option<ItemId>, corrected: bool },
    /// Refused or timed out; local state restored and peers told.
    RolledBack { notification: Notification },
    /// A newer gesture on the same target replaced this one.
    Superseded { by: Uuid },
    /// The cache was reset (reconnect or resync) while the write was in flight.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("unknown item {0}")]
    UnknownItem(ItemId),
    #[error("item {0} has no server id yet")]
    UnconfirmedItem(ItemId),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Exhausted(#[from] AllocationExhausted),
    #[error("resync failed: {0}")]
    Resync(PersistError),
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Indices past the wire range clamp to the tail.
fn wire_index(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

/// Placements with server ids, for the wire.
fn wire_placements(placements: &[(ItemId, f64)]) -> Vec<Placement> {
    placements
        .iter()
        .filter_map(|(id, position)| {
            id.server().map(|id| Placement {
                id,
                position: *position,
            })
        })
        .collect()
}

pub struct Reconciler {
    board_id: Uuid,
    cache: Mutex<OptimisticCache>,
    presence: Mutex<PresenceView>,
    gestures: Mutex<HashMap<ItemId, (u64, GesturePhase)>>,
    next_gesture: AtomicU64,
    allocator: AllocatorConfig,
    persistence: Arc<dyn Persistence>,
    link: Arc<dyn RoomLink>,
    persist_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        board_id: Uuid,
        session_id: SessionId,
        persistence: Arc<dyn Persistence>,
        link: Arc<dyn RoomLink>,
        persist_timeout: Duration,
    ) -> Self {
        Self {
            board_id,
            cache: Mutex::new(OptimisticCache::new()),
            presence: Mutex::new(PresenceView::new(session_id)),
            gestures: Mutex::new(HashMap::new()),
            next_gesture: AtomicU64::new(0),
            allocator: AllocatorConfig::default(),
            persistence,
            link,
            persist_timeout,
        }
    }

    pub fn with_allocator(mut self, allocator: AllocatorConfig) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    // ── State ─────────────────────────────────────────────────────

    /// Discard everything local and load the board from persistence.
    pub async fn resync(&self) -> Result<usize, ReconcileError> {
        // Clear first so writes still in flight come back as stale.
        guard(&self.cache).clear();
        let records = self
            .persistence
            .fetch_board(self.board_id)
            .await
            .map_err(ReconcileError::Resync)?;
        let count = records.len();
        guard(&self.cache).load(self.board_id, records);
        log::info!("Board {} loaded with {count} items", self.board_id);
        Ok(count)
    }

    /// Merge one room event into the cache and presence view.
    pub fn apply_remote(&self, event: &ServerEvent) -> RemoteEffect {
        if event.is_presence() {
            let changed = guard(&self.presence).handle_event(event);
            return if changed {
                RemoteEffect::Applied
            } else {
                RemoteEffect::Ignored
            };
        }
        let effect = guard(&self.cache).apply_remote(event);
        log::trace!("{} -> {effect:?}", event.name());
        effect
    }

    /// Merge a room event published by `origin`.
    ///
    /// Rebalances are sent to the whole room, the sender included. The sender
    /// already holds the canonical positions, so its own copy is dropped
    /// before it can overwrite moves confirmed since.
    pub fn apply_room_event(&self, origin: Option<SessionId>, event: &ServerEvent) -> RemoteEffect {
        if matches!(event, ServerEvent::CollectionRebalanced { .. })
            && origin.is_some_and(|origin| origin == guard(&self.presence).local_session())
        {
            log::trace!("{} from own session, skipped", event.name());
            return RemoteEffect::Ignored;
        }
        self.apply_remote(event)
    }

    /// React to one client event.
    pub async fn handle(&self, event: ClientEvent) -> Result<(), ReconcileError> {
        match event {
            ClientEvent::Remote {
                room_id, origin, event, ..
            } => {
                if room_id == self.board_id {
                    self.apply_room_event(origin, &event);
                }
            }
            ClientEvent::Connected { session_id, .. } => {
                let mut presence = guard(&self.presence);
                if presence.local_session() != session_id {
                    presence.reset(session_id);
                }
            }
            ClientEvent::Reconnected { .. } => {
                self.resync().await?;
            }
            ClientEvent::ResyncRequired { room_id } => {
                if room_id == self.board_id {
                    log::warn!("Missed events in {room_id}, refetching");
                    self.resync().await?;
                }
            }
            ClientEvent::Disconnected => {
                guard(&self.presence).clear();
                // Success shows up as `Reconnected`, which reloads the board.
                if let Err(e) = self.link.recover().await {
                    log::warn!("Could not reconnect: {e}");
                }
            }
            ClientEvent::ServerError { message } => log::warn!("Server error: {message}"),
            ClientEvent::Pong => {}
        }
        Ok(())
    }

    /// Feed client events into the controller until the channel closes.
    pub async fn pump(&self, mut events: mpsc::Receiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                log::error!("Failed to handle client event: {e}");
            }
        }
    }

    pub fn get(&self, id: ItemId) -> Option<Item> {
        guard(&self.cache).get(id).cloned()
    }

    /// One collection in display order.
    pub fn collection(&self, container: ContainerId) -> Vec<Item> {
        guard(&self.cache).collection(container).into_iter().cloned().collect()
    }

    pub fn state(&self) -> Vec<Item> {
        guard(&self.cache).state()
    }

    pub fn with_cache<R>(&self, f: impl FnOnce(&OptimisticCache) -> R) -> R {
        f(&guard(&self.cache))
    }

    pub fn with_presence<R>(&self, f: impl FnOnce(&PresenceView) -> R) -> R {
        f(&guard(&self.presence))
    }

    pub fn gesture_phase(&self, item: ItemId) -> GesturePhase {
        guard(&self.gestures)
            .get(&item)
            .map_or(GesturePhase::Idle, |(_, phase)| *phase)
    }

    // ── Gestures ──────────────────────────────────────────────────

    /// Move `item` to slot `target_index` of `to`.
    pub async fn move_item(
        &self,
        item: ItemId,
        to: ContainerId,
        target_index: usize,
    ) -> Result<Outcome, ReconcileError> {
        let item = guard(&self.cache).resolve(item);
        let item_id = item.server().ok_or(ReconcileError::UnconfirmedItem(item))?;
        let wire_to = self.wire(to)?;
        let gesture = self.begin(item);

        let result = self.run_move(gesture, item, item_id, to, wire_to, target_index).await;
        self.hint(Some(item_id), Activity::Moving, false).await;
        let phase = match &result {
            Ok(Outcome::RolledBack { .. }) => GesturePhase::RolledBack,
            Ok(_) => GesturePhase::Confirmed,
            Err(_) => GesturePhase::Idle,
        };
        self.finish(gesture, item, phase);
        result
    }

    async fn run_move(
        &self,
        gesture: u64,
        item: ItemId,
        item_id: Uuid,
        to: ContainerId,
        wire_to: ContainerRef,
        target_index: usize,
    ) -> Result<Outcome, ReconcileError> {
        self.hint(Some(item_id), Activity::Moving, true).await;

        let (from, computed) = {
            let cache = guard(&self.cache);
            let current = cache.get(item).ok_or(ReconcileError::UnknownItem(item))?;
            let from = current.container;
            let (prev, next) = neighbors(&cache.collection(to), target_index, Some(item));
            (from, self.allocator.allocate(prev, next))
        };
        let wire_from = self.wire(from)?;

        let position = match computed {
            Ok(position) => position,
            Err(exhausted) => {
                log::debug!("No key left in {to} ({exhausted}), rebalancing");
                if let Some(outcome) = self.rebalance(to).await? {
                    return Ok(outcome);
                }
                let cache = guard(&self.cache);
                let (prev, next) = neighbors(&cache.collection(to), target_index, Some(item));
                self.allocator.allocate(prev, next)?
            }
        };
        self.advance(gesture, item, GesturePhase::PositionComputed);

        let (op_id, generation) = {
            let mut cache = guard(&self.cache);
            let applied = cache.apply_local(ClientOperation::move_item(item, from, to, position))?;
            (applied.op_id, cache.generation())
        };
        self.advance(gesture, item, GesturePhase::OptimisticallyApplied);
        log::debug!("Move {item} to {to}[{target_index}] at {position}");

        let index = wire_index(target_index);
        self.send(ClientFrame::MoveItem {
            client_op_id: op_id,
            item_id,
            from: wire_from,
            to: wire_to,
            target_index: index,
            position,
        })
        .await;

        let result = self
            .persist(PersistRequest::Move {
                board_id: self.board_id,
                item_id,
                to: wire_to,
                target_index: index,
                position,
            })
            .await;

        let (outcome, corrections) = {
            let mut cache = guard(&self.cache);
            if cache.generation() != generation {
                log::info!("Move of {item} discarded, board was reloaded");
                return Ok(Outcome::Discarded);
            }
            match result {
                Ok(response) => {
                    let canonical = response.canonical.clone();
                    match cache.confirm(op_id, response.canonical)? {
                        ConfirmOutcome::Confirmed { .. } => {
                            let corrections = match canonical {
                                Some(CanonicalState::Item(record))
                                    if record.position != position || record.container != wire_to =>
                                {
                                    vec![ClientFrame::MoveItem {
                                        client_op_id: Uuid::new_v4(),
                                        item_id,
                                        from: wire_to,
                                        to: record.container,
                                        target_index: index,
                                        position: record.position,
                                    }]
                                }
                                Some(CanonicalState::Collection { container, items }) => {
                                    vec![ClientFrame::RebalanceCollection {
                                        client_op_id: Uuid::new_v4(),
                                        container,
                                        items,
                                    }]
                                }
                                _ => Vec::new(),
                            };
                            let corrected = !corrections.is_empty();
                            (
                                Outcome::Confirmed {
                                    item: Some(item),
                                    corrected,
                                },
                                corrections,
                            )
                        }
                        ConfirmOutcome::Superseded { by } => (Outcome::Superseded { by }, Vec::new()),
                        ConfirmOutcome::Stale => (Outcome::Discarded, Vec::new()),
                    }
                }
                Err(reason) => match cache.reject(op_id)? {
                    RejectOutcome::RolledBack { restored, .. } => {
                        log::warn!("Move of {item} rolled back: {reason}");
                        let revert = restored_placement(&restored, item).map(|(container, position)| {
                            ClientFrame::MoveItem {
                                client_op_id: Uuid::new_v4(),
                                item_id,
                                from: wire_to,
                                to: container,
                                target_index: index,
                                position,
                            }
                        });
                        (
                            Outcome::RolledBack {
                                notification: Notification {
                                    kind: OpKind::Move,
                                    item: Some(item),
                                    reason,
                                },
                            },
                            revert.into_iter().collect(),
                        )
                    }
                    RejectOutcome::Superseded { by } => (Outcome::Superseded { by }, Vec::new()),
                    RejectOutcome::Stale => (Outcome::Discarded, Vec::new()),
                },
            }
        };

        for frame in corrections {
            self.send(frame).await;
        }
        Ok(outcome)
    }

    /// Respace `container` evenly, locally and in the store.
    ///
    /// Returns an outcome only when the rebalance did not stick.
    async fn rebalance(&self, container: ContainerId) -> Result<Option<Outcome>, ReconcileError> {
        let wire_container = self.wire(container)?;
        let (op_id, placements, generation) = {
            let mut cache = guard(&self.cache);
            let items: Vec<Item> = cache.collection(container).into_iter().cloned().collect();
            let placements = self.allocator.rebalance(&items);
            let applied = cache.apply_local(ClientOperation::rebalance(container, placements.clone()))?;
            (applied.op_id, placements, cache.generation())
        };
        let items = wire_placements(&placements);

        self.send(ClientFrame::RebalanceCollection {
            client_op_id: op_id,
            container: wire_container,
            items: items.clone(),
        })
        .await;

        let result = self
            .persist(PersistRequest::Rebalance {
                board_id: self.board_id,
                container: wire_container,
                items: items.clone(),
            })
            .await;

        let (outcome, correction) = {
            let mut cache = guard(&self.cache);
            if cache.generation() != generation {
                return Ok(Some(Outcome::Discarded));
            }
            match result {
                Ok(response) => {
                    let correction = match &response.canonical {
                        Some(CanonicalState::Collection { container, items: stored }) if *stored != items => {
                            Some(ClientFrame::RebalanceCollection {
                                client_op_id: Uuid::new_v4(),
                                container: *container,
                                items: stored.clone(),
                            })
                        }
                        _ => None,
                    };
                    match cache.confirm(op_id, response.canonical)? {
                        ConfirmOutcome::Confirmed { .. } => (None, correction),
                        ConfirmOutcome::Superseded { by } => (Some(Outcome::Superseded { by }), None),
                        ConfirmOutcome::Stale => (Some(Outcome::Discarded), None),
                    }
                }
                Err(reason) => {
                    log::warn!("Rebalance of {container} rolled back: {reason}");
                    let revert = match cache.reject(op_id)? {
                        RejectOutcome::RolledBack { restored, .. } => {
                            let placements: Vec<(ItemId, f64)> = restored
                                .iter()
                                .filter_map(|(id, item)| item.as_ref().map(|item| (*id, item.position)))
                                .collect();
                            Some(ClientFrame::RebalanceCollection {
                                client_op_id: Uuid::new_v4(),
                                container: wire_container,
                                items: wire_placements(&placements),
                            })
                        }
                        _ => None,
                    };
                    let notification = Notification {
                        kind: OpKind::Rebalance,
                        item: None,
                        reason,
                    };
                    (Some(Outcome::RolledBack { notification }), revert)
                }
            }
        };

        if let Some(frame) = correction {
            self.send(frame).await;
        }
        Ok(outcome)
    }

    /// Create an item at slot `target_index` of `container`.
    ///
    /// The room hears about it only after the store assigned its id.
    pub async fn create_item(
        &self,
        kind: ItemKind,
        container: ContainerId,
        target_index: usize,
        title: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Outcome, ReconcileError> {
        let wire_container = self.wire(container)?;
        let title = title.into();

        let (op_id, temp, position, generation) = {
            let mut cache = guard(&self.cache);
            let (prev, next) = neighbors(&cache.collection(container), target_index, None);
            let position = match self.allocator.allocate(prev, next) {
                Ok(position) => position,
                // Store resolves it, create never respaces others.
                Err(_) => {
                    let last = cache.collection(container).last().map(|item| item.position);
                    self.allocator.allocate(last, None)?
                }
            };
            let temp = cache.temp_id();
            let applied = cache.apply_local(ClientOperation::create(Item {
                id: temp,
                kind,
                container,
                position,
                title: title.clone(),
                metadata: metadata.clone(),
            }))?;
            (applied.op_id, temp, position, cache.generation())
        };

        let result = self
            .persist(PersistRequest::Create {
                board_id: self.board_id,
                item: NewItem {
                    kind,
                    container: wire_container,
                    position,
                    title,
                    metadata,
                },
            })
            .await;

        let (outcome, announce) = {
            let mut cache = guard(&self.cache);
            if cache.generation() != generation {
                return Ok(Outcome::Discarded);
            }
            match result {
                Ok(response) => {
                    let record = match &response.canonical {
                        Some(CanonicalState::Item(record)) => Some(record.clone()),
                        _ => None,
                    };
                    match cache.confirm(op_id, response.canonical)? {
                        ConfirmOutcome::Confirmed { item, .. } => {
                            let corrected = record.as_ref().is_some_and(|r| r.position != position);
                            let announce = record.map(|item| ClientFrame::CreateItem {
                                client_op_id: op_id,
                                item,
                            });
                            (Outcome::Confirmed { item, corrected }, announce)
                        }
                        ConfirmOutcome::Superseded { by } => (Outcome::Superseded { by }, None),
                        ConfirmOutcome::Stale => (Outcome::Discarded, None),
                    }
                }
                Err(reason) => {
                    log::warn!("Create of {temp} rolled back: {reason}");
                    cache.reject(op_id)?;
                    let notification = Notification {
                        kind: OpKind::Create,
                        item: None,
                        reason,
                    };
                    (Outcome::RolledBack { notification }, None)
                }
            }
        };

        if let Some(frame) = announce {
            self.send(frame).await;
        }
        Ok(outcome)
    }

    /// Change title and/or metadata of an item.
    pub async fn update_item(&self, item: ItemId, patch: ItemPatch) -> Result<Outcome, ReconcileError> {
        let item = guard(&self.cache).resolve(item);
        let (op_id, record, generation) = {
            let mut cache = guard(&self.cache);
            if cache.get(item).is_none() {
                return Err(ReconcileError::UnknownItem(item));
            }
            let applied = cache.apply_local(ClientOperation::update(item, patch))?;
            let record = cache
                .get(item)
                .and_then(Item::to_record)
                .ok_or(ReconcileError::UnconfirmedItem(item));
            match record {
                Ok(record) => (applied.op_id, record, cache.generation()),
                Err(e) => {
                    cache.reject(applied.op_id)?;
                    return Err(e);
                }
            }
        };

        self.send(ClientFrame::UpdateItem {
            client_op_id: op_id,
            item: record.clone(),
        })
        .await;

        let result = self
            .persist(PersistRequest::Update {
                board_id: self.board_id,
                item: record.clone(),
            })
            .await;

        let (outcome, correction) = {
            let mut cache = guard(&self.cache);
            if cache.generation() != generation {
                return Ok(Outcome::Discarded);
            }
            match result {
                Ok(response) => {
                    let stored = match &response.canonical {
                        Some(CanonicalState::Item(stored)) => Some(stored.clone()),
                        _ => None,
                    };
                    match cache.confirm(op_id, response.canonical)? {
                        ConfirmOutcome::Confirmed { .. } => {
                            let correction = stored
                                .filter(|s| s.title != record.title || s.metadata != record.metadata)
                                .map(|item| ClientFrame::UpdateItem {
                                    client_op_id: Uuid::new_v4(),
                                    item,
                                });
                            let corrected = correction.is_some();
                            (
                                Outcome::Confirmed {
                                    item: Some(item),
                                    corrected,
                                },
                                correction,
                            )
                        }
                        ConfirmOutcome::Superseded { by } => (Outcome::Superseded { by }, None),
                        ConfirmOutcome::Stale => (Outcome::Discarded, None),
                    }
                }
                Err(reason) => match cache.reject(op_id)? {
                    RejectOutcome::RolledBack { restored, .. } => {
                        log::warn!("Update of {item} rolled back: {reason}");
                        let revert = restored
                            .iter()
                            .find(|(id, _)| *id == item)
                            .and_then(|(_, before)| before.as_ref())
                            .and_then(Item::to_record)
                            .map(|item| ClientFrame::UpdateItem {
                                client_op_id: Uuid::new_v4(),
                                item,
                            });
                        let notification = Notification {
                            kind: OpKind::Update,
                            item: Some(item),
                            reason,
                        };
                        (Outcome::RolledBack { notification }, revert)
                    }
                    RejectOutcome::Superseded { by } => (Outcome::Superseded { by }, None),
                    RejectOutcome::Stale => (Outcome::Discarded, None),
                },
            }
        };

        if let Some(frame) = correction {
            self.send(frame).await;
        }
        Ok(outcome)
    }

    /// Delete an item; a list takes its cards with it.
    pub async fn delete_item(&self, item: ItemId) -> Result<Outcome, ReconcileError> {
        let item = guard(&self.cache).resolve(item);
        let item_id = item.server().ok_or(ReconcileError::UnconfirmedItem(item))?;
        let (op_id, container, generation) = {
            let mut cache = guard(&self.cache);
            let current = cache.get(item).ok_or(ReconcileError::UnknownItem(item))?;
            let container = current
                .container
                .to_wire()
                .ok_or(ReconcileError::UnconfirmedItem(item))?;
            let applied = cache.apply_local(ClientOperation::delete(item))?;
            (applied.op_id, container, cache.generation())
        };

        self.send(ClientFrame::DeleteItem {
            client_op_id: op_id,
            item_id,
            container,
        })
        .await;

        let result = self
            .persist(PersistRequest::Delete {
                board_id: self.board_id,
                item_id,
            })
            .await;

        let (outcome, reverts) = {
            let mut cache = guard(&self.cache);
            if cache.generation() != generation {
                return Ok(Outcome::Discarded);
            }
            match result {
                Ok(response) => match cache.confirm(op_id, response.canonical)? {
                    ConfirmOutcome::Confirmed { .. } => (
                        Outcome::Confirmed {
                            item: Some(item),
                            corrected: false,
                        },
                        Vec::new(),
                    ),
                    ConfirmOutcome::Superseded { by } => (Outcome::Superseded { by }, Vec::new()),
                    ConfirmOutcome::Stale => (Outcome::Discarded, Vec::new()),
                },
                Err(reason) => match cache.reject(op_id)? {
                    RejectOutcome::RolledBack { restored, .. } => {
                        log::warn!("Delete of {item} rolled back: {reason}");
                        // Parent first so peers can place the children again.
                        let reverts = restored
                            .iter()
                            .filter_map(|(_, before)| before.as_ref().and_then(Item::to_record))
                            .map(|item| ClientFrame::CreateItem {
                                client_op_id: Uuid::new_v4(),
                                item,
                            })
                            .collect();
                        let notification = Notification {
                            kind: OpKind::Delete,
                            item: Some(item),
                            reason,
                        };
                        (Outcome::RolledBack { notification }, reverts)
                    }
                    RejectOutcome::Superseded { by } => (Outcome::Superseded { by }, Vec::new()),
                    RejectOutcome::Stale => (Outcome::Discarded, Vec::new()),
                },
            }
        };

        for frame in reverts {
            self.send(frame).await;
        }
        Ok(outcome)
    }

    /// Announce that the local user started or stopped editing `item`.
    pub async fn typing(&self, item: Option<Uuid>, active: bool) {
        self.hint(item, Activity::Typing, active).await;
    }

    // ── Internals ─────────────────────────────────────────────────

    fn wire(&self, container: ContainerId) -> Result<ContainerRef, ReconcileError> {
        match container {
            ContainerId::List(list) => container.to_wire().ok_or(ReconcileError::UnconfirmedItem(list)),
            ContainerId::Board(_) => container
                .to_wire()
                .ok_or(ReconcileError::UnknownItem(ItemId::Server(self.board_id))),
        }
    }

    async fn persist(&self, request: PersistRequest) -> Result<PersistResponse, PersistError> {
        let kind = request.kind();
        match tokio::time::timeout(self.persist_timeout, self.persistence.persist(request)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("Persisting {kind} timed out after {:?}", self.persist_timeout);
                Err(PersistError::Timeout)
            }
        }
    }

    /// Best-effort send; a lost transport is repaired by the resync after reconnect.
    async fn send(&self, frame: ClientFrame) {
        if let Err(e) = self.link.publish(frame).await {
            log::debug!("Room send failed: {e}");
        }
    }

    async fn hint(&self, item: Option<Uuid>, activity: Activity, active: bool) {
        let frame = guard(&self.presence).local_hint(item, activity, active);
        if let Some(frame) = frame {
            self.send(frame).await;
        }
    }

    fn begin(&self, item: ItemId) -> u64 {
        let gesture = self.next_gesture.fetch_add(1, Ordering::Relaxed) + 1;
        guard(&self.gestures).insert(item, (gesture, GesturePhase::GestureStarted));
        log::trace!("gesture {gesture} on {item}: Idle -> GestureStarted");
        gesture
    }

    fn advance(&self, gesture: u64, item: ItemId, phase: GesturePhase) {
        let mut gestures = guard(&self.gestures);
        if let Some((id, current)) = gestures.get_mut(&item) {
            if *id == gesture {
                log::trace!("gesture {gesture} on {item}: {current:?} -> {phase:?}");
                *current = phase;
            }
        }
    }

    fn finish(&self, gesture: u64, item: ItemId, phase: GesturePhase) {
        self.advance(gesture, item, phase);
        let mut gestures = guard(&self.gestures);
        if gestures.get(&item).is_some_and(|(id, _)| *id == gesture) {
            gestures.remove(&item);
            log::trace!("gesture {gesture} on {item}: {phase:?} -> Idle");
        }
    }
}

/// Placement of `item` in a rollback result.
fn restored_placement(restored: &Snapshot, item: ItemId) -> Option<(ContainerRef, f64)> {
    restored
        .iter()
        .find(|(id, _)| *id == item)
        .and_then(|(_, before)| before.as_ref())
        .and_then(|before| Some((before.container.to_wire()?, before.position)))
}

//! Optimistic mutation cache.
//!
//! Holds the locally known items of one board and applies the session's own
//! mutations before the persistence collaborator has seen them. Each
//! speculative operation keeps the prior state of every item it touched, so
//! a rejection restores the collection exactly.
//!
//! ```text
//!             apply_local(op)                 confirm(op, truth)
//!  confirmed ───────────────► pending{prior} ─────────────────► confirmed
//!                               │   ▲
//!          apply_remote(event)  │   │ remembered remote truth
//!          (fields merged, ─────┘   │
//!           placement remembered)   │ reject(op)
//!                               ◄───┘ restore prior, then remote truth
//! ```
//!
//! At most one pending operation targets an item (or a collection, for
//! rebalances). A second gesture on the same target supersedes the first:
//! the new operation inherits the original prior snapshot and the old
//! operation's eventual result is discarded.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::model::{
    display_order, ClientOpId, ContainerId, Item, ItemId, ItemKind, ItemPatch, ItemRecord,
    TempIds,
};
use crate::persistence::CanonicalState;
use crate::protocol::ServerEvent;

/// What a speculative operation is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpTarget {
    Item(ItemId),
    Collection(ContainerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Move,
    Create,
    Update,
    Delete,
    Rebalance,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpPayload {
    Move {
        from: ContainerId,
        to: ContainerId,
        position: f64,
    },
    Create {
        item: Item,
    },
    Update {
        patch: ItemPatch,
    },
    Delete,
    Rebalance {
        container: ContainerId,
        placements: Vec<(ItemId, f64)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    Confirmed,
    Rejected,
    Superseded,
}

/// A speculative mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOperation {
    pub id: ClientOpId,
    pub target: OpTarget,
    pub payload: OpPayload,
    pub status: OpStatus,
}

impl ClientOperation {
    fn new(target: OpTarget, payload: OpPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            payload,
            status: OpStatus::Pending,
        }
    }

    pub fn move_item(item: ItemId, from: ContainerId, to: ContainerId, position: f64) -> Self {
        Self::new(OpTarget::Item(item), OpPayload::Move { from, to, position })
    }

    /// `item.id` must be a temporary id from [`OptimisticCache::temp_id`].
    pub fn create(item: Item) -> Self {
        Self::new(OpTarget::Item(item.id), OpPayload::Create { item })
    }

    pub fn update(item: ItemId, patch: ItemPatch) -> Self {
        Self::new(OpTarget::Item(item), OpPayload::Update { patch })
    }

    pub fn delete(item: ItemId) -> Self {
        Self::new(OpTarget::Item(item), OpPayload::Delete)
    }

    pub fn rebalance(container: ContainerId, placements: Vec<(ItemId, f64)>) -> Self {
        Self::new(
            OpTarget::Collection(container),
            OpPayload::Rebalance {
                container,
                placements,
            },
        )
    }

    pub fn kind(&self) -> OpKind {
        match self.payload {
            OpPayload::Move { .. } => OpKind::Move,
            OpPayload::Create { .. } => OpKind::Create,
            OpPayload::Update { .. } => OpKind::Update,
            OpPayload::Delete => OpKind::Delete,
            OpPayload::Rebalance { .. } => OpKind::Rebalance,
        }
    }

    pub fn target_item(&self) -> Option<ItemId> {
        match self.target {
            OpTarget::Item(id) => Some(id),
            OpTarget::Collection(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("unknown item {0}")]
    UnknownItem(ItemId),
    #[error("item {0} has no server id yet")]
    UnconfirmedItem(ItemId),
    #[error("item {0} already exists")]
    DuplicateItem(ItemId),
    #[error("{kind:?} cannot live in {container}")]
    InvalidContainer { kind: ItemKind, container: ContainerId },
    #[error("unknown operation {0}")]
    UnknownOperation(ClientOpId),
}

/// Prior state of the items an operation touched.
pub type Snapshot = Vec<(ItemId, Option<Item>)>;

/// Remote state that arrived for an item while a local operation was pending.
#[derive(Debug, Clone, Default, PartialEq)]
struct RemoteTruth {
    placement: Option<(ContainerId, f64)>,
    fields: Option<(String, BTreeMap<String, String>)>,
    deleted: bool,
}

impl RemoteTruth {
    fn merge(&mut self, newer: RemoteTruth) {
        if newer.placement.is_some() {
            self.placement = newer.placement;
        }
        if newer.fields.is_some() {
            self.fields = newer.fields;
        }
        self.deleted |= newer.deleted;
    }
}

#[derive(Debug, Clone)]
struct PendingOp {
    op: ClientOperation,
    prior: Snapshot,
    remote: HashMap<ItemId, RemoteTruth>,
}

/// Result of [`OptimisticCache::apply_local`].
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub op_id: ClientOpId,
    /// Prior state the operation will roll back to.
    pub snapshot: Snapshot,
    /// Pending operation this one replaced.
    pub superseded: Option<ClientOpId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// Server truth applied. `item` is the (possibly newly resolved) target.
    Confirmed {
        op: ClientOperation,
        item: Option<ItemId>,
    },
    /// A newer operation replaced this one; its rollback target was updated.
    Superseded { by: ClientOpId },
    /// Result of an operation nothing depends on any more.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectOutcome {
    RolledBack {
        op: ClientOperation,
        /// State of the touched items after the rollback.
        restored: Snapshot,
    },
    Superseded { by: ClientOpId },
    Stale,
}

/// How an incoming room event affected the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEffect {
    Applied,
    /// Fields merged but placement held back behind a pending local op.
    Deferred,
    Ignored,
}

#[derive(Debug, Default)]
pub struct OptimisticCache {
    board: Option<Uuid>,
    items: HashMap<ItemId, Item>,
    pending: HashMap<ClientOpId, PendingOp>,
    by_target: HashMap<OpTarget, ClientOpId>,
    /// Superseded operation → the operation that replaced it
    superseded: HashMap<ClientOpId, ClientOpId>,
    temp_ids: TempIds,
    generation: u64,
}

impl OptimisticCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Loading ───────────────────────────────────────────────────

    /// Replace the state with a full authoritative fetch of `board`.
    pub fn load(&mut self, board: Uuid, records: impl IntoIterator<Item = ItemRecord>) {
        self.clear();
        self.board = Some(board);
        for record in records {
            let item = Item::from_record(record);
            self.items.insert(item.id, item);
        }
        log::debug!("cache loaded {} items for board {board}", self.items.len());
    }

    /// Drop every item and pending operation; results of older operations
    /// are recognised as stale through the generation counter.
    pub fn clear(&mut self) {
        self.items.clear();
        self.pending.clear();
        self.by_target.clear();
        self.superseded.clear();
        self.temp_ids = TempIds::new();
        self.generation += 1;
    }

    // ── Local operations ──────────────────────────────────────────

    /// Fresh temporary id for a speculative create.
    pub fn temp_id(&mut self) -> ItemId {
        ItemId::Temp(self.temp_ids.allocate())
    }

    /// Apply `op` immediately and remember how to undo it.
    pub fn apply_local(&mut self, mut op: ClientOperation) -> Result<Applied, CacheError> {
        self.validate(&op)?;
        let affected = self.affected_ids(&op);

        let previous = self.by_target.get(&op.target).copied();
        let (mut prior, remote) = match previous.and_then(|id| self.pending.remove(&id)) {
            Some(old) => (old.prior, old.remote),
            None => (Vec::new(), HashMap::new()),
        };
        for id in affected {
            if !prior.iter().any(|(known, _)| *known == id) {
                prior.push((id, self.items.get(&id).cloned()));
            }
        }

        self.mutate(&op.payload, op.target);

        if let Some(old) = previous {
            log::debug!("op {old} superseded by {}", op.id);
            self.superseded.insert(old, op.id);
        }
        op.status = OpStatus::Pending;
        let op_id = op.id;
        self.by_target.insert(op.target, op_id);
        self.pending.insert(
            op_id,
            PendingOp {
                op,
                prior: prior.clone(),
                remote,
            },
        );

        Ok(Applied {
            op_id,
            snapshot: prior,
            superseded: previous,
        })
    }

    /// Accept the persistence collaborator's answer for `op_id`.
    pub fn confirm(
        &mut self,
        op_id: ClientOpId,
        truth: Option<CanonicalState>,
    ) -> Result<ConfirmOutcome, CacheError> {
        if let Some(by) = self.superseded.remove(&op_id) {
            return Ok(match self.live_successor(by) {
                Some(live) => {
                    if let (Some(truth), Some(pending)) = (truth, self.pending.get_mut(&live)) {
                        rebase_prior(&mut pending.prior, &truth);
                    }
                    ConfirmOutcome::Superseded { by: live }
                }
                None => ConfirmOutcome::Stale,
            });
        }

        let PendingOp {
            mut op,
            prior: _,
            remote,
        } = self
            .pending
            .remove(&op_id)
            .ok_or(CacheError::UnknownOperation(op_id))?;
        self.by_target.remove(&op.target);

        let mut item = op.target_item();
        match truth {
            Some(CanonicalState::Item(record)) => {
                if let Some(ItemId::Temp(temp)) = item {
                    self.items.remove(&ItemId::Temp(temp));
                    self.temp_ids.resolve(temp, record.id);
                    self.rekey_children(ItemId::Temp(temp), ItemId::Server(record.id));
                }
                let confirmed = Item::from_record(record);
                item = Some(confirmed.id);
                self.items.insert(confirmed.id, confirmed);
            }
            Some(CanonicalState::Deleted { id }) => {
                self.remove_with_children(ItemId::Server(id));
            }
            Some(CanonicalState::Collection { container, items }) => {
                let container = ContainerId::from(container);
                for placement in items {
                    if let Some(local) = self.items.get_mut(&ItemId::Server(placement.id)) {
                        local.container = container;
                        local.position = placement.position;
                    }
                }
            }
            None => {}
        }

        // Deletions are final whatever order the writes landed in.
        for (id, truth) in remote {
            if truth.deleted {
                self.remove_with_children(id);
            }
        }

        op.status = OpStatus::Confirmed;
        log::trace!("op {op_id} confirmed");
        Ok(ConfirmOutcome::Confirmed { op, item })
    }

    /// Roll `op_id` back to its prior snapshot.
    pub fn reject(&mut self, op_id: ClientOpId) -> Result<RejectOutcome, CacheError> {
        if let Some(by) = self.superseded.remove(&op_id) {
            return Ok(match self.live_successor(by) {
                Some(live) => RejectOutcome::Superseded { by: live },
                None => RejectOutcome::Stale,
            });
        }

        let PendingOp {
            mut op,
            prior,
            remote,
        } = self
            .pending
            .remove(&op_id)
            .ok_or(CacheError::UnknownOperation(op_id))?;
        self.by_target.remove(&op.target);

        for (id, before) in &prior {
            match before {
                Some(item) => {
                    self.items.insert(*id, item.clone());
                }
                None => {
                    self.items.remove(id);
                }
            }
        }
        for (id, truth) in remote {
            self.apply_truth(id, truth);
        }

        let restored = prior
            .iter()
            .map(|(id, _)| (*id, self.items.get(id).cloned()))
            .collect();
        op.status = OpStatus::Rejected;
        log::debug!("op {op_id} rolled back");
        Ok(RejectOutcome::RolledBack { op, restored })
    }

    // ── Remote events ─────────────────────────────────────────────

    /// Merge a room event. Remote state wins, except that an item with a
    /// pending local operation keeps its local placement until it resolves.
    pub fn apply_remote(&mut self, event: &ServerEvent) -> RemoteEffect {
        match event {
            ServerEvent::ItemCreated { item } | ServerEvent::ItemUpdated { item } => {
                let incoming = Item::from_record(item.clone());
                let id = incoming.id;
                let is_create = matches!(event, ServerEvent::ItemCreated { .. });
                if let Some(op_id) = self.pending_op_on(id) {
                    let fields = Some((incoming.title.clone(), incoming.metadata.clone()));
                    if let Some(local) = self.items.get_mut(&id) {
                        local.merge_fields(&incoming);
                    }
                    self.remember(
                        op_id,
                        id,
                        RemoteTruth {
                            fields,
                            ..Default::default()
                        },
                    );
                    return RemoteEffect::Deferred;
                }
                match self.items.get_mut(&id) {
                    Some(local) if !is_create => local.merge_fields(&incoming),
                    _ => {
                        self.items.insert(id, incoming);
                    }
                }
                RemoteEffect::Applied
            }
            ServerEvent::ItemDeleted { item_id, .. } => {
                let id = ItemId::Server(*item_id);
                let mut doomed = self.pending_in_list(id);
                if let Some(op_id) = self.pending_op_on(id) {
                    doomed.push((op_id, id));
                }
                // A rollback must not bring back anything that went with the list.
                for (op_id, target) in doomed {
                    self.remember(
                        op_id,
                        target,
                        RemoteTruth {
                            deleted: true,
                            ..Default::default()
                        },
                    );
                }
                if self.remove_with_children(id) {
                    RemoteEffect::Applied
                } else {
                    RemoteEffect::Ignored
                }
            }
            ServerEvent::ItemMoved {
                item_id,
                to,
                new_position,
                ..
            } => self.remote_placement(ItemId::Server(*item_id), (*to).into(), *new_position),
            ServerEvent::CollectionRebalanced { container, items } => {
                let container = ContainerId::from(*container);
                let (mut applied, mut deferred) = (false, false);
                for placement in items {
                    let id = ItemId::Server(placement.id);
                    match self.remote_placement(id, container, placement.position) {
                        RemoteEffect::Applied => applied = true,
                        RemoteEffect::Deferred => deferred = true,
                        RemoteEffect::Ignored => {}
                    }
                }
                if applied {
                    RemoteEffect::Applied
                } else if deferred {
                    RemoteEffect::Deferred
                } else {
                    RemoteEffect::Ignored
                }
            }
            ServerEvent::RoomJoined { .. }
            | ServerEvent::PresenceJoined { .. }
            | ServerEvent::PresenceLeft { .. }
            | ServerEvent::PresenceTyping { .. } => RemoteEffect::Ignored,
        }
    }

    fn remote_placement(&mut self, id: ItemId, container: ContainerId, position: f64) -> RemoteEffect {
        if !self.items.contains_key(&id) {
            log::trace!("remote placement for unknown item {id}");
            return RemoteEffect::Ignored;
        }
        if let Some(op_id) = self.pending_op_on(id) {
            self.remember(
                op_id,
                id,
                RemoteTruth {
                    placement: Some((container, position)),
                    ..Default::default()
                },
            );
            return RemoteEffect::Deferred;
        }
        if let Some(item) = self.items.get_mut(&id) {
            item.container = container;
            item.position = position;
        }
        RemoteEffect::Applied
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Item by id, following resolved temporary ids.
    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.items
            .get(&id)
            .or_else(|| self.items.get(&self.temp_ids.lookup(id)))
    }

    /// Server id a temporary id resolved to, if any.
    pub fn resolve(&self, id: ItemId) -> ItemId {
        self.temp_ids.lookup(id)
    }

    /// One collection in display order.
    pub fn collection(&self, container: ContainerId) -> Vec<&Item> {
        let mut items: Vec<&Item> = self
            .items
            .values()
            .filter(|item| item.container == container)
            .collect();
        items.sort_by(|a, b| display_order(a, b));
        items
    }

    /// Every item, grouped by container then display order.
    pub fn state(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.values().cloned().collect();
        items.sort_by(|a, b| a.container.cmp(&b.container).then_with(|| display_order(a, b)));
        items
    }

    /// No two items of `container` share a position.
    pub fn positions_distinct(&self, container: ContainerId) -> bool {
        self.collection(container)
            .windows(2)
            .all(|pair| pair[0].position != pair[1].position)
    }

    pub fn pending(&self, op_id: ClientOpId) -> Option<&ClientOperation> {
        self.pending.get(&op_id).map(|p| &p.op)
    }

    pub fn pending_for(&self, item: ItemId) -> Option<&ClientOperation> {
        self.pending_op_on(item).and_then(|id| self.pending(id))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn board(&self) -> Option<Uuid> {
        self.board
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    // ── Internals ─────────────────────────────────────────────────

    fn validate(&self, op: &ClientOperation) -> Result<(), CacheError> {
        match &op.payload {
            OpPayload::Create { item } => {
                if self.items.contains_key(&item.id) {
                    return Err(CacheError::DuplicateItem(item.id));
                }
                check_fits(item.kind, item.container)
            }
            OpPayload::Move { to, .. } => {
                let id = op.target_item().ok_or(CacheError::UnknownOperation(op.id))?;
                let item = self.items.get(&id).ok_or(CacheError::UnknownItem(id))?;
                if id.is_temp() {
                    return Err(CacheError::UnconfirmedItem(id));
                }
                check_fits(item.kind, *to)
            }
            OpPayload::Update { .. } | OpPayload::Delete => {
                let id = op.target_item().ok_or(CacheError::UnknownOperation(op.id))?;
                if !self.items.contains_key(&id) {
                    return Err(CacheError::UnknownItem(id));
                }
                if id.is_temp() {
                    return Err(CacheError::UnconfirmedItem(id));
                }
                Ok(())
            }
            OpPayload::Rebalance { .. } => Ok(()),
        }
    }

    fn affected_ids(&self, op: &ClientOperation) -> Vec<ItemId> {
        match &op.payload {
            OpPayload::Move { .. } | OpPayload::Update { .. } => op.target_item().into_iter().collect(),
            OpPayload::Create { item } => vec![item.id],
            OpPayload::Delete => {
                let mut ids: Vec<ItemId> = op.target_item().into_iter().collect();
                if let Some(id) = op.target_item() {
                    ids.extend(self.children_of(id));
                }
                ids
            }
            OpPayload::Rebalance { placements, .. } => placements.iter().map(|(id, _)| *id).collect(),
        }
    }

    fn mutate(&mut self, payload: &OpPayload, target: OpTarget) {
        match payload {
            OpPayload::Move { to, position, .. } => {
                if let OpTarget::Item(id) = target {
                    if let Some(item) = self.items.get_mut(&id) {
                        item.container = *to;
                        item.position = *position;
                    }
                }
            }
            OpPayload::Create { item } => {
                self.items.insert(item.id, item.clone());
            }
            OpPayload::Update { patch } => {
                if let OpTarget::Item(id) = target {
                    if let Some(item) = self.items.get_mut(&id) {
                        item.apply_patch(patch);
                    }
                }
            }
            OpPayload::Delete => {
                if let OpTarget::Item(id) = target {
                    self.remove_with_children(id);
                }
            }
            OpPayload::Rebalance {
                container,
                placements,
            } => {
                for (id, position) in placements {
                    if let Some(item) = self.items.get_mut(id) {
                        if item.container == *container {
                            item.position = *position;
                        }
                    }
                }
            }
        }
    }

    fn pending_op_on(&self, item: ItemId) -> Option<ClientOpId> {
        self.by_target.get(&OpTarget::Item(item)).copied()
    }

    fn remember(&mut self, op_id: ClientOpId, item: ItemId, truth: RemoteTruth) {
        if let Some(pending) = self.pending.get_mut(&op_id) {
            pending.remote.entry(item).or_default().merge(truth);
        }
    }

    fn apply_truth(&mut self, id: ItemId, truth: RemoteTruth) {
        if truth.deleted {
            self.remove_with_children(id);
            return;
        }
        if let Some(item) = self.items.get_mut(&id) {
            if let Some((container, position)) = truth.placement {
                item.container = container;
                item.position = position;
            }
            if let Some((title, metadata)) = truth.fields {
                item.title = title;
                item.metadata = metadata;
            }
        }
    }

    fn live_successor(&self, mut id: ClientOpId) -> Option<ClientOpId> {
        loop {
            if self.pending.contains_key(&id) {
                return Some(id);
            }
            id = *self.superseded.get(&id)?;
        }
    }

    fn children_of(&self, list: ItemId) -> Vec<ItemId> {
        let container = ContainerId::List(list);
        self.items
            .values()
            .filter(|item| item.container == container)
            .map(|item| item.id)
            .collect()
    }

    /// Items of pending operations that sit in `list` now, or did before the
    /// operation moved them out.
    fn pending_in_list(&self, list: ItemId) -> Vec<(ClientOpId, ItemId)> {
        let container = ContainerId::List(list);
        let mut hits = Vec::new();
        for (op_id, pending) in &self.pending {
            for (id, before) in &pending.prior {
                let was_child = before.as_ref().is_some_and(|item| item.container == container);
                let is_child = self.items.get(id).is_some_and(|item| item.container == container);
                if was_child || is_child {
                    hits.push((*op_id, *id));
                }
            }
        }
        hits
    }

    fn remove_with_children(&mut self, id: ItemId) -> bool {
        let removed = self.items.remove(&id).is_some();
        for child in self.children_of(id) {
            self.items.remove(&child);
        }
        removed
    }

    fn rekey_children(&mut self, from: ItemId, to: ItemId) {
        for item in self.items.values_mut() {
            if item.container == ContainerId::List(from) {
                item.container = ContainerId::List(to);
            }
        }
    }
}

fn check_fits(kind: ItemKind, container: ContainerId) -> Result<(), CacheError> {
    let fits = matches!(
        (kind, container),
        (ItemKind::List, ContainerId::Board(_)) | (ItemKind::Card, ContainerId::List(_))
    );
    if fits {
        Ok(())
    } else {
        Err(CacheError::InvalidContainer { kind, container })
    }
}

/// Fold server truth for a superseded operation into the rollback target of
/// the operation that replaced it.
fn rebase_prior(prior: &mut Snapshot, truth: &CanonicalState) {
    match truth {
        CanonicalState::Item(record) => {
            let id = ItemId::Server(record.id);
            for (known, state) in prior.iter_mut() {
                if *known == id {
                    *state = Some(Item::from_record(record.clone()));
                }
            }
        }
        CanonicalState::Deleted { id } => {
            let id = ItemId::Server(*id);
            for (known, state) in prior.iter_mut() {
                if *known == id {
                    *state = None;
                }
            }
        }
        CanonicalState::Collection { container, items } => {
            let container = ContainerId::from(*container);
            for placement in items {
                let id = ItemId::Server(placement.id);
                for (known, state) in prior.iter_mut() {
                    if let (true, Some(item)) = (*known == id, state.as_mut()) {
                        item.container = container;
                        item.position = placement.position;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerRef, Placement};

    struct Fixture {
        cache: OptimisticCache,
        board: Uuid,
        list: ItemId,
        other_list: ItemId,
        cards: Vec<ItemId>,
    }

    fn record(kind: ItemKind, container: ContainerRef, position: f64, title: &str) -> ItemRecord {
        ItemRecord {
            id: Uuid::new_v4(),
            kind,
            container,
            position,
            title: title.into(),
            metadata: BTreeMap::new(),
        }
    }

    fn fixture() -> Fixture {
        let board = Uuid::new_v4();
        let list = record(ItemKind::List, ContainerRef::Board(board), 1024.0, "todo");
        let other = record(ItemKind::List, ContainerRef::Board(board), 2048.0, "done");
        let cards: Vec<ItemRecord> = [1024.0, 2048.0, 3072.0]
            .iter()
            .enumerate()
            .map(|(i, p)| record(ItemKind::Card, ContainerRef::List(list.id), *p, &format!("c{i}")))
            .collect();

        let mut cache = OptimisticCache::new();
        let card_ids = cards.iter().map(|c| ItemId::Server(c.id)).collect();
        cache.load(board, [list.clone(), other.clone()].into_iter().chain(cards));
        Fixture {
            cache,
            board,
            list: ItemId::Server(list.id),
            other_list: ItemId::Server(other.id),
            cards: card_ids,
        }
    }

    fn list_of(id: ItemId) -> ContainerId {
        ContainerId::List(id)
    }

    #[test]
    fn test_apply_local_move_is_visible_immediately() {
        let mut f = fixture();
        let op = ClientOperation::move_item(f.cards[2], list_of(f.list), list_of(f.list), 512.0);
        f.cache.apply_local(op).unwrap();
        let order: Vec<ItemId> = f.cache.collection(list_of(f.list)).iter().map(|i| i.id).collect();
        assert_eq!(order, vec![f.cards[2], f.cards[0], f.cards[1]]);
        assert_eq!(f.cache.pending_count(), 1);
    }

    #[test]
    fn test_apply_then_reject_restores_exact_state() {
        let mut f = fixture();
        let before = f.cache.state();

        let op = ClientOperation::move_item(f.cards[0], list_of(f.list), list_of(f.other_list), 99.0);
        let applied = f.cache.apply_local(op).unwrap();
        assert_ne!(f.cache.state(), before);

        match f.cache.reject(applied.op_id).unwrap() {
            RejectOutcome::RolledBack { op, .. } => assert_eq!(op.status, OpStatus::Rejected),
            other => panic!("Expected RolledBack, got {other:?}"),
        }
        assert_eq!(f.cache.state(), before);
        assert_eq!(f.cache.pending_count(), 0);
    }

    #[test]
    fn test_reject_delete_restores_children() {
        let mut f = fixture();
        let before = f.cache.state();
        let applied = f.cache.apply_local(ClientOperation::delete(f.list)).unwrap();
        assert_eq!(f.cache.len(), 1);
        f.cache.reject(applied.op_id).unwrap();
        assert_eq!(f.cache.state(), before);
    }

    #[test]
    fn test_confirm_with_canonical_position() {
        let mut f = fixture();
        let op = ClientOperation::move_item(f.cards[2], list_of(f.list), list_of(f.list), 512.0);
        let applied = f.cache.apply_local(op).unwrap();

        let mut truth = f.cache.get(f.cards[2]).unwrap().to_record().unwrap();
        truth.position = 600.0;
        let outcome = f
            .cache
            .confirm(applied.op_id, Some(CanonicalState::Item(truth)))
            .unwrap();
        assert!(matches!(outcome, ConfirmOutcome::Confirmed { .. }));
        assert_eq!(f.cache.get(f.cards[2]).unwrap().position, 600.0);
        assert!(f.cache.pending_for(f.cards[2]).is_none());
    }

    #[test]
    fn test_create_confirm_resolves_temp_id() {
        let mut f = fixture();
        let temp = f.cache.temp_id();
        let item = Item {
            id: temp,
            kind: ItemKind::List,
            container: ContainerId::Board(f.board),
            position: 4096.0,
            title: "new".into(),
            metadata: BTreeMap::new(),
        };
        let applied = f.cache.apply_local(ClientOperation::create(item.clone())).unwrap();
        assert!(f.cache.get(temp).is_some());

        let server = Uuid::new_v4();
        let mut confirmed = item;
        confirmed.id = ItemId::Server(server);
        let truth = CanonicalState::Item(confirmed.to_record().unwrap());
        match f.cache.confirm(applied.op_id, Some(truth)).unwrap() {
            ConfirmOutcome::Confirmed { item, .. } => assert_eq!(item, Some(ItemId::Server(server))),
            other => panic!("Expected Confirmed, got {other:?}"),
        }
        assert_eq!(f.cache.resolve(temp), ItemId::Server(server));
        assert_eq!(f.cache.get(temp).unwrap().id, ItemId::Server(server));
        assert!(f.cache.items.keys().all(|id| !id.is_temp()));
    }

    #[test]
    fn test_temp_item_cannot_move() {
        let mut f = fixture();
        let temp = f.cache.temp_id();
        let item = Item {
            id: temp,
            kind: ItemKind::Card,
            container: list_of(f.list),
            position: 4096.0,
            title: "draft".into(),
            metadata: BTreeMap::new(),
        };
        f.cache.apply_local(ClientOperation::create(item)).unwrap();
        let err = f
            .cache
            .apply_local(ClientOperation::move_item(temp, list_of(f.list), list_of(f.list), 1.0))
            .unwrap_err();
        assert_eq!(err, CacheError::UnconfirmedItem(temp));
    }

    #[test]
    fn test_card_cannot_move_to_board() {
        let mut f = fixture();
        let err = f
            .cache
            .apply_local(ClientOperation::move_item(
                f.cards[0],
                list_of(f.list),
                ContainerId::Board(f.board),
                1.0,
            ))
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidContainer { .. }));
    }

    #[test]
    fn test_remote_move_without_pending_sets_placement() {
        let mut f = fixture();
        let mut expected = fixture_state_with(&f, f.cards[0], list_of(f.other_list), 777.0);
        expected.sort_by(|a, b| a.container.cmp(&b.container).then_with(|| display_order(a, b)));

        let event = ServerEvent::ItemMoved {
            item_id: f.cards[0].server().unwrap(),
            from: ContainerRef::List(f.list.server().unwrap()),
            to: ContainerRef::List(f.other_list.server().unwrap()),
            new_position: 777.0,
        };
        assert_eq!(f.cache.apply_remote(&event), RemoteEffect::Applied);
        assert_eq!(f.cache.state(), expected);
    }

    fn fixture_state_with(f: &Fixture, id: ItemId, container: ContainerId, position: f64) -> Vec<Item> {
        let mut state = f.cache.state();
        for item in state.iter_mut() {
            if item.id == id {
                item.container = container;
                item.position = position;
            }
        }
        state
    }

    #[test]
    fn test_remote_move_on_pending_item_is_deferred() {
        let mut f = fixture();
        let op = ClientOperation::move_item(f.cards[0], list_of(f.list), list_of(f.list), 4000.0);
        let applied = f.cache.apply_local(op).unwrap();

        let event = ServerEvent::ItemMoved {
            item_id: f.cards[0].server().unwrap(),
            from: ContainerRef::List(f.list.server().unwrap()),
            to: ContainerRef::List(f.list.server().unwrap()),
            new_position: 10.0,
        };
        assert_eq!(f.cache.apply_remote(&event), RemoteEffect::Deferred);
        assert_eq!(f.cache.get(f.cards[0]).unwrap().position, 4000.0);

        // Rollback lands on the remote truth, not the stale snapshot.
        f.cache.reject(applied.op_id).unwrap();
        assert_eq!(f.cache.get(f.cards[0]).unwrap().position, 10.0);
    }

    #[test]
    fn test_remote_update_merges_fields_on_pending_item() {
        let mut f = fixture();
        let op = ClientOperation::move_item(f.cards[1], list_of(f.list), list_of(f.list), 5000.0);
        f.cache.apply_local(op).unwrap();

        let mut record = f.cache.get(f.cards[1]).unwrap().to_record().unwrap();
        record.title = "renamed elsewhere".into();
        record.position = 1.0;
        let effect = f.cache.apply_remote(&ServerEvent::ItemUpdated { item: record });
        assert_eq!(effect, RemoteEffect::Deferred);

        let item = f.cache.get(f.cards[1]).unwrap();
        assert_eq!(item.title, "renamed elsewhere");
        assert_eq!(item.position, 5000.0);
    }

    #[test]
    fn test_remote_move_of_unknown_item_is_ignored() {
        let mut f = fixture();
        let list = ContainerRef::List(f.list.server().unwrap());
        let event = ServerEvent::ItemMoved {
            item_id: Uuid::new_v4(),
            from: list,
            to: list,
            new_position: 1.0,
        };
        assert_eq!(f.cache.apply_remote(&event), RemoteEffect::Ignored);
    }

    #[test]
    fn test_remote_delete_wins_over_pending_update() {
        let mut f = fixture();
        let applied = f
            .cache
            .apply_local(ClientOperation::update(f.cards[0], ItemPatch::title("mine")))
            .unwrap();
        f.cache.apply_remote(&ServerEvent::ItemDeleted {
            item_id: f.cards[0].server().unwrap(),
            container: ContainerRef::List(f.list.server().unwrap()),
        });
        assert!(f.cache.get(f.cards[0]).is_none());

        f.cache.reject(applied.op_id).unwrap();
        assert!(f.cache.get(f.cards[0]).is_none());
    }

    fn delete_list(list: ItemId, board: Uuid) -> ServerEvent {
        ServerEvent::ItemDeleted {
            item_id: list.server().unwrap(),
            container: ContainerRef::Board(board),
        }
    }

    #[test]
    fn test_remote_list_delete_wins_over_pending_card_move() {
        let mut f = fixture();
        let applied = f
            .cache
            .apply_local(ClientOperation::move_item(f.cards[0], list_of(f.list), list_of(f.list), 512.0))
            .unwrap();
        f.cache.apply_remote(&delete_list(f.list, f.board));
        assert!(f.cache.get(f.cards[0]).is_none());

        match f.cache.reject(applied.op_id).unwrap() {
            RejectOutcome::RolledBack { restored, .. } => {
                assert_eq!(restored, vec![(f.cards[0], None)]);
            }
            other => panic!("Expected RolledBack, got {other:?}"),
        }
        assert!(f.cache.get(f.list).is_none());
        assert!(f.cache.get(f.cards[0]).is_none());
        assert!(f.cache.collection(list_of(f.list)).is_empty());
    }

    #[test]
    fn test_remote_list_delete_after_card_moved_out() {
        let mut f = fixture();
        let applied = f
            .cache
            .apply_local(ClientOperation::move_item(
                f.cards[1],
                list_of(f.list),
                list_of(f.other_list),
                1024.0,
            ))
            .unwrap();
        f.cache.apply_remote(&delete_list(f.list, f.board));
        // The card already left the list locally, so it survives for now.
        assert!(f.cache.get(f.cards[1]).is_some());

        // Rolling the move back would return it to the deleted list.
        f.cache.reject(applied.op_id).unwrap();
        assert!(f.cache.get(f.cards[1]).is_none());
        assert_eq!(f.cache.len(), 1);
    }

    #[test]
    fn test_second_gesture_supersedes_first() {
        let mut f = fixture();
        let before = f.cache.state();
        let first = f
            .cache
            .apply_local(ClientOperation::move_item(f.cards[0], list_of(f.list), list_of(f.list), 2500.0))
            .unwrap();
        let second = f
            .cache
            .apply_local(ClientOperation::move_item(f.cards[0], list_of(f.list), list_of(f.list), 3500.0))
            .unwrap();
        assert_eq!(second.superseded, Some(first.op_id));
        assert_eq!(f.cache.pending_count(), 1);

        // The older result is discarded.
        let outcome = f.cache.confirm(first.op_id, None).unwrap();
        assert_eq!(outcome, ConfirmOutcome::Superseded { by: second.op_id });
        assert_eq!(f.cache.get(f.cards[0]).unwrap().position, 3500.0);

        // Rolling back the newer one goes back to the pre-gesture state.
        f.cache.reject(second.op_id).unwrap();
        assert_eq!(f.cache.state(), before);
    }

    #[test]
    fn test_superseded_confirm_rebases_rollback_target() {
        let mut f = fixture();
        let first = f
            .cache
            .apply_local(ClientOperation::move_item(f.cards[0], list_of(f.list), list_of(f.list), 2500.0))
            .unwrap();
        let second = f
            .cache
            .apply_local(ClientOperation::move_item(f.cards[0], list_of(f.list), list_of(f.list), 3500.0))
            .unwrap();

        let mut truth = f.cache.get(f.cards[0]).unwrap().to_record().unwrap();
        truth.position = 2500.0;
        f.cache.confirm(first.op_id, Some(CanonicalState::Item(truth))).unwrap();

        f.cache.reject(second.op_id).unwrap();
        assert_eq!(f.cache.get(f.cards[0]).unwrap().position, 2500.0);
    }

    #[test]
    fn test_result_after_newer_resolved_is_stale() {
        let mut f = fixture();
        let first = f
            .cache
            .apply_local(ClientOperation::update(f.cards[0], ItemPatch::title("a")))
            .unwrap();
        let second = f
            .cache
            .apply_local(ClientOperation::update(f.cards[0], ItemPatch::title("b")))
            .unwrap();
        f.cache.confirm(second.op_id, None).unwrap();
        assert_eq!(f.cache.reject(first.op_id).unwrap(), RejectOutcome::Stale);
        assert_eq!(f.cache.get(f.cards[0]).unwrap().title, "b");
    }

    #[test]
    fn test_rebalance_op_and_remote_echo() {
        let mut f = fixture();
        let placements: Vec<(ItemId, f64)> = f
            .cards
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, 100.0 * (i + 1) as f64))
            .collect();
        let applied = f
            .cache
            .apply_local(ClientOperation::rebalance(list_of(f.list), placements.clone()))
            .unwrap();
        assert_eq!(f.cache.get(f.cards[1]).unwrap().position, 200.0);

        let echo = ServerEvent::CollectionRebalanced {
            container: ContainerRef::List(f.list.server().unwrap()),
            items: placements
                .iter()
                .map(|(id, p)| Placement {
                    id: id.server().unwrap(),
                    position: *p,
                })
                .collect(),
        };
        assert_eq!(f.cache.apply_remote(&echo), RemoteEffect::Applied);
        f.cache.confirm(applied.op_id, None).unwrap();
        assert!(f.cache.positions_distinct(list_of(f.list)));
    }

    #[test]
    fn test_clear_bumps_generation() {
        let mut f = fixture();
        let generation = f.cache.generation();
        let applied = f
            .cache
            .apply_local(ClientOperation::delete(f.cards[0]))
            .unwrap();
        f.cache.clear();
        assert!(f.cache.is_empty());
        assert_eq!(f.cache.generation(), generation + 1);
        assert_eq!(
            f.cache.confirm(applied.op_id, None),
            Err(CacheError::UnknownOperation(applied.op_id))
        );
    }
}

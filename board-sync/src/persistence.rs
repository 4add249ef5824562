//! Persistence collaborator boundary.
//!
//! The sync engine never stores items itself. Every authoritative write goes
//! through [`Persistence::persist`], and full board state comes back from
//! [`Persistence::fetch_board`] on (re)connect. The response may carry a
//! canonical state that differs from what the caller proposed, for example
//! when two sessions raced for the same position and the store had to pick
//! another key, or had to rebalance the whole collection.
//!
//! [`MemoryPersistence`] is the in-process implementation used by the
//! server binary and the tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::model::{ContainerRef, ItemKind, ItemRecord, NewItem, Placement};
use crate::position::{placement_neighbors, AllocatorConfig};

/// One authoritative write.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistRequest {
    Move {
        board_id: Uuid,
        item_id: Uuid,
        to: ContainerRef,
        target_index: u32,
        position: f64,
    },
    Create {
        board_id: Uuid,
        item: NewItem,
    },
    Update {
        board_id: Uuid,
        item: ItemRecord,
    },
    Delete {
        board_id: Uuid,
        item_id: Uuid,
    },
    Rebalance {
        board_id: Uuid,
        container: ContainerRef,
        items: Vec<Placement>,
    },
}

impl PersistRequest {
    pub fn board_id(&self) -> Uuid {
        match self {
            PersistRequest::Move { board_id, .. }
            | PersistRequest::Create { board_id, .. }
            | PersistRequest::Update { board_id, .. }
            | PersistRequest::Delete { board_id, .. }
            | PersistRequest::Rebalance { board_id, .. } => *board_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PersistRequest::Move { .. } => "move",
            PersistRequest::Create { .. } => "create",
            PersistRequest::Update { .. } => "update",
            PersistRequest::Delete { .. } => "delete",
            PersistRequest::Rebalance { .. } => "rebalance",
        }
    }
}

/// Authoritative result of a write.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalState {
    Item(ItemRecord),
    Deleted { id: Uuid },
    /// The whole collection was repositioned.
    Collection {
        container: ContainerRef,
        items: Vec<Placement>,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistResponse {
    pub canonical: Option<CanonicalState>,
}

impl PersistResponse {
    pub fn canonical(state: CanonicalState) -> Self {
        Self {
            canonical: Some(state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistError {
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("item not found: {0}")]
    NotFound(Uuid),
    #[error("persistence call timed out")]
    Timeout,
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

/// Storage collaborator consumed by the reconciliation controller.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Full authoritative state of one board.
    async fn fetch_board(&self, board_id: Uuid) -> Result<Vec<ItemRecord>, PersistError>;

    /// Apply one write and return the canonical outcome.
    async fn persist(&self, request: PersistRequest) -> Result<PersistResponse, PersistError>;
}

#[async_trait]
impl<T: Persistence + ?Sized> Persistence for Arc<T> {
    async fn fetch_board(&self, board_id: Uuid) -> Result<Vec<ItemRecord>, PersistError> {
        (**self).fetch_board(board_id).await
    }

    async fn persist(&self, request: PersistRequest) -> Result<PersistResponse, PersistError> {
        (**self).persist(request).await
    }
}

#[derive(Debug, Default)]
struct BoardState {
    items: HashMap<Uuid, ItemRecord>,
}

impl BoardState {
    /// Placements of `container` in display order, leaving `skip` out.
    fn ordered(&self, container: &ContainerRef, skip: Option<Uuid>) -> Vec<Placement> {
        let mut placements: Vec<Placement> = self
            .items
            .values()
            .filter(|item| &item.container == container && Some(item.id) != skip)
            .map(|item| Placement {
                id: item.id,
                position: item.position,
            })
            .collect();
        placements.sort_by(|a, b| a.position.total_cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        placements
    }

    fn check_container(&self, kind: ItemKind, container: &ContainerRef) -> Result<(), PersistError> {
        if !kind.fits(container) {
            return Err(PersistError::Rejected(format!(
                "{kind:?} cannot live in {container:?}"
            )));
        }
        if let ContainerRef::List(list_id) = container {
            match self.items.get(list_id) {
                Some(list) if list.kind == ItemKind::List => {}
                _ => return Err(PersistError::Rejected(format!("no list {list_id}"))),
            }
        }
        Ok(())
    }
}

/// In-memory [`Persistence`] with one write lock per board.
///
/// Colliding positions are resolved on write: the store re-allocates at the
/// requested index against its own state, and rebalances the collection when
/// no key is left.
pub struct MemoryPersistence {
    boards: RwLock<HashMap<Uuid, Arc<Mutex<BoardState>>>>,
    allocator: AllocatorConfig,
    failures: Mutex<VecDeque<PersistError>>,
    latency: Option<Duration>,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
            allocator: AllocatorConfig::default(),
            failures: Mutex::new(VecDeque::new()),
            latency: None,
        }
    }

    /// Delay every write by `latency` (simulates a remote store).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next write fail with `error`.
    pub async fn fail_next(&self, error: PersistError) {
        self.failures.lock().await.push_back(error);
    }

    /// Insert records as-is.
    pub async fn seed(&self, board_id: Uuid, records: impl IntoIterator<Item = ItemRecord>) {
        let board = self.board(board_id).await;
        let mut board = board.lock().await;
        for record in records {
            board.items.insert(record.id, record);
        }
    }

    /// Current state of one collection in display order.
    pub async fn collection(&self, board_id: Uuid, container: ContainerRef) -> Vec<ItemRecord> {
        let board = self.board(board_id).await;
        let board = board.lock().await;
        board
            .ordered(&container, None)
            .into_iter()
            .filter_map(|p| board.items.get(&p.id).cloned())
            .collect()
    }

    async fn board(&self, board_id: Uuid) -> Arc<Mutex<BoardState>> {
        {
            let boards = self.boards.read().await;
            if let Some(board) = boards.get(&board_id) {
                return board.clone();
            }
        }
        let mut boards = self.boards.write().await;
        boards.entry(board_id).or_default().clone()
    }

    /// Keep `requested` unless it collides with a neighbor; otherwise pick a
    /// fresh key at `index`. `None` means the collection must be rebalanced.
    fn resolve_position(
        &self,
        others: &[Placement],
        requested: f64,
        index: Option<usize>,
    ) -> Option<f64> {
        let collides = others
            .iter()
            .any(|p| (p.position - requested).abs() < self.allocator.epsilon);
        if !collides {
            return Some(requested);
        }
        let index = index.unwrap_or_else(|| others.iter().filter(|p| p.position < requested).count());
        let (prev, next) = placement_neighbors(others, index, None);
        self.allocator.allocate(prev, next).ok()
    }

    /// Evenly respace `container` with `item_id` placed at `index`.
    fn respace(
        board: &mut BoardState,
        allocator: &AllocatorConfig,
        container: ContainerRef,
        item_id: Uuid,
        index: usize,
    ) -> CanonicalState {
        let mut order: Vec<Uuid> = board
            .ordered(&container, Some(item_id))
            .into_iter()
            .map(|p| p.id)
            .collect();
        order.insert(index.min(order.len()), item_id);

        let mut items = Vec::with_capacity(order.len());
        for (i, id) in order.into_iter().enumerate() {
            let position = allocator.base + allocator.step * i as f64;
            if let Some(record) = board.items.get_mut(&id) {
                record.position = position;
            }
            items.push(Placement { id, position });
        }
        CanonicalState::Collection { container, items }
    }

    fn apply(
        &self,
        board: &mut BoardState,
        request: PersistRequest,
    ) -> Result<PersistResponse, PersistError> {
        match request {
            PersistRequest::Move {
                item_id,
                to,
                target_index,
                position,
                ..
            } => {
                if !position.is_finite() {
                    return Err(PersistError::Rejected("non-finite position".into()));
                }
                let kind = board
                    .items
                    .get(&item_id)
                    .map(|item| item.kind)
                    .ok_or(PersistError::NotFound(item_id))?;
                if to == ContainerRef::List(item_id) {
                    return Err(PersistError::Rejected("a list cannot contain itself".into()));
                }
                board.check_container(kind, &to)?;

                let others = board.ordered(&to, Some(item_id));
                let index = target_index as usize;
                match self.resolve_position(&others, position, Some(index)) {
                    Some(resolved) => {
                        let record = board
                            .items
                            .get_mut(&item_id)
                            .ok_or(PersistError::NotFound(item_id))?;
                        record.container = to;
                        record.position = resolved;
                        if resolved != position {
                            log::debug!("move {item_id}: {position} collided, stored at {resolved}");
                        }
                        Ok(PersistResponse::canonical(CanonicalState::Item(record.clone())))
                    }
                    None => {
                        if let Some(record) = board.items.get_mut(&item_id) {
                            record.container = to;
                        }
                        log::debug!("move {item_id}: collection {to:?} exhausted, rebalancing");
                        Ok(PersistResponse::canonical(Self::respace(
                            board,
                            &self.allocator,
                            to,
                            item_id,
                            index,
                        )))
                    }
                }
            }
            PersistRequest::Create { item, .. } => {
                if !item.position.is_finite() {
                    return Err(PersistError::Rejected("non-finite position".into()));
                }
                board.check_container(item.kind, &item.container)?;

                let id = Uuid::new_v4();
                let others = board.ordered(&item.container, None);
                let requested = item.position;
                // No room at the requested spot: append instead of respacing
                // items the creator never touched.
                let position = match self.resolve_position(&others, requested, None) {
                    Some(position) => position,
                    None => self
                        .allocator
                        .allocate(others.last().map(|p| p.position), None)
                        .map_err(|e| PersistError::Rejected(e.to_string()))?,
                };
                if position != requested {
                    log::debug!("create {id}: {requested} collided, stored at {position}");
                }
                let mut record = item.into_record(id);
                record.position = position;
                board.items.insert(id, record.clone());
                Ok(PersistResponse::canonical(CanonicalState::Item(record)))
            }
            PersistRequest::Update { item, .. } => {
                let stored = board
                    .items
                    .get_mut(&item.id)
                    .ok_or(PersistError::NotFound(item.id))?;
                // Placement only changes through moves.
                stored.title = item.title;
                stored.metadata = item.metadata;
                Ok(PersistResponse::canonical(CanonicalState::Item(stored.clone())))
            }
            PersistRequest::Delete { item_id, .. } => {
                let removed = board
                    .items
                    .remove(&item_id)
                    .ok_or(PersistError::NotFound(item_id))?;
                if removed.kind == ItemKind::List {
                    let list = ContainerRef::List(item_id);
                    board.items.retain(|_, item| item.container != list);
                }
                Ok(PersistResponse::canonical(CanonicalState::Deleted { id: item_id }))
            }
            PersistRequest::Rebalance {
                container, items, ..
            } => {
                if items.iter().any(|p| !p.position.is_finite()) {
                    return Err(PersistError::Rejected("non-finite position".into()));
                }
                for placement in &items {
                    if let Some(record) = board.items.get_mut(&placement.id) {
                        if record.container == container {
                            record.position = placement.position;
                        }
                    }
                }

                let mut stored = board.ordered(&container, None);
                let distinct = stored
                    .windows(2)
                    .all(|pair| pair[1].position - pair[0].position >= self.allocator.epsilon);
                if !distinct {
                    stored = self.allocator.rebalance_placements(&stored);
                    for placement in &stored {
                        if let Some(record) = board.items.get_mut(&placement.id) {
                            record.position = placement.position;
                        }
                    }
                }
                Ok(PersistResponse::canonical(CanonicalState::Collection {
                    container,
                    items: stored,
                }))
            }
        }
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn fetch_board(&self, board_id: Uuid) -> Result<Vec<ItemRecord>, PersistError> {
        let board = self.board(board_id).await;
        let board = board.lock().await;
        let mut records: Vec<ItemRecord> = board.items.values().cloned().collect();
        records.sort_by(|a, b| a.position.total_cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn persist(&self, request: PersistRequest) -> Result<PersistResponse, PersistError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = self.failures.lock().await.pop_front() {
            log::debug!("{} on board {}: injected failure {error}", request.kind(), request.board_id());
            return Err(error);
        }

        let board = self.board(request.board_id()).await;
        let mut board = board.lock().await;
        log::trace!("persist {} on board {}", request.kind(), request.board_id());
        self.apply(&mut board, request)
    }
}

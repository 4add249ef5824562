//! Board data model: items, containers and typed identifiers.
//!
//! Two id spaces exist side by side:
//!
//! ```text
//! ItemId::Server(Uuid)   ── assigned by the persistence collaborator, stable
//! ItemId::Temp(TempId)   ── assigned locally for speculative creates
//! ```
//!
//! Wire frames only carry server ids (`Uuid`), so a temporary id can never
//! be published to peers. [`TempIds`] records which server id a temporary
//! id resolved to once its create was confirmed.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A board, which is also the broadcast room for its sessions.
pub type RoomId = Uuid;
/// One connected participant channel.
pub type SessionId = Uuid;
/// Authenticated user behind one or more sessions.
pub type UserId = Uuid;
/// Locally generated id of a speculative operation.
pub type ClientOpId = Uuid;

/// Locally allocated id for an item that the server has not assigned yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(u64);

impl TempId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Identity of an item inside the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemId {
    Server(Uuid),
    Temp(TempId),
}

impl ItemId {
    /// The server id, if this item has one.
    pub fn server(&self) -> Option<Uuid> {
        match self {
            ItemId::Server(id) => Some(*id),
            ItemId::Temp(_) => None,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, ItemId::Temp(_))
    }
}

impl From<Uuid> for ItemId {
    fn from(id: Uuid) -> Self {
        ItemId::Server(id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Server(id) => write!(f, "{id}"),
            ItemId::Temp(t) => write!(f, "temp#{}", t.0),
        }
    }
}

/// Parent of an ordered collection: the board for lists, a list for cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContainerId {
    Board(Uuid),
    List(ItemId),
}

impl ContainerId {
    /// Wire form of this container. `None` while the parent list is speculative.
    pub fn to_wire(&self) -> Option<ContainerRef> {
        match self {
            ContainerId::Board(id) => Some(ContainerRef::Board(*id)),
            ContainerId::List(item) => item.server().map(ContainerRef::List),
        }
    }
}

impl From<ContainerRef> for ContainerId {
    fn from(c: ContainerRef) -> Self {
        match c {
            ContainerRef::Board(id) => ContainerId::Board(id),
            ContainerRef::List(id) => ContainerId::List(ItemId::Server(id)),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerId::Board(id) => write!(f, "board:{id}"),
            ContainerId::List(item) => write!(f, "list:{item}"),
        }
    }
}

/// Container reference as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerRef {
    Board(Uuid),
    List(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    List,
    Card,
}

impl ItemKind {
    /// Whether an item of this kind may live in `container`.
    pub fn fits(&self, container: &ContainerRef) -> bool {
        matches!(
            (self, container),
            (ItemKind::List, ContainerRef::Board(_)) | (ItemKind::Card, ContainerRef::List(_))
        )
    }
}

/// Authoritative item shape exchanged with peers and the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: Uuid,
    pub kind: ItemKind,
    pub container: ContainerRef,
    pub position: f64,
    pub title: String,
    pub metadata: BTreeMap<String, String>,
}

/// Item that does not have a server id yet (payload of a create).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub kind: ItemKind,
    pub container: ContainerRef,
    pub position: f64,
    pub title: String,
    pub metadata: BTreeMap<String, String>,
}

impl NewItem {
    pub fn into_record(self, id: Uuid) -> ItemRecord {
        ItemRecord {
            id,
            kind: self.kind,
            container: self.container,
            position: self.position,
            title: self.title,
            metadata: self.metadata,
        }
    }
}

/// One entry of a bulk reposition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: Uuid,
    pub position: f64,
}

/// Field changes for an update. Position and container are never part of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub title: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ItemPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            metadata: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.metadata.is_none()
    }
}

/// Locally known item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub kind: ItemKind,
    pub container: ContainerId,
    pub position: f64,
    pub title: String,
    pub metadata: BTreeMap<String, String>,
}

impl Item {
    pub fn from_record(record: ItemRecord) -> Self {
        Self {
            id: ItemId::Server(record.id),
            kind: record.kind,
            container: record.container.into(),
            position: record.position,
            title: record.title,
            metadata: record.metadata,
        }
    }

    /// Wire form of this item; `None` if it or its parent is still speculative.
    pub fn to_record(&self) -> Option<ItemRecord> {
        Some(ItemRecord {
            id: self.id.server()?,
            kind: self.kind,
            container: self.container.to_wire()?,
            position: self.position,
            title: self.title.clone(),
            metadata: self.metadata.clone(),
        })
    }

    pub fn apply_patch(&mut self, patch: &ItemPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = metadata.clone();
        }
    }

    /// Copy every field except placement (container and position) from `other`.
    pub fn merge_fields(&mut self, other: &Item) {
        self.kind = other.kind;
        self.title = other.title.clone();
        self.metadata = other.metadata.clone();
    }
}

/// Total display order of a collection: ascending position, ties broken by id.
pub fn display_order(a: &Item, b: &Item) -> Ordering {
    a.position
        .total_cmp(&b.position)
        .then_with(|| a.id.cmp(&b.id))
}

/// Temporary-id indirection table.
#[derive(Debug, Default)]
pub struct TempIds {
    next: u64,
    resolved: HashMap<TempId, Uuid>,
}

impl TempIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a fresh temporary id.
    pub fn allocate(&mut self) -> TempId {
        self.next += 1;
        TempId(self.next)
    }

    /// Record that `temp` became `server` after confirmation.
    pub fn resolve(&mut self, temp: TempId, server: Uuid) {
        self.resolved.insert(temp, server);
    }

    /// Follow a temporary id to its server id when one is known.
    pub fn lookup(&self, id: ItemId) -> ItemId {
        match id {
            ItemId::Temp(t) => self
                .resolved
                .get(&t)
                .map_or(id, |server| ItemId::Server(*server)),
            server => server,
        }
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }
}

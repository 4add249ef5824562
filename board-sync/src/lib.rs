//! # board-sync: Real-time ordering and sync engine for shared boards
//!
//! Keeps ordered collections (lists on a board, cards in a list) consistent
//! across every session viewing the same board, with optimistic local
//! updates and rollback.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐    WebSocket     ┌──────────────────────┐
//! │ SyncClient           │ ◄──────────────► │ SyncServer           │
//! │  └─ Reconciler       │   Binary Proto   │  └─ RoomHub          │
//! │      ├─ Optimistic-  │                  │      ├─ Session-     │
//! │      │  Cache        │                  │      │  Registry     │
//! │      └─ PresenceView │                  │      └─ EventBus     │
//! └──────────┬───────────┘                  └──────────────────────┘
//!            │ persist / fetch_board
//!            ▼
//! ┌──────────────────────┐
//! │ Persistence          │
//! │ (authoritative)      │
//! └──────────────────────┘
//! ```
//!
//! The server relays intents as room events; authoritative writes go from
//! each client's [`Reconciler`] to the [`Persistence`] collaborator.
//!
//! ## Modules
//!
//! - [`model`]: Items, containers and typed ids
//! - [`position`]: Fractional ordering keys and rebalancing
//! - [`protocol`]: Binary wire protocol (bincode-encoded frames)
//! - [`registry`]: Session ↔ room membership
//! - [`broadcast`]: Per-room ordered fan-out
//! - [`server`]: WebSocket room server
//! - [`client`]: WebSocket client with reconnect
//! - [`cache`]: Optimistic mutation cache
//! - [`controller`]: Gesture reconciliation
//! - [`presence`]: Client-side presence view
//! - [`persistence`] / [`auth`]: Collaborator traits

pub mod auth;
pub mod backoff;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod controller;
pub mod model;
pub mod persistence;
pub mod position;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, Identity, StaticTokenAuthenticator};
pub use backoff::{ReconnectPolicy, ReconnectState, Reconnector};
pub use broadcast::{BroadcastStats, Envelope, EventBus, RoomChannel};
pub use cache::{ClientOperation, OpKind, OpStatus, OptimisticCache, RemoteEffect};
pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionState, RoomSubscription, SyncClient};
pub use controller::{GesturePhase, Notification, Outcome, ReconcileError, Reconciler, RoomLink};
pub use model::{ContainerId, ContainerRef, Item, ItemId, ItemKind, ItemPatch, ItemRecord, Placement};
pub use persistence::{CanonicalState, MemoryPersistence, PersistError, PersistRequest, Persistence};
pub use position::{AllocationExhausted, AllocatorConfig};
pub use presence::PresenceView;
pub use protocol::{Activity, Audience, ClientFrame, ProtocolError, ServerEvent, ServerFrame};
pub use registry::SessionRegistry;
pub use server::{RoomHub, ServerConfig, ServerStats, SyncServer};

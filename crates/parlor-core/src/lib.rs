//! # parlor-core
//!
//! Presence tracking, room management and message routing for the Parlor
//! chat server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Session** - Registry of live connections and their current room
//! - **Room** - Directory of owner-managed rooms
//! - **Engine** - Validates events, applies transitions, routes messages
//! - **Outbox** - Per-connection outbound queues
//! - **Storage / Media / Auth** - Contracts for the external collaborators
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Gateway    │────▶│   Engine    │────▶│  Storage    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲              │         │
//!        │              ▼         ▼
//! ┌─────────────┐  ┌──────────┐ ┌──────────┐
//! │   Outbox    │◀─│ Sessions │ │  Rooms   │
//! └─────────────┘  └──────────┘ └──────────┘
//! ```

pub mod auth;
pub mod engine;
pub mod identity;
pub mod media;
pub mod message;
pub mod outbox;
pub mod room;
pub mod session;
pub mod storage;

pub use auth::{TokenError, TokenIssuer};
pub use engine::{ChatError, ConnectionState, Engine, EngineConfig, EngineStats, Flow, NewRoom};
pub use identity::{Identity, PeerInfo, UserId};
pub use media::{FsMediaStore, MediaError, MediaStore};
pub use message::{Envelope, Recipient, Scope};
pub use outbox::{OutboundReceiver, Outbox};
pub use room::{Room, RoomDirectory, RoomError, RoomId};
pub use session::{ConnectionId, Session, SessionError, SessionRegistry};
pub use storage::{
    MemoryStorage, NewAccount, PasswordHasher, PresenceAction, RoomStatePatch, Storage,
    StorageError,
};

//! Roomseal Session Engine
//!
//! End-to-end encrypted session management for a client device: a long-term
//! identity with its one-time prekeys, pairwise sessions with other devices,
//! and per-room group sessions whose keys are distributed over those pairwise
//! sessions.
//!
//! # Architecture
//!
//! ```text
//! Identity ──publish──► Homeserver (device keys + one-time prekeys)
//!    │
//!    ▼
//! SessionEstablisher
//!    ├── PeerSessionStore     one pairwise session per device identity key
//!    ├── GroupSession         outbound, one per room
//!    └── InboundGroupSession  received room keys, by session id
//!    │
//!    ▼
//! Encryptor ──► room event content
//! ```
//!
//! The engine is synchronous and single threaded. Time and randomness come
//! from an [`Environment`], server calls go through [`Homeserver`], and
//! encrypted identity pickles go to a [`PickleStore`]. Tests drive all three
//! deterministically.
//!
//! # Trust
//!
//! A remote device is used only after its self-signed key bundle verifies,
//! and a claimed one-time prekey only after its signature by that device
//! verifies. Devices that fail are skipped and reported, never encrypted to.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod device;
pub mod encryptor;
pub mod env;
pub mod error;
pub mod establisher;
pub mod group_session;
pub mod identity;
pub mod ids;
pub mod peer_store;
pub mod system_env;
pub mod transport;
pub mod wire;

pub use config::{EngineConfig, RotationPolicy};
pub use device::{DeviceDirectory, RemoteDevice, RoomMember};
pub use encryptor::Encryptor;
pub use env::Environment;
pub use error::{EngineError, GroupSessionError, IdentityError};
pub use establisher::{
    DecryptedRoomEvent, DecryptedToDevice, EstablishReport, RoomState, SessionEstablisher,
    SkipReason, SkippedDevice,
};
pub use group_session::{GroupSession, InboundGroupSession};
pub use identity::{Identity, IdentityKeys, OneTimePrekeyBudget, PublishResult};
pub use ids::{DeviceId, RoomId, UserId};
pub use peer_store::{PeerKey, PeerSession, PeerSessionError, PeerSessionStore, StoreError};
pub use system_env::SystemEnv;
pub use transport::{Homeserver, PickleStore, TransportError};

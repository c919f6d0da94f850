//! Deterministic simulation harness for roomseal.
//!
//! In-memory implementations of the engine's collaborators: a seeded
//! [`SimEnv`] with a virtual clock, a [`SimHomeserver`] with per-request fault
//! injection, and a [`MemoryPickleStore`]. [`SimDevice`] wires them into a
//! complete client device so scenario tests read as a conversation between
//! devices.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod pickle_store;
pub mod sim_device;
pub mod sim_env;
pub mod sim_server;

pub use pickle_store::MemoryPickleStore;
pub use sim_device::SimDevice;
pub use sim_env::{SimEnv, SimInstant};
pub use sim_server::{SimHomeserver, SimSession, ToDeviceEvent};

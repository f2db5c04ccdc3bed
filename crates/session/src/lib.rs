//! Netphys Session
//!
//! The coordination layer of the networked physics runtime: a lobby /
//! handshake / in-game state machine over a peer transport, typed event
//! envelopes with session-relative timestamps, and the physics synchronizer
//! that keeps a shared [`ObstacleWorld`] aligned across peers.
//!
//! The intended loop: the host application calls
//! [`NetEventController::update_net`] once per fixed tick, steps the world,
//! and drains custom events with [`NetEventController::pop_in_event`].
//!
//! [`ObstacleWorld`]: netphys_core::ObstacleWorld

pub mod config;
pub mod controller;
pub mod physics;
pub mod transport;

pub use config::{ConfigError, IceServerConfig, LobbyConfig, NetConfig};
pub use controller::{NetEventController, SessionStatus};
pub use physics::{LinkFn, NetPhysicsController, SyncStats, SyncType, TargetParam};
pub use transport::{memory::MemoryTransport, Transport, TransportState};

//! Netphys Protocol
//!
//! Wire-level event types exchanged between peers during a session.
//! Uses a fixed big-endian binary encoding for minimal bandwidth and
//! byte-for-byte compatibility across platforms.

pub mod event;
pub mod game_state;
pub mod phys_obj;
pub mod phys_sync;
pub mod serialize;

pub use event::{DecodeError, EventRegistry, NetEvent, ReceivedEvent};
pub use game_state::{GameStateEvent, GameStateKind};
pub use phys_obj::{PhysObjEvent, PhysObjKind};
pub use phys_sync::{ObjSnapshot, PhysSyncEvent};
pub use serialize::{Deserializer, Serializer};

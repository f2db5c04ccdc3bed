//! The peer transport seam.
//!
//! The runtime drives any reliable-ordered message channel that can be
//! expressed as this trait: a lobby that brokers rooms, per-peer delivery,
//! broadcast, and a polled receive. [`memory::MemoryTransport`] is the
//! in-process implementation used for tests and local sessions; a WebRTC or
//! socket transport plugs in the same way.

use crate::config::NetConfig;

pub mod memory;

/// Connection lifecycle as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Still negotiating with the lobby.
    Negotiating,
    /// Connected to a room, waiting for the session to start.
    Connected,
    /// The room is locked and the session is running.
    InSession,
    /// The room refused us (full or locked).
    Denied,
    /// The connection was torn down.
    Disconnected,
    /// The connection attempt failed outright.
    Failed,
    /// The requested room does not exist.
    Invalid,
    /// Peer and lobby disagree on the API version.
    Mismatched,
}

impl TransportState {
    /// True for every terminal error state.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::Denied | Self::Disconnected | Self::Failed | Self::Invalid | Self::Mismatched
        )
    }
}

/// A reliable-ordered peer connection with a lobby/room directory.
///
/// Messages from a given sender must be delivered in send order. A
/// transport may loop a peer's own messages back; those copies must carry
/// an empty sender ID so the runtime can tell them apart.
pub trait Transport {
    /// Opens a connection: hosts pass `None` and get a fresh room, clients
    /// pass the room ID to join.
    fn open(config: &NetConfig, room: Option<&str>) -> Self
    where
        Self: Sized;

    fn close(&mut self);

    /// Locks the room and moves every member to [`TransportState::InSession`].
    fn start_session(&mut self);

    fn state(&self) -> TransportState;

    /// The connected room's ID.
    fn room(&self) -> String;

    /// Peer IDs in join order; the room creator comes first.
    fn players(&self) -> Vec<String>;

    fn num_players(&self) -> usize;

    fn send_to(&mut self, peer: &str, data: Vec<u8>);

    fn broadcast(&mut self, data: Vec<u8>);

    /// Drains every pending message, invoking the handler with the sender's
    /// ID (empty for own loopback copies) and the payload, in arrival order.
    fn receive(&mut self, handler: &mut dyn FnMut(&str, &[u8]));
}

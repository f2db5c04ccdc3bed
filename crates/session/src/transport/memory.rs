//! In-process transport backed by a global lobby directory.
//!
//! Every distinct lobby address gets its own directory of rooms, so tests
//! that use unique addresses are fully isolated while sharing one process.
//! Delivery is synchronous: `send_to`/`broadcast` push straight into the
//! receivers' inboxes, and a peer's own copy comes back with an empty
//! sender ID.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::config::NetConfig;
use crate::transport::{Transport, TransportState};

static LOBBIES: Lazy<Mutex<HashMap<String, Lobby>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Default)]
struct Lobby {
    next_room: u32,
    next_peer: u32,
    rooms: HashMap<String, Room>,
}

struct Room {
    members: Vec<Member>,
    max_players: usize,
    locked: bool,
    in_session: bool,
    /// Set when the room creator leaves; remaining members read Disconnected.
    closed: bool,
}

struct Member {
    id: String,
    inbox: VecDeque<(String, Vec<u8>)>,
}

/// In-memory loopback transport. See the module docs.
pub struct MemoryTransport {
    lobby_key: String,
    room_id: String,
    peer_id: String,
    /// Terminal state reached during `open` (room missing/full) or `close`.
    local_state: Option<TransportState>,
}

impl MemoryTransport {
    fn with_room<R>(&self, f: impl FnOnce(&mut Room) -> R) -> Option<R> {
        let mut lobbies = LOBBIES.lock().unwrap();
        lobbies
            .get_mut(&self.lobby_key)
            .and_then(|lobby| lobby.rooms.get_mut(&self.room_id))
            .map(f)
    }
}

impl Transport for MemoryTransport {
    fn open(config: &NetConfig, room: Option<&str>) -> Self {
        let lobby_key = config.lobby_key();
        let mut lobbies = LOBBIES.lock().unwrap();
        let lobby = lobbies.entry(lobby_key.clone()).or_default();

        lobby.next_peer += 1;
        let peer_id = format!("peer-{}", lobby.next_peer);

        match room {
            None => {
                lobby.next_room += 1;
                let room_id = format!("{:05}", 10000 + lobby.next_room);
                lobby.rooms.insert(
                    room_id.clone(),
                    Room {
                        members: vec![Member {
                            id: peer_id.clone(),
                            inbox: VecDeque::new(),
                        }],
                        max_players: config.max_players as usize,
                        locked: false,
                        in_session: false,
                        closed: false,
                    },
                );
                debug!(room = %room_id, peer = %peer_id, "opened room");
                Self {
                    lobby_key,
                    room_id,
                    peer_id,
                    local_state: None,
                }
            }
            Some(room_id) => {
                let state = match lobby.rooms.get_mut(room_id) {
                    None => Some(TransportState::Invalid),
                    Some(room) if room.locked || room.members.len() >= room.max_players => {
                        Some(TransportState::Denied)
                    }
                    Some(room) => {
                        room.members.push(Member {
                            id: peer_id.clone(),
                            inbox: VecDeque::new(),
                        });
                        None
                    }
                };
                debug!(room = %room_id, peer = %peer_id, denied = state.is_some(), "joined room");
                Self {
                    lobby_key,
                    room_id: room_id.to_string(),
                    peer_id,
                    local_state: state,
                }
            }
        }
    }

    fn close(&mut self) {
        if self.local_state == Some(TransportState::Disconnected) {
            return;
        }
        let mut lobbies = LOBBIES.lock().unwrap();
        if let Some(lobby) = lobbies.get_mut(&self.lobby_key) {
            let mut drop_room = false;
            if let Some(room) = lobby.rooms.get_mut(&self.room_id) {
                let was_creator = room.members.first().is_some_and(|m| m.id == self.peer_id);
                room.members.retain(|m| m.id != self.peer_id);
                if was_creator {
                    room.closed = true;
                }
                drop_room = room.members.is_empty();
            }
            if drop_room {
                lobby.rooms.remove(&self.room_id);
            }
        }
        self.local_state = Some(TransportState::Disconnected);
    }

    fn start_session(&mut self) {
        self.with_room(|room| {
            room.locked = true;
            room.in_session = true;
        });
    }

    fn state(&self) -> TransportState {
        if let Some(state) = self.local_state {
            return state;
        }
        self.with_room(|room| {
            if room.closed {
                TransportState::Disconnected
            } else if room.in_session {
                TransportState::InSession
            } else {
                TransportState::Connected
            }
        })
        .unwrap_or(TransportState::Disconnected)
    }

    fn room(&self) -> String {
        self.room_id.clone()
    }

    fn players(&self) -> Vec<String> {
        self.with_room(|room| room.members.iter().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }

    fn num_players(&self) -> usize {
        self.with_room(|room| room.members.len()).unwrap_or(0)
    }

    fn send_to(&mut self, peer: &str, data: Vec<u8>) {
        let sender = self.peer_id.clone();
        self.with_room(|room| {
            if let Some(member) = room.members.iter_mut().find(|m| m.id == peer) {
                let source = if member.id == sender {
                    String::new()
                } else {
                    sender
                };
                member.inbox.push_back((source, data));
            }
        });
    }

    fn broadcast(&mut self, data: Vec<u8>) {
        let sender = self.peer_id.clone();
        self.with_room(|room| {
            for member in &mut room.members {
                let source = if member.id == sender {
                    String::new()
                } else {
                    sender.clone()
                };
                member.inbox.push_back((source, data.clone()));
            }
        });
    }

    fn receive(&mut self, handler: &mut dyn FnMut(&str, &[u8])) {
        let pending = self
            .with_room(|room| {
                room.members
                    .iter_mut()
                    .find(|m| m.id == self.peer_id)
                    .map(|m| std::mem::take(&mut m.inbox))
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        for (source, data) in pending {
            handler(&source, &data);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(lobby: &str) -> NetConfig {
        NetConfig::new(lobby, 9000, 4)
    }

    #[test]
    fn host_opens_a_room_and_clients_join() {
        let config = config("memory-open");
        let host = MemoryTransport::open(&config, None);
        assert_eq!(host.state(), TransportState::Connected);

        let room = host.room();
        let client = MemoryTransport::open(&config, Some(&room));
        assert_eq!(client.state(), TransportState::Connected);

        assert_eq!(host.num_players(), 2);
        assert_eq!(host.players(), client.players());
        assert_eq!(host.players()[0], "peer-1"); // creator first
    }

    #[test]
    fn unknown_room_is_invalid() {
        let config = config("memory-invalid");
        let client = MemoryTransport::open(&config, Some("00000"));
        assert_eq!(client.state(), TransportState::Invalid);
    }

    #[test]
    fn locked_room_denies_late_joiners() {
        let config = config("memory-locked");
        let mut host = MemoryTransport::open(&config, None);
        let room = host.room();
        host.start_session();
        assert_eq!(host.state(), TransportState::InSession);

        let late = MemoryTransport::open(&config, Some(&room));
        assert_eq!(late.state(), TransportState::Denied);
    }

    #[test]
    fn full_room_denies_joiners() {
        let config = NetConfig::new("memory-full", 9000, 1);
        let host = MemoryTransport::open(&config, None);
        let late = MemoryTransport::open(&config, Some(&host.room()));
        assert_eq!(late.state(), TransportState::Denied);
    }

    #[test]
    fn broadcast_loops_back_with_empty_sender() {
        let config = config("memory-loopback");
        let mut host = MemoryTransport::open(&config, None);
        let mut client = MemoryTransport::open(&config, Some(&host.room()));

        host.broadcast(vec![1, 2, 3]);

        let mut got = Vec::new();
        host.receive(&mut |source, data| got.push((source.to_string(), data.to_vec())));
        assert_eq!(got, vec![(String::new(), vec![1, 2, 3])]);

        let mut got = Vec::new();
        client.receive(&mut |source, data| got.push((source.to_string(), data.to_vec())));
        assert_eq!(got, vec![("peer-1".to_string(), vec![1, 2, 3])]);
    }

    #[test]
    fn send_to_targets_one_peer() {
        let config = config("memory-sendto");
        let mut host = MemoryTransport::open(&config, None);
        let mut client = MemoryTransport::open(&config, Some(&host.room()));
        let peers = host.players();

        host.send_to(&peers[1], vec![7]);

        let mut host_got = 0;
        host.receive(&mut |_, _| host_got += 1);
        assert_eq!(host_got, 0);

        let mut got = Vec::new();
        client.receive(&mut |source, data| got.push((source.to_string(), data.to_vec())));
        assert_eq!(got, vec![("peer-1".to_string(), vec![7])]);
    }

    #[test]
    fn creator_leaving_disconnects_the_room() {
        let config = config("memory-leave");
        let mut host = MemoryTransport::open(&config, None);
        let client = MemoryTransport::open(&config, Some(&host.room()));

        host.close();
        assert_eq!(host.state(), TransportState::Disconnected);
        assert_eq!(client.state(), TransportState::Disconnected);
    }

    #[test]
    fn delivery_preserves_send_order() {
        let config = config("memory-order");
        let mut host = MemoryTransport::open(&config, None);
        let mut client = MemoryTransport::open(&config, Some(&host.room()));

        for n in 0..5u8 {
            host.broadcast(vec![n]);
        }
        let mut got = Vec::new();
        client.receive(&mut |_, data| got.push(data[0]));
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }
}

//! The session controller: lobby, handshake, and event plumbing.
//!
//! One controller per peer. The host application calls [`update_net`] once
//! per fixed tick; everything else (handshake, snapshot scheduling, event
//! delivery) hangs off that pump.
//!
//! Wire envelope: `u8 tag || u64 session_tick || payload`. The session tick
//! is relative to the tick the game started on, so peers that launched at
//! different wall-clock times still agree on event timestamps.
//!
//! [`update_net`]: NetEventController::update_net

use std::collections::VecDeque;

use tracing::{debug, info, trace, warn};

use netphys_core::ObstacleWorld;
use netphys_protocol::{
    Deserializer, EventRegistry, GameStateEvent, GameStateKind, NetEvent, PhysObjEvent,
    PhysSyncEvent, ReceivedEvent, Serializer,
};

use crate::config::NetConfig;
use crate::physics::{LinkFn, NetPhysicsController, SyncType};
use crate::transport::{Transport, TransportState};

/// Envelope prefix: one tag byte plus the 64-bit session tick.
const MIN_MSG_LENGTH: usize = 1 + 8;

/// Session lifecycle. Transitions are one-way within a session; the only
/// way back is `NetError -> Idle` via [`NetEventController::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No connection requested.
    Idle,
    /// Connecting to the lobby.
    Connecting,
    /// Connected to a room.
    Connected,
    /// Session started; the host is handing out short UIDs.
    Handshake,
    /// Locally ready, waiting for everyone else.
    Ready,
    /// The game is running.
    InGame,
    /// The transport failed; disconnect to recover.
    NetError,
}

/// Network controller for a multiplayer physics session.
pub struct NetEventController<T: Transport> {
    config: NetConfig,
    transport: Option<T>,
    status: SessionStatus,
    room_id: String,
    is_host: bool,
    /// Host only: ready marks received during the handshake.
    num_ready: usize,
    /// Local fixed-tick counter; one `update_net` call advances it by one.
    tick: u64,
    /// Absolute tick at which `GAME_START` arrived.
    start_game_tick: u64,
    short_uid: u32,
    registry: EventRegistry,
    in_queue: VecDeque<ReceivedEvent>,
    out_queue: Vec<Box<dyn NetEvent>>,
    physics: Option<NetPhysicsController>,
}

impl<T: Transport> NetEventController<T> {
    /// Creates a controller for the given lobby config. The built-in event
    /// types are registered here, in a fixed order, so their tags are
    /// stable across peers: `GameStateEvent` = 0, `PhysSyncEvent` = 1,
    /// `PhysObjEvent` = 2. Custom types attached later get the following
    /// tags in attach order.
    pub fn new(config: NetConfig) -> Self {
        let mut registry = EventRegistry::new();
        registry.register::<GameStateEvent>();
        registry.register::<PhysSyncEvent>();
        registry.register::<PhysObjEvent>();
        Self {
            config,
            transport: None,
            status: SessionStatus::Idle,
            room_id: String::new(),
            is_host: false,
            num_ready: 0,
            tick: 0,
            start_game_tick: 0,
            short_uid: 0,
            registry,
            in_queue: VecDeque::new(),
            out_queue: Vec::new(),
            physics: None,
        }
    }

    // --- Introspection ---

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Short UID assigned by the host; zero until the handshake delivers
    /// one. Required before physics can be enabled.
    pub fn short_uid(&self) -> u32 {
        self.short_uid
    }

    pub fn num_players(&self) -> usize {
        self.transport.as_ref().map_or(1, Transport::num_players)
    }

    /// Ticks since the game started. Peers hold similar values regardless
    /// of when their apps launched.
    pub fn session_tick(&self) -> u64 {
        self.tick.saturating_sub(self.start_game_tick)
    }

    // --- Connection lifecycle ---

    /// Connects to a new room as host. Returns false if the transport is
    /// already in an error state.
    pub fn connect_as_host(&mut self) -> bool {
        if self.status == SessionStatus::NetError {
            self.disconnect();
        }
        self.is_host = true;
        if self.status == SessionStatus::Idle {
            self.status = SessionStatus::Connecting;
            self.transport = Some(T::open(&self.config, None));
            info!("connecting as host");
        }
        self.check_connection()
    }

    /// Connects to an existing room as client.
    pub fn connect_as_client(&mut self, room_id: &str) -> bool {
        if self.status == SessionStatus::NetError {
            self.disconnect();
        }
        self.is_host = false;
        if self.status == SessionStatus::Idle {
            self.status = SessionStatus::Connecting;
            self.transport = Some(T::open(&self.config, Some(room_id)));
            info!(room = %room_id, "connecting as client");
        }
        self.room_id = room_id.to_string();
        self.check_connection()
    }

    /// Tears the session down and returns to `Idle`. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.status = SessionStatus::Idle;
        self.room_id.clear();
        self.is_host = false;
        self.num_ready = 0;
        self.start_game_tick = 0;
        self.short_uid = 0;
        self.in_queue.clear();
        self.out_queue.clear();
        self.physics = None;
        info!("disconnected");
    }

    /// Host only: locks the room and starts the session, kicking off the
    /// handshake. Does nothing unless the session is `Connected`.
    pub fn start_game(&mut self) {
        debug_assert!(self.is_host, "only the host starts the game");
        if self.status == SessionStatus::Connected {
            if let Some(transport) = self.transport.as_mut() {
                transport.start_session();
            }
        }
    }

    /// Marks this peer ready for game start. Valid once the handshake has
    /// delivered a short UID; returns whether the mark was taken.
    pub fn mark_ready(&mut self) -> bool {
        if self.status == SessionStatus::Handshake && self.short_uid != 0 {
            self.status = SessionStatus::Ready;
            self.push_out_event(GameStateEvent::client_ready());
            return true;
        }
        false
    }

    // --- Physics ---

    /// Enables physics synchronization over `world`. Requires a short UID,
    /// i.e. a completed handshake. The optional link function is invoked
    /// whenever a replicated creation produces a render node.
    pub fn enable_physics(&mut self, mut world: ObstacleWorld, link_fn: Option<LinkFn>) {
        debug_assert!(
            self.short_uid != 0,
            "a short UID must be assigned before enabling physics"
        );
        self.registry.register::<PhysSyncEvent>();
        self.registry.register::<PhysObjEvent>();
        world.set_short_uid(self.short_uid);
        world.set_host(self.is_host);
        self.physics = Some(NetPhysicsController::new(world, self.is_host, link_fn));
        info!(uid = self.short_uid, "physics synchronization enabled");
    }

    pub fn disable_physics(&mut self) {
        self.physics = None;
    }

    pub fn physics(&self) -> Option<&NetPhysicsController> {
        self.physics.as_ref()
    }

    pub fn physics_mut(&mut self) -> Option<&mut NetPhysicsController> {
        self.physics.as_mut()
    }

    // --- Event queues ---

    /// Attaches a custom event type. All peers must attach the same types
    /// in the same order.
    pub fn attach_event_type<E: NetEvent + Default>(&mut self) {
        self.registry.register::<E>();
    }

    /// Queues an event for broadcast at the end of the current tick.
    pub fn push_out_event(&mut self, event: impl NetEvent) {
        self.out_queue.push(Box::new(event));
    }

    /// True when the head of the inbound queue is due: its event timestamp
    /// is at or before our current session tick.
    pub fn is_in_available(&self) -> bool {
        self.in_queue
            .front()
            .is_some_and(|event| event.event_tick <= self.session_tick())
    }

    /// Pops the next custom inbound event, due or not.
    pub fn pop_in_event(&mut self) -> Option<ReceivedEvent> {
        self.in_queue.pop_front()
    }

    // --- The tick pump ---

    /// Single per-tick pump. Checks the connection, packs and schedules
    /// physics events, drains the transport, and broadcasts everything
    /// queued this tick.
    pub fn update_net(&mut self) {
        self.tick += 1;
        if self.transport.is_none() {
            return;
        }
        self.check_connection();

        if self.status == SessionStatus::InGame {
            if let Some(physics) = self.physics.as_mut() {
                if self.is_host {
                    physics.pack_phys_sync(SyncType::FullSync);
                }
                physics.fixed_update();
                self.out_queue.extend(physics.take_out_events());
            }
        }

        self.process_received_data();
        self.send_queued_out_data();
    }

    /// Reconciles our status with the transport state and runs the host
    /// side of the handshake. Returns false once the transport reports a
    /// terminal error.
    fn check_connection(&mut self) -> bool {
        let Some(transport) = self.transport.as_ref() else {
            return false;
        };
        let state = transport.state();

        if state == TransportState::Connected {
            if matches!(self.status, SessionStatus::Idle | SessionStatus::Connecting) {
                self.status = SessionStatus::Connected;
                info!("connected to room");
            }
            if self.is_host {
                self.room_id = transport.room();
            }
            true
        } else if self.status == SessionStatus::Connected && state == TransportState::InSession {
            self.status = SessionStatus::Handshake;
            if self.is_host {
                let players = self.transport.as_ref().map(Transport::players).unwrap_or_default();
                info!(players = players.len(), "session started, assigning short UIDs");
                for (index, player) in players.iter().enumerate() {
                    let assign = GameStateEvent::assign_uid(index as u32 + 1);
                    if let Some(data) = self.wrap(&assign) {
                        if let Some(transport) = self.transport.as_mut() {
                            transport.send_to(player, data);
                        }
                    }
                }
            }
            true
        } else if self.status == SessionStatus::Ready
            && self.is_host
            && self.num_ready == self.num_players()
        {
            debug!(ready = self.num_ready, "all peers ready, broadcasting game start");
            self.push_out_event(GameStateEvent::game_start());
            true
        } else if state == TransportState::Negotiating {
            self.status = SessionStatus::Connecting;
            true
        } else if state.is_error() {
            self.status = SessionStatus::NetError;
            false
        } else {
            true
        }
    }

    /// Drains the transport, unwrapping and routing each packet in arrival
    /// order. The receive callback runs synchronously inside this call.
    fn process_received_data(&mut self) {
        let mut inbound: Vec<(String, Vec<u8>)> = Vec::new();
        if let Some(transport) = self.transport.as_mut() {
            transport.receive(&mut |source, data| {
                inbound.push((source.to_string(), data.to_vec()));
            });
        }
        for (source, data) in inbound {
            if let Some(event) = self.unwrap(&data, &source) {
                self.process_received_event(event);
            }
        }
    }

    /// Routes one inbound event: game-state events drive the state machine,
    /// physics events go to the synchronizer while in game, everything else
    /// is queued for the application.
    fn process_received_event(&mut self, received: ReceivedEvent) {
        if let Some(game) = received.get::<GameStateEvent>() {
            let game = game.clone();
            self.process_game_state_event(&game, &received.source_id);
        } else if self.status == SessionStatus::InGame {
            if let Some(sync) = received.get::<PhysSyncEvent>() {
                if let Some(physics) = self.physics.as_mut() {
                    physics.process_phys_sync_event(sync, &received.source_id);
                }
            } else if let Some(obj) = received.get::<PhysObjEvent>() {
                if let Some(physics) = self.physics.as_mut() {
                    physics.process_phys_obj_event(obj, &received.source_id);
                }
            } else {
                self.in_queue.push_back(received);
            }
        }
    }

    fn process_game_state_event(&mut self, event: &GameStateEvent, source: &str) {
        if self.status == SessionStatus::Handshake && event.kind() == GameStateKind::UidAssign {
            self.short_uid = event.short_uid();
            info!(uid = self.short_uid, "short UID assigned");
        }
        if self.status == SessionStatus::Ready && event.kind() == GameStateKind::GameStart {
            self.status = SessionStatus::InGame;
            self.start_game_tick = self.tick;
            info!(tick = self.tick, "game started");
        }
        if self.is_host && event.kind() == GameStateKind::ClientReady {
            self.num_ready += 1;
            debug!(%source, ready = self.num_ready, "peer ready");
        }
    }

    /// Broadcasts the outbound queue in insertion order, then clears it.
    fn send_queued_out_data(&mut self) {
        if self.out_queue.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.out_queue);
        let mut payloads = Vec::with_capacity(events.len());
        for event in &events {
            if let Some(data) = self.wrap(event.as_ref()) {
                payloads.push(data);
            }
        }
        if let Some(transport) = self.transport.as_mut() {
            for data in payloads {
                transport.broadcast(data);
            }
        }
    }

    /// Wraps an event in the session envelope. Wrapping a type that was
    /// never attached is a caller bug; in release the event is dropped.
    fn wrap(&self, event: &dyn NetEvent) -> Option<Vec<u8>> {
        let tag = self.registry.tag_of(event);
        debug_assert!(tag.is_some(), "wrapping an unregistered event type");
        let Some(tag) = tag else {
            warn!("dropping outbound event of unregistered type");
            return None;
        };
        let mut s = Serializer::new();
        s.write_byte(tag);
        s.write_u64(self.session_tick());
        s.write_bytes(&event.serialize());
        Some(s.finish())
    }

    /// Unwraps an inbound packet into a typed event with metadata. Packets
    /// that are too short, carry unknown tags, or fail to decode are
    /// dropped: protocol drift never takes the session down.
    fn unwrap(&self, data: &[u8], source: &str) -> Option<ReceivedEvent> {
        if data.len() < MIN_MSG_LENGTH {
            trace!(len = data.len(), "discarding undersized packet");
            return None;
        }
        let mut d = Deserializer::new(data);
        let tag = d.read_byte();
        if !self.registry.is_known_tag(tag) {
            trace!(tag, "discarding packet with unknown event tag");
            return None;
        }
        let event_tick = d.read_u64();
        let mut event = self.registry.blank(tag)?;
        if let Err(error) = event.deserialize(d.remaining()) {
            debug!(%error, tag, "discarding undecodable event");
            return None;
        }
        Some(ReceivedEvent {
            event,
            source_id: source.to_string(),
            event_tick,
            receive_tick: self.session_tick(),
        })
    }
}

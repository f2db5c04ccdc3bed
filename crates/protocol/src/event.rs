//! The event trait and the tag registry.
//!
//! Every message crossing the wire is a [`NetEvent`]. The registry maps each
//! concrete event type to a stable one-byte tag (its registration index) and
//! can mint blank instances from a tag for deserialization. Peers that share
//! source and register types in the same order therefore agree on tags
//! without negotiation.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use thiserror::Error;

/// Errors raised while decoding an event payload. Undecodable events are
/// dropped by the session layer; they never tear down a connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown event subtype {0}")]
    UnknownSubtype(u32),

    #[error("payload too short: {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
}

/// A message that can be sent to peers.
///
/// `serialize`/`deserialize` cover the payload only; sender and timestamps
/// travel in the session envelope and are surfaced via [`ReceivedEvent`].
pub trait NetEvent: Any {
    fn serialize(&self) -> Vec<u8>;

    /// Overwrites this (blank) event from a payload.
    fn deserialize(&mut self, data: &[u8]) -> Result<(), DecodeError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An inbound event together with the envelope metadata the session layer
/// recorded when it arrived.
pub struct ReceivedEvent {
    pub event: Box<dyn NetEvent>,
    /// Peer that sent the event. Empty for loopback copies of our own
    /// messages.
    pub source_id: String,
    /// Sender's session tick when the event was sent.
    pub event_tick: u64,
    /// Our session tick when the event arrived.
    pub receive_tick: u64,
}

impl ReceivedEvent {
    /// Downcasts to a concrete event type.
    pub fn get<E: NetEvent>(&self) -> Option<&E> {
        self.event.as_any().downcast_ref::<E>()
    }

    pub fn is<E: NetEvent>(&self) -> bool {
        self.event.as_any().is::<E>()
    }
}

type EventCtor = fn() -> Box<dyn NetEvent>;

fn blank_ctor<E: NetEvent + Default>() -> Box<dyn NetEvent> {
    Box::new(E::default())
}

/// Ordered list of event prototypes; the list index is the wire tag.
#[derive(Default)]
pub struct EventRegistry {
    tags: HashMap<TypeId, u8>,
    ctors: Vec<EventCtor>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event type, returning its tag. Re-registering is a no-op
    /// that preserves the original tag.
    pub fn register<E: NetEvent + Default>(&mut self) -> u8 {
        if let Some(tag) = self.tags.get(&TypeId::of::<E>()) {
            return *tag;
        }
        debug_assert!(self.ctors.len() <= u8::MAX as usize, "event tag space exhausted");
        let tag = self.ctors.len() as u8;
        self.tags.insert(TypeId::of::<E>(), tag);
        self.ctors.push(blank_ctor::<E>);
        tag
    }

    /// Tag for a concrete event instance, if its type was registered.
    pub fn tag_of(&self, event: &dyn NetEvent) -> Option<u8> {
        self.tags.get(&event.as_any().type_id()).copied()
    }

    pub fn is_known_tag(&self, tag: u8) -> bool {
        (tag as usize) < self.ctors.len()
    }

    /// Mints a blank instance of the type registered under `tag`.
    pub fn blank(&self, tag: u8) -> Option<Box<dyn NetEvent>> {
        self.ctors.get(tag as usize).map(|ctor| ctor())
    }

    pub fn len(&self) -> usize {
        self.ctors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctors.is_empty()
    }
}

//! Session lifecycle events: UID assignment, ready marks, game start.

use std::any::Any;

use crate::event::{DecodeError, NetEvent};
use crate::serialize::{Deserializer, Serializer};

/// Subtype of a [`GameStateEvent`]. The numeric values are the wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GameStateKind {
    UidAssign = 100,
    ClientReady = 101,
    #[default]
    GameStart = 102,
    GameReset = 103,
    GamePause = 104,
    GameResume = 105,
}

impl GameStateKind {
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            100 => Some(Self::UidAssign),
            101 => Some(Self::ClientReady),
            102 => Some(Self::GameStart),
            103 => Some(Self::GameReset),
            104 => Some(Self::GamePause),
            105 => Some(Self::GameResume),
            _ => None,
        }
    }
}

/// Lifecycle message consumed by the session controller to drive its state
/// machine. Applications rarely construct these directly; the controller
/// emits them during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameStateEvent {
    kind: GameStateKind,
    short_uid: u32,
}

impl GameStateEvent {
    pub fn game_start() -> Self {
        Self {
            kind: GameStateKind::GameStart,
            short_uid: 0,
        }
    }

    pub fn client_ready() -> Self {
        Self {
            kind: GameStateKind::ClientReady,
            short_uid: 0,
        }
    }

    pub fn game_reset() -> Self {
        Self {
            kind: GameStateKind::GameReset,
            short_uid: 0,
        }
    }

    pub fn game_pause() -> Self {
        Self {
            kind: GameStateKind::GamePause,
            short_uid: 0,
        }
    }

    pub fn game_resume() -> Self {
        Self {
            kind: GameStateKind::GameResume,
            short_uid: 0,
        }
    }

    /// Host-to-one-client UID assignment. The wire format carries a single
    /// byte, so assignable UIDs top out at 255; valid UIDs start at 1.
    pub fn assign_uid(short_uid: u32) -> Self {
        Self {
            kind: GameStateKind::UidAssign,
            short_uid,
        }
    }

    pub fn kind(&self) -> GameStateKind {
        self.kind
    }

    /// The assigned short UID; zero unless this is a `UidAssign`.
    pub fn short_uid(&self) -> u32 {
        self.short_uid
    }
}

impl NetEvent for GameStateEvent {
    fn serialize(&self) -> Vec<u8> {
        let mut s = Serializer::new();
        s.write_byte(self.kind.to_u8());
        if self.kind == GameStateKind::UidAssign {
            s.write_byte(self.short_uid as u8);
        }
        s.finish()
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Truncated { got: 0, need: 1 });
        }
        let mut d = Deserializer::new(data);
        let raw = d.read_byte();
        let kind = GameStateKind::from_u8(raw)
            .ok_or(DecodeError::UnknownSubtype(raw as u32))?;
        self.kind = kind;
        self.short_uid = 0;
        if kind == GameStateKind::UidAssign {
            if data.len() < 2 {
                return Err(DecodeError::Truncated { got: 1, need: 2 });
            }
            self.short_uid = d.read_byte() as u32;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

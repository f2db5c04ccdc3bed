//! Obstacle state-change events.
//!
//! Emitted whenever game code mutates a shared obstacle (position, velocity,
//! constants, ...) and for obstacle creation, deletion, and ownership
//! transfer. One event carries one state group for one obstacle.

use std::any::Any;

use glam::Vec2;
use netphys_core::{BodyFlags, BodyParams, BodyType, ObstacleId};

use crate::event::{DecodeError, NetEvent};
use crate::serialize::{Deserializer, Serializer};

/// Common wire prefix: u32 subtype + u64 obstacle id.
const PREFIX_BYTES: usize = 4 + 8;

/// The state group an event carries.
#[derive(Debug, Clone, PartialEq)]
pub enum PhysObjKind {
    /// Create the obstacle via a registered factory; the bytes are the
    /// factory's serialized parameters.
    Creation { factory: u32, params: Vec<u8> },
    Deletion,
    BodyType(BodyType),
    Position(Vec2),
    Velocity(Vec2),
    Angle(f32),
    AngularVel(f32),
    BoolConsts(BodyFlags),
    FloatConsts(BodyParams),
    /// Sender takes ownership for `duration` ticks (0 = permanent).
    OwnerAcquire(u64),
    OwnerRelease,
}

impl PhysObjKind {
    const CREATION: u32 = 0;
    const DELETION: u32 = 1;
    const BODY_TYPE: u32 = 2;
    const POSITION: u32 = 3;
    const VELOCITY: u32 = 4;
    const ANGLE: u32 = 5;
    const ANGULAR_VEL: u32 = 6;
    const BOOL_CONSTS: u32 = 7;
    const FLOAT_CONSTS: u32 = 8;
    const OWNER_ACQUIRE: u32 = 9;
    const OWNER_RELEASE: u32 = 10;

    const fn tag(&self) -> u32 {
        match self {
            Self::Creation { .. } => Self::CREATION,
            Self::Deletion => Self::DELETION,
            Self::BodyType(_) => Self::BODY_TYPE,
            Self::Position(_) => Self::POSITION,
            Self::Velocity(_) => Self::VELOCITY,
            Self::Angle(_) => Self::ANGLE,
            Self::AngularVel(_) => Self::ANGULAR_VEL,
            Self::BoolConsts(_) => Self::BOOL_CONSTS,
            Self::FloatConsts(_) => Self::FLOAT_CONSTS,
            Self::OwnerAcquire(_) => Self::OWNER_ACQUIRE,
            Self::OwnerRelease => Self::OWNER_RELEASE,
        }
    }
}

/// A single obstacle state change.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysObjEvent {
    pub id: ObstacleId,
    pub kind: PhysObjKind,
}

impl Default for PhysObjEvent {
    fn default() -> Self {
        Self {
            id: ObstacleId::from_raw(0),
            kind: PhysObjKind::Deletion,
        }
    }
}

impl PhysObjEvent {
    pub fn creation(id: ObstacleId, factory: u32, params: Vec<u8>) -> Self {
        Self {
            id,
            kind: PhysObjKind::Creation { factory, params },
        }
    }

    pub fn deletion(id: ObstacleId) -> Self {
        Self {
            id,
            kind: PhysObjKind::Deletion,
        }
    }

    pub fn body_type(id: ObstacleId, body_type: BodyType) -> Self {
        Self {
            id,
            kind: PhysObjKind::BodyType(body_type),
        }
    }

    pub fn position(id: ObstacleId, position: Vec2) -> Self {
        Self {
            id,
            kind: PhysObjKind::Position(position),
        }
    }

    pub fn velocity(id: ObstacleId, velocity: Vec2) -> Self {
        Self {
            id,
            kind: PhysObjKind::Velocity(velocity),
        }
    }

    pub fn angle(id: ObstacleId, angle: f32) -> Self {
        Self {
            id,
            kind: PhysObjKind::Angle(angle),
        }
    }

    pub fn angular_velocity(id: ObstacleId, omega: f32) -> Self {
        Self {
            id,
            kind: PhysObjKind::AngularVel(omega),
        }
    }

    pub fn bool_consts(id: ObstacleId, flags: BodyFlags) -> Self {
        Self {
            id,
            kind: PhysObjKind::BoolConsts(flags),
        }
    }

    pub fn float_consts(id: ObstacleId, params: BodyParams) -> Self {
        Self {
            id,
            kind: PhysObjKind::FloatConsts(params),
        }
    }

    pub fn owner_acquire(id: ObstacleId, duration: u64) -> Self {
        Self {
            id,
            kind: PhysObjKind::OwnerAcquire(duration),
        }
    }

    pub fn owner_release(id: ObstacleId) -> Self {
        Self {
            id,
            kind: PhysObjKind::OwnerRelease,
        }
    }
}

impl NetEvent for PhysObjEvent {
    fn serialize(&self) -> Vec<u8> {
        let mut s = Serializer::new();
        s.write_u32(self.kind.tag());
        s.write_u64(self.id.raw());
        match &self.kind {
            PhysObjKind::Creation { factory, params } => {
                s.write_u32(*factory);
                s.write_bytes(params);
            }
            PhysObjKind::Deletion | PhysObjKind::OwnerRelease => {}
            PhysObjKind::BodyType(body_type) => s.write_u32(body_type.to_u32()),
            PhysObjKind::Position(v) | PhysObjKind::Velocity(v) => {
                s.write_f32(v.x);
                s.write_f32(v.y);
            }
            PhysObjKind::Angle(value) | PhysObjKind::AngularVel(value) => {
                s.write_f32(*value);
            }
            PhysObjKind::BoolConsts(flags) => {
                s.write_bool(flags.enabled);
                s.write_bool(flags.awake);
                s.write_bool(flags.sleep_allowed);
                s.write_bool(flags.fixed_rotation);
                s.write_bool(flags.bullet);
                s.write_bool(flags.sensor);
            }
            PhysObjKind::FloatConsts(params) => {
                s.write_f32(params.density);
                s.write_f32(params.friction);
                s.write_f32(params.restitution);
                s.write_f32(params.linear_damping);
                s.write_f32(params.angular_damping);
                s.write_f32(params.gravity_scale);
                s.write_f32(params.mass);
                s.write_f32(params.inertia);
                s.write_f32(params.centroid.x);
                s.write_f32(params.centroid.y);
            }
            PhysObjKind::OwnerAcquire(duration) => s.write_u64(*duration),
        }
        s.finish()
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        if data.len() < PREFIX_BYTES {
            return Err(DecodeError::Truncated {
                got: data.len(),
                need: PREFIX_BYTES,
            });
        }
        let mut d = Deserializer::new(data);
        let tag = d.read_u32();
        self.id = ObstacleId::from_raw(d.read_u64());
        self.kind = match tag {
            PhysObjKind::CREATION => PhysObjKind::Creation {
                factory: d.read_u32(),
                params: d.remaining().to_vec(),
            },
            PhysObjKind::DELETION => PhysObjKind::Deletion,
            PhysObjKind::BODY_TYPE => PhysObjKind::BodyType(BodyType::from_u32(d.read_u32())),
            PhysObjKind::POSITION => {
                PhysObjKind::Position(Vec2::new(d.read_f32(), d.read_f32()))
            }
            PhysObjKind::VELOCITY => {
                PhysObjKind::Velocity(Vec2::new(d.read_f32(), d.read_f32()))
            }
            PhysObjKind::ANGLE => PhysObjKind::Angle(d.read_f32()),
            PhysObjKind::ANGULAR_VEL => PhysObjKind::AngularVel(d.read_f32()),
            PhysObjKind::BOOL_CONSTS => PhysObjKind::BoolConsts(BodyFlags {
                enabled: d.read_bool(),
                awake: d.read_bool(),
                sleep_allowed: d.read_bool(),
                fixed_rotation: d.read_bool(),
                bullet: d.read_bool(),
                sensor: d.read_bool(),
            }),
            PhysObjKind::FLOAT_CONSTS => PhysObjKind::FloatConsts(BodyParams {
                density: d.read_f32(),
                friction: d.read_f32(),
                restitution: d.read_f32(),
                linear_damping: d.read_f32(),
                angular_damping: d.read_f32(),
                gravity_scale: d.read_f32(),
                mass: d.read_f32(),
                inertia: d.read_f32(),
                centroid: Vec2::new(d.read_f32(), d.read_f32()),
            }),
            PhysObjKind::OWNER_ACQUIRE => PhysObjKind::OwnerAcquire(d.read_u64()),
            PhysObjKind::OWNER_RELEASE => PhysObjKind::OwnerRelease,
            unknown => return Err(DecodeError::UnknownSubtype(unknown)),
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

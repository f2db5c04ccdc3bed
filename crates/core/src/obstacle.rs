//! The obstacle record: a rigid body plus everything replication needs.
//!
//! An obstacle caches its kinematic state and constants on the Rust side and
//! mirrors them into the solver when the world steps. Mutators mark two bit
//! sets: `pending` (state the solver has not seen yet) and, while the
//! obstacle is `shared`, `dirty` (state the synchronizer has not broadcast
//! yet). The synchronizer clears `dirty` every tick after packing; it flips
//! `shared` off around its own writes so applying a remote change never
//! re-dirties the field.

use glam::Vec2;
use rapier2d::dynamics::RigidBodyHandle;
use rapier2d::geometry::{ColliderHandle, SharedShape};

/// Solver body type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyType {
    Static = 0,
    Kinematic = 1,
    #[default]
    Dynamic = 2,
}

impl BodyType {
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Decodes a wire value, falling back to `Static` for anything unknown.
    pub const fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Kinematic,
            2 => Self::Dynamic,
            _ => Self::Static,
        }
    }
}

/// Bit set naming the obstacle state groups that can change independently.
/// Used both for replication dirty tracking and for pending solver writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateBits {
    pub bits: u8,
}

impl StateBits {
    pub const POSITION: u8 = 1 << 0;
    pub const ANGLE: u8 = 1 << 1;
    pub const LINEAR_VEL: u8 = 1 << 2;
    pub const ANGULAR_VEL: u8 = 1 << 3;
    pub const BODY_TYPE: u8 = 1 << 4;
    pub const BOOL_CONSTS: u8 = 1 << 5;
    pub const FLOAT_CONSTS: u8 = 1 << 6;

    pub const ALL: u8 = Self::POSITION
        | Self::ANGLE
        | Self::LINEAR_VEL
        | Self::ANGULAR_VEL
        | Self::BODY_TYPE
        | Self::BOOL_CONSTS
        | Self::FLOAT_CONSTS;

    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    #[inline]
    pub const fn contains(&self, bit: u8) -> bool {
        self.bits & bit != 0
    }

    #[inline]
    pub fn mark(&mut self, bit: u8) {
        self.bits |= bit;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.bits = 0;
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

/// Boolean body constants, replicated as a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyFlags {
    pub enabled: bool,
    pub awake: bool,
    pub sleep_allowed: bool,
    pub fixed_rotation: bool,
    pub bullet: bool,
    pub sensor: bool,
}

impl Default for BodyFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            awake: true,
            sleep_allowed: true,
            fixed_rotation: false,
            bullet: false,
            sensor: false,
        }
    }
}

/// Float body constants, replicated as a group. `mass`, `inertia` and
/// `centroid` are additional mass properties layered on top of what the
/// solver derives from the shape and density.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyParams {
    pub density: f32,
    pub friction: f32,
    pub restitution: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub gravity_scale: f32,
    pub mass: f32,
    pub inertia: f32,
    pub centroid: Vec2,
}

impl Default for BodyParams {
    fn default() -> Self {
        Self {
            density: 1.0,
            friction: 0.2,
            restitution: 0.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            gravity_scale: 1.0,
            mass: 0.0,
            inertia: 0.0,
            centroid: Vec2::ZERO,
        }
    }
}

/// A rigid body managed by the obstacle world.
pub struct Obstacle {
    shape: SharedShape,
    body_type: BodyType,
    position: Vec2,
    linear_velocity: Vec2,
    angle: f32,
    angular_velocity: f32,
    flags: BodyFlags,
    params: BodyParams,
    shared: bool,
    removed: bool,
    dirty: StateBits,
    pending: StateBits,
    pub(crate) body: Option<RigidBodyHandle>,
    pub(crate) collider: Option<ColliderHandle>,
}

impl Obstacle {
    pub fn new(shape: SharedShape) -> Self {
        Self {
            shape,
            body_type: BodyType::Dynamic,
            position: Vec2::ZERO,
            linear_velocity: Vec2::ZERO,
            angle: 0.0,
            angular_velocity: 0.0,
            flags: BodyFlags::default(),
            params: BodyParams::default(),
            shared: false,
            removed: false,
            dirty: StateBits::new(),
            pending: StateBits::new(),
            body: None,
            collider: None,
        }
    }

    #[inline]
    fn touch(&mut self, bit: u8) {
        self.pending.mark(bit);
        if self.shared {
            self.dirty.mark(bit);
        }
    }

    pub fn shape(&self) -> &SharedShape {
        &self.shape
    }

    // --- Kinematic state ---

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn x(&self) -> f32 {
        self.position.x
    }

    pub fn y(&self) -> f32 {
        self.position.y
    }

    pub fn set_position(&mut self, position: Vec2) {
        self.position = position;
        self.touch(StateBits::POSITION);
    }

    pub fn set_x(&mut self, x: f32) {
        self.position.x = x;
        self.touch(StateBits::POSITION);
    }

    pub fn set_y(&mut self, y: f32) {
        self.position.y = y;
        self.touch(StateBits::POSITION);
    }

    pub fn angle(&self) -> f32 {
        self.angle
    }

    pub fn set_angle(&mut self, angle: f32) {
        self.angle = angle;
        self.touch(StateBits::ANGLE);
    }

    pub fn linear_velocity(&self) -> Vec2 {
        self.linear_velocity
    }

    pub fn vx(&self) -> f32 {
        self.linear_velocity.x
    }

    pub fn vy(&self) -> f32 {
        self.linear_velocity.y
    }

    pub fn set_linear_velocity(&mut self, velocity: Vec2) {
        self.linear_velocity = velocity;
        self.touch(StateBits::LINEAR_VEL);
    }

    pub fn set_vx(&mut self, vx: f32) {
        self.linear_velocity.x = vx;
        self.touch(StateBits::LINEAR_VEL);
    }

    pub fn set_vy(&mut self, vy: f32) {
        self.linear_velocity.y = vy;
        self.touch(StateBits::LINEAR_VEL);
    }

    pub fn angular_velocity(&self) -> f32 {
        self.angular_velocity
    }

    pub fn set_angular_velocity(&mut self, omega: f32) {
        self.angular_velocity = omega;
        self.touch(StateBits::ANGULAR_VEL);
    }

    pub fn body_type(&self) -> BodyType {
        self.body_type
    }

    pub fn set_body_type(&mut self, body_type: BodyType) {
        self.body_type = body_type;
        self.touch(StateBits::BODY_TYPE);
    }

    // --- Boolean constants ---

    pub fn flags(&self) -> BodyFlags {
        self.flags
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.flags.enabled = enabled;
        self.touch(StateBits::BOOL_CONSTS);
    }

    pub fn is_awake(&self) -> bool {
        self.flags.awake
    }

    pub fn set_awake(&mut self, awake: bool) {
        self.flags.awake = awake;
        self.touch(StateBits::BOOL_CONSTS);
    }

    pub fn is_sleep_allowed(&self) -> bool {
        self.flags.sleep_allowed
    }

    pub fn set_sleep_allowed(&mut self, allowed: bool) {
        self.flags.sleep_allowed = allowed;
        self.touch(StateBits::BOOL_CONSTS);
    }

    pub fn is_fixed_rotation(&self) -> bool {
        self.flags.fixed_rotation
    }

    pub fn set_fixed_rotation(&mut self, fixed: bool) {
        self.flags.fixed_rotation = fixed;
        self.touch(StateBits::BOOL_CONSTS);
    }

    pub fn is_bullet(&self) -> bool {
        self.flags.bullet
    }

    pub fn set_bullet(&mut self, bullet: bool) {
        self.flags.bullet = bullet;
        self.touch(StateBits::BOOL_CONSTS);
    }

    pub fn is_sensor(&self) -> bool {
        self.flags.sensor
    }

    pub fn set_sensor(&mut self, sensor: bool) {
        self.flags.sensor = sensor;
        self.touch(StateBits::BOOL_CONSTS);
    }

    // --- Float constants ---

    pub fn params(&self) -> BodyParams {
        self.params
    }

    pub fn density(&self) -> f32 {
        self.params.density
    }

    pub fn set_density(&mut self, density: f32) {
        self.params.density = density;
        self.touch(StateBits::FLOAT_CONSTS);
    }

    pub fn friction(&self) -> f32 {
        self.params.friction
    }

    pub fn set_friction(&mut self, friction: f32) {
        self.params.friction = friction;
        self.touch(StateBits::FLOAT_CONSTS);
    }

    pub fn restitution(&self) -> f32 {
        self.params.restitution
    }

    pub fn set_restitution(&mut self, restitution: f32) {
        self.params.restitution = restitution;
        self.touch(StateBits::FLOAT_CONSTS);
    }

    pub fn linear_damping(&self) -> f32 {
        self.params.linear_damping
    }

    pub fn set_linear_damping(&mut self, damping: f32) {
        self.params.linear_damping = damping;
        self.touch(StateBits::FLOAT_CONSTS);
    }

    pub fn angular_damping(&self) -> f32 {
        self.params.angular_damping
    }

    pub fn set_angular_damping(&mut self, damping: f32) {
        self.params.angular_damping = damping;
        self.touch(StateBits::FLOAT_CONSTS);
    }

    pub fn gravity_scale(&self) -> f32 {
        self.params.gravity_scale
    }

    pub fn set_gravity_scale(&mut self, scale: f32) {
        self.params.gravity_scale = scale;
        self.touch(StateBits::FLOAT_CONSTS);
    }

    pub fn mass(&self) -> f32 {
        self.params.mass
    }

    pub fn set_mass(&mut self, mass: f32) {
        self.params.mass = mass;
        self.touch(StateBits::FLOAT_CONSTS);
    }

    pub fn inertia(&self) -> f32 {
        self.params.inertia
    }

    pub fn set_inertia(&mut self, inertia: f32) {
        self.params.inertia = inertia;
        self.touch(StateBits::FLOAT_CONSTS);
    }

    pub fn centroid(&self) -> Vec2 {
        self.params.centroid
    }

    pub fn set_centroid(&mut self, centroid: Vec2) {
        self.params.centroid = centroid;
        self.touch(StateBits::FLOAT_CONSTS);
    }

    /// Applies a whole flag group at once, skipping no-op fields.
    pub fn apply_flags(&mut self, flags: BodyFlags) {
        if flags != self.flags {
            self.flags = flags;
            self.touch(StateBits::BOOL_CONSTS);
        }
    }

    /// Applies a whole float-constant group at once, skipping no-op fields.
    pub fn apply_params(&mut self, params: BodyParams) {
        if params != self.params {
            self.params = params;
            self.touch(StateBits::FLOAT_CONSTS);
        }
    }

    // --- Replication bookkeeping ---

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Toggles replication. While off, mutators stop setting dirty bits.
    pub fn set_shared(&mut self, shared: bool) {
        self.shared = shared;
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Marks this obstacle for the next [`garbage_collect`] pass.
    ///
    /// [`garbage_collect`]: crate::ObstacleWorld::garbage_collect
    pub fn mark_removed(&mut self, removed: bool) {
        self.removed = removed;
    }

    pub fn dirty(&self) -> StateBits {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub(crate) fn pending(&self) -> StateBits {
        self.pending
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn mark_all_pending(&mut self) {
        self.pending.bits = StateBits::ALL;
    }

    /// Direct write used by the world's post-step read-back. Does not raise
    /// dirty or pending bits.
    pub(crate) fn absorb_solver_state(
        &mut self,
        position: Vec2,
        angle: f32,
        linear_velocity: Vec2,
        angular_velocity: f32,
        awake: bool,
    ) {
        self.position = position;
        self.angle = angle;
        self.linear_velocity = linear_velocity;
        self.angular_velocity = angular_velocity;
        self.flags.awake = awake;
    }
}

//! The obstacle world: ID allocation, ownership, joints, and the step pump.
//!
//! Wraps the 2D solver so callers only ever deal in [`Obstacle`] records and
//! stable IDs. Obstacle state flows solver-ward right before each step and
//! back into the records right after, so reads between ticks are always
//! consistent with what the last step produced.

use std::collections::HashMap;

use glam::Vec2;
use rapier2d::geometry::BroadPhaseMultiSap;
use rapier2d::prelude::*;
use tracing::{debug, warn};

use crate::bounds::WorldBounds;
use crate::id::{JointId, ObstacleId, INIT_UID};
use crate::obstacle::{BodyType, Obstacle, StateBits};

const DEFAULT_GRAVITY: Vec2 = Vec2::new(0.0, -9.8);
const DEFAULT_FIXED_STEP: f32 = 1.0 / 60.0;

/// A joint between two obstacles, described with the solver's joint data.
pub struct JointDef {
    pub body_a: ObstacleId,
    pub body_b: ObstacleId,
    pub joint: GenericJoint,
}

impl JointDef {
    pub fn new(body_a: ObstacleId, body_b: ObstacleId, joint: impl Into<GenericJoint>) -> Self {
        Self {
            body_a,
            body_b,
            joint: joint.into(),
        }
    }
}

/// A bundle of obstacles plus the joints wiring them together, added and
/// removed as a unit. Links reference bodies by their index in the set.
#[derive(Default)]
pub struct JointSet {
    obstacles: Vec<Obstacle>,
    links: Vec<(usize, usize, GenericJoint)>,
}

impl JointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a body to the set, returning its index for linking.
    pub fn add_body(&mut self, obstacle: Obstacle) -> usize {
        self.obstacles.push(obstacle);
        self.obstacles.len() - 1
    }

    pub fn add_link(&mut self, a: usize, b: usize, joint: impl Into<GenericJoint>) {
        self.links.push((a, b, joint.into()));
    }
}

/// IDs handed back when a [`JointSet`] is placed into the world. Removing
/// the set destroys its joints and garbage-collects its bodies.
#[derive(Debug, Clone)]
pub struct PlacedJointSet {
    pub obstacles: Vec<ObstacleId>,
    pub joints: Vec<JointId>,
}

/// Registry of obstacles and joints over the underlying solver.
pub struct ObstacleWorld {
    bounds: WorldBounds,
    gravity: Vec2,
    lockstep: bool,
    fixed_step: f32,

    short_uid: u32,
    is_host: bool,
    next_obj: u32,
    next_joint: u32,

    order: Vec<ObstacleId>,
    objects: HashMap<ObstacleId, Obstacle>,
    owned: HashMap<ObstacleId, u64>,
    joints: HashMap<JointId, ImpulseJointHandle>,

    integration: IntegrationParameters,
    pipeline: PhysicsPipeline,
    islands: IslandManager,
    broad_phase: BroadPhaseMultiSap,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
}

impl ObstacleWorld {
    pub fn new(bounds: WorldBounds) -> Self {
        Self::with_gravity(bounds, DEFAULT_GRAVITY)
    }

    pub fn with_gravity(bounds: WorldBounds, gravity: Vec2) -> Self {
        Self {
            bounds,
            gravity,
            lockstep: false,
            fixed_step: DEFAULT_FIXED_STEP,
            short_uid: 0,
            is_host: false,
            next_obj: 0,
            next_joint: 0,
            order: Vec::new(),
            objects: HashMap::new(),
            owned: HashMap::new(),
            joints: HashMap::new(),
            integration: IntegrationParameters::default(),
            pipeline: PhysicsPipeline::new(),
            islands: IslandManager::new(),
            broad_phase: BroadPhaseMultiSap::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
        }
    }

    // --- Configuration ---

    pub fn bounds(&self) -> WorldBounds {
        self.bounds
    }

    pub fn gravity(&self) -> Vec2 {
        self.gravity
    }

    pub fn set_gravity(&mut self, gravity: Vec2) {
        self.gravity = gravity;
    }

    /// In lockstep mode `update` ignores the caller's `dt` and always steps
    /// by the fixed step size.
    pub fn set_lockstep(&mut self, lockstep: bool) {
        self.lockstep = lockstep;
    }

    pub fn set_fixed_step(&mut self, step: f32) {
        self.fixed_step = step;
    }

    pub fn short_uid(&self) -> u32 {
        self.short_uid
    }

    /// Assigned by the synchronizer once the handshake hands out a UID.
    /// Obstacles added before that should go through [`add_init_obstacle`].
    ///
    /// [`add_init_obstacle`]: Self::add_init_obstacle
    pub fn set_short_uid(&mut self, short_uid: u32) {
        self.short_uid = short_uid;
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn set_host(&mut self, is_host: bool) {
        self.is_host = is_host;
    }

    // --- Obstacle management ---

    /// Adds an obstacle, allocating the next ID under this peer's short UID.
    /// On the host the new obstacle is immediately owned with a permanent
    /// lease. The obstacle must lie inside the world bounds.
    pub fn add_obstacle(&mut self, obstacle: Obstacle) -> ObstacleId {
        let id = ObstacleId::new(self.short_uid, self.next_obj);
        self.next_obj += 1;
        self.insert_obstacle(id, obstacle);
        id
    }

    /// Adds an obstacle under an externally supplied ID (remote creation).
    /// Duplicate IDs are a caller bug.
    pub fn add_obstacle_with_id(&mut self, id: ObstacleId, obstacle: Obstacle) {
        self.insert_obstacle(id, obstacle);
    }

    /// Adds a pre-session obstacle under the reserved bootstrap UID.
    pub fn add_init_obstacle(&mut self, obstacle: Obstacle) -> ObstacleId {
        let id = ObstacleId::new(INIT_UID, self.next_obj);
        self.next_obj += 1;
        self.insert_obstacle(id, obstacle);
        id
    }

    fn insert_obstacle(&mut self, id: ObstacleId, mut obstacle: Obstacle) {
        debug_assert!(
            self.bounds.contains(obstacle.position()),
            "obstacle {id} is not in bounds"
        );
        debug_assert!(
            !self.objects.contains_key(&id),
            "duplicate obstacle id {id}"
        );
        if self.objects.contains_key(&id) {
            warn!(%id, "ignoring obstacle with duplicate id");
            return;
        }

        let builder = match obstacle.body_type() {
            BodyType::Static => RigidBodyBuilder::fixed(),
            BodyType::Kinematic => RigidBodyBuilder::kinematic_velocity_based(),
            BodyType::Dynamic => RigidBodyBuilder::dynamic(),
        };
        let body = builder
            .translation(vector![obstacle.position().x, obstacle.position().y])
            .rotation(obstacle.angle())
            .linvel(vector![
                obstacle.linear_velocity().x,
                obstacle.linear_velocity().y
            ])
            .angvel(obstacle.angular_velocity())
            .user_data(id.raw() as u128)
            .build();
        let body_handle = self.bodies.insert(body);

        let collider = ColliderBuilder::new(obstacle.shape().clone())
            .density(obstacle.density())
            .friction(obstacle.friction())
            .restitution(obstacle.restitution())
            .sensor(obstacle.is_sensor())
            .user_data(id.raw() as u128)
            .build();
        let collider_handle =
            self.colliders
                .insert_with_parent(collider, body_handle, &mut self.bodies);

        obstacle.body = Some(body_handle);
        obstacle.collider = Some(collider_handle);
        obstacle.mark_all_pending();
        Self::flush_pending(&mut self.bodies, &mut self.colliders, &mut obstacle);

        self.order.push(id);
        self.objects.insert(id, obstacle);
        if self.is_host {
            self.owned.insert(id, 0);
        }
        self.query_pipeline.update(&self.colliders);
    }

    /// Immediately deactivates and removes a single obstacle, dropping it
    /// from every registry. Prefer [`mark_removed`] + [`garbage_collect`]
    /// for batch removal.
    ///
    /// [`mark_removed`]: Obstacle::mark_removed
    /// [`garbage_collect`]: Self::garbage_collect
    pub fn remove_obstacle(&mut self, id: ObstacleId) {
        debug_assert!(
            self.objects.contains_key(&id),
            "obstacle {id} not present in world"
        );
        let Some(obstacle) = self.objects.remove(&id) else {
            return;
        };
        self.deactivate(obstacle);
        self.order.retain(|other| *other != id);
        self.owned.remove(&id);
        self.query_pipeline.update(&self.colliders);
    }

    /// Drops every obstacle marked removed, compacting the obstacle list
    /// while preserving relative order.
    pub fn garbage_collect(&mut self) {
        let doomed: Vec<ObstacleId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.objects.get(id).is_some_and(Obstacle::is_removed))
            .collect();
        if doomed.is_empty() {
            return;
        }
        for id in &doomed {
            if let Some(obstacle) = self.objects.remove(id) {
                self.deactivate(obstacle);
            }
            self.owned.remove(id);
        }
        self.order.retain(|id| self.objects.contains_key(id));
        self.query_pipeline.update(&self.colliders);
        debug!(count = doomed.len(), "garbage collected obstacles");
    }

    /// Destroys all joints, then all obstacles, leaving the world ready for
    /// reuse. ID counters are not reset; IDs stay unique per session.
    pub fn clear(&mut self) {
        let handles: Vec<ImpulseJointHandle> = self.joints.drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.impulse_joints.remove(handle, true);
        }
        let ids: Vec<ObstacleId> = self.order.drain(..).collect();
        for id in ids {
            if let Some(obstacle) = self.objects.remove(&id) {
                self.deactivate(obstacle);
            }
        }
        self.objects.clear();
        self.owned.clear();
        self.update(0.0);
    }

    fn deactivate(&mut self, mut obstacle: Obstacle) {
        if let Some(handle) = obstacle.body.take() {
            self.bodies.remove(
                handle,
                &mut self.islands,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                true,
            );
        }
        obstacle.collider = None;
    }

    // --- Lookup ---

    pub fn contains(&self, id: ObstacleId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn get(&self, id: ObstacleId) -> Option<&Obstacle> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObstacleId) -> Option<&mut Obstacle> {
        self.objects.get_mut(&id)
    }

    /// Obstacle IDs in insertion order.
    pub fn ids(&self) -> &[ObstacleId] {
        &self.order
    }

    /// Obstacles with their IDs, in insertion order.
    pub fn obstacles(&self) -> impl Iterator<Item = (ObstacleId, &Obstacle)> {
        self.order
            .iter()
            .filter_map(|id| self.objects.get(id).map(|obs| (*id, obs)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ownership leases: remaining ticks per obstacle, 0 meaning permanent.
    pub fn owned(&self) -> &HashMap<ObstacleId, u64> {
        &self.owned
    }

    pub fn owned_mut(&mut self) -> &mut HashMap<ObstacleId, u64> {
        &mut self.owned
    }

    // --- Joints ---

    pub fn add_joint(&mut self, def: JointDef) -> JointId {
        let id = JointId::new(self.short_uid, self.next_joint);
        self.next_joint += 1;
        self.add_joint_with_id(id, def);
        id
    }

    pub fn add_joint_with_id(&mut self, id: JointId, def: JointDef) {
        debug_assert!(!self.joints.contains_key(&id), "duplicate joint id {id}");
        let body_a = self.objects.get(&def.body_a).and_then(|obs| obs.body);
        let body_b = self.objects.get(&def.body_b).and_then(|obs| obs.body);
        let (Some(a), Some(b)) = (body_a, body_b) else {
            debug_assert!(false, "joint {id} references an unknown obstacle");
            warn!(%id, "dropping joint referencing unknown obstacles");
            return;
        };
        let handle = self.impulse_joints.insert(a, b, def.joint, true);
        self.joints.insert(id, handle);
    }

    pub fn remove_joint(&mut self, id: JointId) {
        if let Some(handle) = self.joints.remove(&id) {
            self.impulse_joints.remove(handle, true);
        }
    }

    pub fn joint(&self, id: JointId) -> Option<&ImpulseJoint> {
        self.joints
            .get(&id)
            .and_then(|handle| self.impulse_joints.get(*handle))
    }

    /// Places every body and link of the set, returning the allocated IDs.
    pub fn add_joint_set(&mut self, set: JointSet) -> PlacedJointSet {
        let mut obstacles = Vec::with_capacity(set.obstacles.len());
        for obstacle in set.obstacles {
            obstacles.push(self.add_obstacle(obstacle));
        }
        let mut joints = Vec::with_capacity(set.links.len());
        for (a, b, joint) in set.links {
            debug_assert!(
                a < obstacles.len() && b < obstacles.len(),
                "joint link references a body outside the set"
            );
            if a >= obstacles.len() || b >= obstacles.len() {
                continue;
            }
            joints.push(self.add_joint(JointDef {
                body_a: obstacles[a],
                body_b: obstacles[b],
                joint,
            }));
        }
        PlacedJointSet { obstacles, joints }
    }

    /// Destroys the set's joints, marks its bodies removed, and collects.
    pub fn remove_joint_set(&mut self, placed: &PlacedJointSet) {
        for id in &placed.joints {
            self.remove_joint(*id);
        }
        for id in &placed.obstacles {
            if let Some(obstacle) = self.objects.get_mut(id) {
                obstacle.mark_removed(true);
            }
        }
        self.garbage_collect();
    }

    // --- Stepping ---

    /// Advances the solver one step and refreshes every obstacle record from
    /// the solved state. Uses the fixed step size when lockstep is on.
    pub fn update(&mut self, dt: f32) {
        let step = if self.lockstep { self.fixed_step } else { dt };
        self.integration.dt = step;

        for obstacle in self.objects.values_mut() {
            Self::flush_pending(&mut self.bodies, &mut self.colliders, obstacle);
        }

        self.pipeline.step(
            &vector![self.gravity.x, self.gravity.y],
            &self.integration,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &(),
            &(),
        );

        for obstacle in self.objects.values_mut() {
            Self::read_back(&self.bodies, obstacle);
        }
    }

    fn flush_pending(bodies: &mut RigidBodySet, colliders: &mut ColliderSet, obs: &mut Obstacle) {
        let pending = obs.pending();
        if pending.is_empty() {
            return;
        }
        let (Some(body_handle), Some(collider_handle)) = (obs.body, obs.collider) else {
            obs.clear_pending();
            return;
        };

        if let Some(body) = bodies.get_mut(body_handle) {
            if pending.contains(StateBits::POSITION) {
                body.set_translation(vector![obs.x(), obs.y()], false);
            }
            if pending.contains(StateBits::ANGLE) {
                body.set_rotation(Rotation::new(obs.angle()), false);
            }
            if pending.contains(StateBits::LINEAR_VEL) {
                body.set_linvel(vector![obs.vx(), obs.vy()], false);
            }
            if pending.contains(StateBits::ANGULAR_VEL) {
                body.set_angvel(obs.angular_velocity(), false);
            }
            if pending.contains(StateBits::BODY_TYPE) {
                let body_type = match obs.body_type() {
                    BodyType::Static => RigidBodyType::Fixed,
                    BodyType::Kinematic => RigidBodyType::KinematicVelocityBased,
                    BodyType::Dynamic => RigidBodyType::Dynamic,
                };
                body.set_body_type(body_type, true);
            }
            if pending.contains(StateBits::BOOL_CONSTS) {
                let flags = obs.flags();
                body.set_enabled(flags.enabled);
                body.enable_ccd(flags.bullet);
                body.lock_rotations(flags.fixed_rotation, false);
                *body.activation_mut() = if flags.sleep_allowed {
                    RigidBodyActivation::active()
                } else {
                    RigidBodyActivation::cannot_sleep()
                };
                if flags.awake {
                    body.wake_up(true);
                } else {
                    body.sleep();
                }
            }
            if pending.contains(StateBits::FLOAT_CONSTS) {
                let params = obs.params();
                body.set_linear_damping(params.linear_damping);
                body.set_angular_damping(params.angular_damping);
                body.set_gravity_scale(params.gravity_scale, false);
                body.set_additional_mass_properties(
                    MassProperties::new(
                        point![params.centroid.x, params.centroid.y],
                        params.mass,
                        params.inertia,
                    ),
                    false,
                );
            }
        }

        if pending.contains(StateBits::BOOL_CONSTS) || pending.contains(StateBits::FLOAT_CONSTS) {
            if let Some(collider) = colliders.get_mut(collider_handle) {
                collider.set_sensor(obs.is_sensor());
                collider.set_density(obs.density());
                collider.set_friction(obs.friction());
                collider.set_restitution(obs.restitution());
            }
        }

        obs.clear_pending();
    }

    fn read_back(bodies: &RigidBodySet, obs: &mut Obstacle) {
        let Some(handle) = obs.body else { return };
        let Some(body) = bodies.get(handle) else { return };
        let translation = body.translation();
        let linvel = body.linvel();
        obs.absorb_solver_state(
            Vec2::new(translation.x, translation.y),
            body.rotation().angle(),
            Vec2::new(linvel.x, linvel.y),
            body.angvel(),
            !body.is_sleeping(),
        );
    }

    // --- Queries ---

    /// Reports every obstacle whose collider AABB intersects `rect`. The
    /// callback returns `true` to keep searching, `false` to stop.
    pub fn query_aabb(&self, rect: WorldBounds, mut callback: impl FnMut(ObstacleId) -> bool) {
        let aabb = Aabb::new(point![rect.min.x, rect.min.y], point![rect.max.x, rect.max.y]);
        self.query_pipeline
            .colliders_with_aabb_intersecting_aabb(&aabb, |handle| {
                match self.colliders.get(*handle) {
                    Some(collider) => callback(ObstacleId::from_raw(collider.user_data as u64)),
                    None => true,
                }
            });
    }

    /// Casts a ray from `p1` to `p2`, reporting hits nearest-first as
    /// `(id, point, normal, fraction)`. The callback's return value steers
    /// the cast: -1 ignores the hit, 0 stops, a fraction clips the ray, and
    /// 1 continues unclipped.
    pub fn ray_cast(
        &self,
        p1: Vec2,
        p2: Vec2,
        mut callback: impl FnMut(ObstacleId, Vec2, Vec2, f32) -> f32,
    ) {
        let dir = p2 - p1;
        let ray = Ray::new(point![p1.x, p1.y], vector![dir.x, dir.y]);
        let mut hits: Vec<(ColliderHandle, f32, Vec2)> = Vec::new();
        self.query_pipeline.intersections_with_ray(
            &self.bodies,
            &self.colliders,
            &ray,
            1.0,
            true,
            QueryFilter::default(),
            |handle, intersection| {
                hits.push((
                    handle,
                    intersection.time_of_impact,
                    Vec2::new(intersection.normal.x, intersection.normal.y),
                ));
                true
            },
        );
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut max_fraction = 1.0f32;
        for (handle, fraction, normal) in hits {
            if fraction > max_fraction {
                continue;
            }
            let Some(collider) = self.colliders.get(handle) else {
                continue;
            };
            let id = ObstacleId::from_raw(collider.user_data as u64);
            let at = ray.point_at(fraction);
            let verdict = callback(id, Vec2::new(at.x, at.y), normal, fraction);
            if verdict == 0.0 {
                return;
            }
            if verdict > 0.0 && verdict < 1.0 {
                max_fraction = verdict;
            }
        }
    }
}

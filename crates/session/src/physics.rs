//! The physics synchronizer.
//!
//! Owns the shared [`ObstacleWorld`] while a session runs. Outbound, it
//! packs snapshots of owned obstacles and per-field change events from the
//! dirty bits. Inbound, it applies object events immediately and smooths
//! snapshots in over a handful of ticks instead of teleporting bodies.
//!
//! Interpolation is linear by default. The `interp-bezier`,
//! `interp-hermite`, and `interp-pid` features switch the position path to
//! experimental curves; the target descriptor carries the control points
//! and PID accumulator for all of them.

use std::collections::HashMap;

use glam::Vec2;
use tracing::{debug, trace, warn};

use netphys_core::{
    Obstacle, ObstacleFactory, ObstacleId, ObstacleWorld, RenderNode, StateBits,
};
use netphys_protocol::{NetEvent, ObjSnapshot, PhysObjEvent, PhysObjKind, PhysSyncEvent};

/// Invoked when a replicated creation produces an obstacle (and maybe a
/// render node) so the application can wire it into its scene.
pub type LinkFn = Box<dyn FnMut(ObstacleId, &Obstacle, Option<&mut dyn RenderNode>)>;

/// Which obstacles a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    /// Every shared obstacle, owned or not. For desync repair.
    OverrideFullSync,
    /// Every shared obstacle this peer owns. The host's steady-state sync.
    FullSync,
    /// The fastest obstacles plus a rotating window of the rest.
    PrioSync,
}

/// Hard cap on obstacles selected by speed in a priority sync.
const PRIO_SPEED_CAP: usize = 60;
/// Size of the rotating window appended to a priority sync.
const PRIO_ROTATION_WINDOW: usize = 20;
/// Interpolation never takes more steps than this.
const MAX_INTERP_STEPS: u32 = 30;

/// Interpolation counters for debug reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Snapshot targets scheduled.
    pub itpr_count: u64,
    /// Targets that ran to the final snap.
    pub ovrd_count: u64,
    /// Total steps scheduled, for averaging.
    pub step_sum: u64,
}

/// Target descriptor for one obstacle's in-flight interpolation.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetParam {
    pub cur_step: u32,
    pub num_steps: u32,
    /// Source position.
    pub p0: Vec2,
    /// Control point leaving the source along its velocity.
    pub p1: Vec2,
    /// Control point entering the target against its velocity.
    pub p2: Vec2,
    /// Target position.
    pub p3: Vec2,
    pub target_vel: Vec2,
    pub target_angle: f32,
    pub target_ang_vel: f32,
    /// PID integral accumulator, carried across retargets.
    pub integral: Vec2,
    pub num_integral: u64,
}

/// Synchronizes a shared obstacle world with remote peers.
pub struct NetPhysicsController {
    world: ObstacleWorld,
    is_host: bool,
    cache: HashMap<ObstacleId, TargetParam>,
    factories: Vec<Box<dyn ObstacleFactory>>,
    link_fn: Option<LinkFn>,
    nodes: HashMap<ObstacleId, Box<dyn RenderNode>>,
    out_events: Vec<Box<dyn NetEvent>>,
    /// Rotation cursor for priority syncs.
    obj_rotation: usize,
    stats: SyncStats,
}

impl NetPhysicsController {
    pub fn new(world: ObstacleWorld, is_host: bool, link_fn: Option<LinkFn>) -> Self {
        Self {
            world,
            is_host,
            cache: HashMap::new(),
            factories: Vec::new(),
            link_fn,
            nodes: HashMap::new(),
            out_events: Vec::new(),
            obj_rotation: 0,
            stats: SyncStats::default(),
        }
    }

    pub fn world(&self) -> &ObstacleWorld {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut ObstacleWorld {
        &mut self.world
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Registers an obstacle factory, returning its replication index.
    /// Peers must register the same factories in the same order.
    pub fn attach_factory(&mut self, factory: Box<dyn ObstacleFactory>) -> u32 {
        self.factories.push(factory);
        self.factories.len() as u32 - 1
    }

    /// Clears interpolation state, queued events, node links, and counters.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.out_events.clear();
        self.nodes.clear();
        self.obj_rotation = 0;
        self.stats = SyncStats::default();
    }

    /// Hands the queued outbound events to the session controller.
    pub fn take_out_events(&mut self) -> Vec<Box<dyn NetEvent>> {
        std::mem::take(&mut self.out_events)
    }

    /// True while a snapshot interpolation is in flight for the obstacle.
    pub fn is_in_sync(&self, id: ObstacleId) -> bool {
        self.cache.contains_key(&id)
    }

    pub fn interpolation_target(&self, id: ObstacleId) -> Option<&TargetParam> {
        self.cache.get(&id)
    }

    // --- Shared obstacle lifecycle ---

    /// Creates an obstacle through a registered factory, shares it, and
    /// replicates the creation to every peer. Returns the new ID, or None
    /// if the factory index is unknown.
    pub fn add_shared_obstacle(&mut self, factory: u32, params: Vec<u8>) -> Option<ObstacleId> {
        debug_assert!(
            (factory as usize) < self.factories.len(),
            "unknown obstacle factory {factory}"
        );
        let Some(maker) = self.factories.get(factory as usize) else {
            warn!(factory, "ignoring creation for unknown factory");
            return None;
        };
        let (mut obstacle, node) = maker.create_obstacle(&params);
        obstacle.set_shared(true);
        let id = self.world.add_obstacle(obstacle);
        self.link_node(id, node);
        self.out_events
            .push(Box::new(PhysObjEvent::creation(id, factory, params)));
        Some(id)
    }

    /// Removes a shared obstacle locally and replicates the deletion.
    pub fn remove_shared_obstacle(&mut self, id: ObstacleId) {
        if !self.world.contains(id) {
            return;
        }
        self.out_events.push(Box::new(PhysObjEvent::deletion(id)));
        self.world.remove_obstacle(id);
        self.cache.remove(&id);
        self.detach_node(id);
    }

    fn link_node(&mut self, id: ObstacleId, mut node: Option<Box<dyn RenderNode>>) {
        if let Some(link) = self.link_fn.as_mut() {
            if let Some(obstacle) = self.world.get(id) {
                match &mut node {
                    Some(n) => link(id, obstacle, Some(n.as_mut())),
                    None => link(id, obstacle, None),
                }
            }
        }
        if let Some(node) = node {
            self.nodes.insert(id, node);
        }
    }

    fn detach_node(&mut self, id: ObstacleId) {
        if let Some(mut node) = self.nodes.remove(&id) {
            node.detach();
        }
    }

    // --- Ownership ---

    /// Takes ownership of an obstacle for `duration` ticks. The host
    /// always records a permanent lease; a client's lease counts down and
    /// auto-releases. A lease already held is left untouched.
    pub fn acquire_obs(&mut self, id: ObstacleId, duration: u64) {
        if self.is_host {
            self.world.owned_mut().entry(id).or_insert(0);
        } else {
            self.world.owned_mut().entry(id).or_insert(duration);
        }
        self.out_events
            .push(Box::new(PhysObjEvent::owner_acquire(id, duration)));
    }

    /// Client only: gives an obstacle back to the host.
    pub fn release_obs(&mut self, id: ObstacleId) {
        if self.is_host {
            return;
        }
        self.world.owned_mut().remove(&id);
        self.out_events
            .push(Box::new(PhysObjEvent::owner_release(id)));
        trace!(%id, "released ownership");
    }

    /// Inserts every obstacle into the owned map with a permanent lease.
    /// Host bootstrap after loading a scene.
    pub fn own_all(&mut self) {
        let ids: Vec<ObstacleId> = self.world.ids().to_vec();
        for id in ids {
            self.world.owned_mut().entry(id).or_insert(0);
        }
    }

    // --- Outbound packing ---

    /// Packs a snapshot event of the selected obstacles and queues it.
    /// Called automatically each tick on the host; extra calls (e.g. an
    /// `OverrideFullSync` after a desync) are safe.
    pub fn pack_phys_sync(&mut self, sync: SyncType) {
        let mut event = PhysSyncEvent::new();
        match sync {
            SyncType::OverrideFullSync => {
                for (id, obstacle) in self.world.obstacles() {
                    if obstacle.is_shared() {
                        event.add_obstacle(id, obstacle);
                    }
                }
            }
            SyncType::FullSync => {
                for (id, obstacle) in self.world.obstacles() {
                    if obstacle.is_shared() && self.world.owned().contains_key(&id) {
                        event.add_obstacle(id, obstacle);
                    }
                }
            }
            SyncType::PrioSync => {
                let mut by_speed: Vec<(ObstacleId, f32)> = self
                    .world
                    .obstacles()
                    .filter(|(_, obstacle)| obstacle.is_shared())
                    .map(|(id, obstacle)| (id, obstacle.linear_velocity().length()))
                    .collect();
                by_speed.sort_by(|a, b| b.1.total_cmp(&a.1));

                for (id, _) in by_speed.iter().take(PRIO_SPEED_CAP) {
                    if let Some(obstacle) = self.world.get(*id) {
                        event.add_obstacle(*id, obstacle);
                    }
                }

                // Rotating window over all obstacles so slow bodies still
                // resync eventually. Duplicates fall out in add_obstacle.
                let total = self.world.ids().len();
                if total > 0 {
                    self.obj_rotation %= total;
                    for _ in 0..PRIO_ROTATION_WINDOW.min(by_speed.len()) {
                        let id = self.world.ids()[self.obj_rotation];
                        if let Some(obstacle) = self.world.get(id) {
                            event.add_obstacle(id, obstacle);
                        }
                        self.obj_rotation = (self.obj_rotation + 1) % total;
                    }
                }
            }
        }
        self.out_events.push(Box::new(event));
    }

    /// Emits one object event per dirty state group of every shared
    /// obstacle, then clears the dirty bits. Emission order per obstacle:
    /// position, angle, velocity, angular velocity, body type, bool
    /// constants, float constants.
    pub fn pack_phys_obj(&mut self) {
        let ids: Vec<ObstacleId> = self.world.ids().to_vec();
        for id in ids {
            let Some(obstacle) = self.world.get_mut(id) else {
                continue;
            };
            if !obstacle.is_shared() {
                continue;
            }
            let dirty = obstacle.dirty();
            if dirty.is_empty() {
                continue;
            }
            if dirty.contains(StateBits::POSITION) {
                self.out_events
                    .push(Box::new(PhysObjEvent::position(id, obstacle.position())));
            }
            if dirty.contains(StateBits::ANGLE) {
                self.out_events
                    .push(Box::new(PhysObjEvent::angle(id, obstacle.angle())));
            }
            if dirty.contains(StateBits::LINEAR_VEL) {
                self.out_events.push(Box::new(PhysObjEvent::velocity(
                    id,
                    obstacle.linear_velocity(),
                )));
            }
            if dirty.contains(StateBits::ANGULAR_VEL) {
                self.out_events.push(Box::new(PhysObjEvent::angular_velocity(
                    id,
                    obstacle.angular_velocity(),
                )));
            }
            if dirty.contains(StateBits::BODY_TYPE) {
                self.out_events
                    .push(Box::new(PhysObjEvent::body_type(id, obstacle.body_type())));
            }
            if dirty.contains(StateBits::BOOL_CONSTS) {
                self.out_events
                    .push(Box::new(PhysObjEvent::bool_consts(id, obstacle.flags())));
            }
            if dirty.contains(StateBits::FLOAT_CONSTS) {
                self.out_events
                    .push(Box::new(PhysObjEvent::float_consts(id, obstacle.params())));
            }
            obstacle.clear_dirty();
        }
    }

    // --- Inbound handling ---

    /// Applies a remote obstacle state change. Events looped back from
    /// ourselves (empty sender) are ignored, as are events referencing IDs
    /// we do not know.
    pub fn process_phys_obj_event(&mut self, event: &PhysObjEvent, source: &str) {
        if source.is_empty() {
            return;
        }

        if let PhysObjKind::Creation { factory, params } = &event.kind {
            debug_assert!(
                (*factory as usize) < self.factories.len(),
                "unknown obstacle factory {factory}"
            );
            let Some(maker) = self.factories.get(*factory as usize) else {
                warn!(factory, "ignoring remote creation for unknown factory");
                return;
            };
            if self.world.contains(event.id) {
                warn!(id = %event.id, "ignoring remote creation for existing obstacle");
                return;
            }
            let (mut obstacle, node) = maker.create_obstacle(params);
            obstacle.set_shared(true);
            self.world.add_obstacle_with_id(event.id, obstacle);
            self.link_node(event.id, node);
            return;
        }

        if !self.world.contains(event.id) {
            // Unknown object: the creation may have raced ahead of us.
            trace!(id = %event.id, "dropping event for unknown obstacle");
            return;
        }

        match &event.kind {
            PhysObjKind::Creation { .. } => {}
            PhysObjKind::Deletion => {
                self.cache.remove(&event.id);
                self.world.remove_obstacle(event.id);
                self.detach_node(event.id);
            }
            PhysObjKind::OwnerAcquire(_) => {
                // The sender owns it now; whoever held it yields.
                self.world.owned_mut().remove(&event.id);
            }
            PhysObjKind::OwnerRelease => {
                // Only the host takes abandoned obstacles back.
                if self.is_host {
                    self.world.owned_mut().insert(event.id, 0);
                }
            }
            kind => {
                let Some(obstacle) = self.world.get_mut(event.id) else {
                    return;
                };
                obstacle.set_shared(false);
                match kind {
                    PhysObjKind::BodyType(body_type) => {
                        if *body_type != obstacle.body_type() {
                            obstacle.set_body_type(*body_type);
                        }
                    }
                    PhysObjKind::Position(position) => obstacle.set_position(*position),
                    PhysObjKind::Velocity(velocity) => obstacle.set_linear_velocity(*velocity),
                    PhysObjKind::Angle(angle) => obstacle.set_angle(*angle),
                    PhysObjKind::AngularVel(omega) => obstacle.set_angular_velocity(*omega),
                    PhysObjKind::BoolConsts(flags) => {
                        let current = obstacle.flags();
                        if flags.enabled != current.enabled {
                            obstacle.set_enabled(flags.enabled);
                        }
                        if flags.awake != current.awake {
                            obstacle.set_awake(flags.awake);
                        }
                        if flags.sleep_allowed != current.sleep_allowed {
                            obstacle.set_sleep_allowed(flags.sleep_allowed);
                        }
                        if flags.fixed_rotation != current.fixed_rotation {
                            obstacle.set_fixed_rotation(flags.fixed_rotation);
                        }
                        if flags.bullet != current.bullet {
                            obstacle.set_bullet(flags.bullet);
                        }
                        if flags.sensor != current.sensor {
                            obstacle.set_sensor(flags.sensor);
                        }
                    }
                    PhysObjKind::FloatConsts(params) => {
                        let current = obstacle.params();
                        if params.density != current.density {
                            obstacle.set_density(params.density);
                        }
                        if params.friction != current.friction {
                            obstacle.set_friction(params.friction);
                        }
                        if params.restitution != current.restitution {
                            obstacle.set_restitution(params.restitution);
                        }
                        if params.linear_damping != current.linear_damping {
                            obstacle.set_linear_damping(params.linear_damping);
                        }
                        if params.angular_damping != current.angular_damping {
                            obstacle.set_angular_damping(params.angular_damping);
                        }
                        if params.gravity_scale != current.gravity_scale {
                            obstacle.set_gravity_scale(params.gravity_scale);
                        }
                        if params.mass != current.mass {
                            obstacle.set_mass(params.mass);
                        }
                        if params.inertia != current.inertia {
                            obstacle.set_inertia(params.inertia);
                        }
                        if params.centroid != current.centroid {
                            obstacle.set_centroid(params.centroid);
                        }
                    }
                    _ => {}
                }
                obstacle.set_shared(true);
            }
        }
    }

    /// Schedules interpolation targets from a snapshot. Looped-back events
    /// (empty sender) and unknown IDs are ignored.
    pub fn process_phys_sync_event(&mut self, event: &PhysSyncEvent, source: &str) {
        if source.is_empty() {
            return;
        }
        for snapshot in event.snapshots() {
            let Some(obstacle) = self.world.get(snapshot.id) else {
                continue;
            };
            let param = Self::make_target(obstacle, snapshot);
            self.add_sync_target(snapshot.id, param);
        }
    }

    /// Builds the target descriptor: the step count grows with positional
    /// and angular error, clamped to [1, 30] ticks.
    fn make_target(obstacle: &Obstacle, snapshot: &ObjSnapshot) -> TargetParam {
        let diff = (obstacle.position() - snapshot.position).length();
        let ang_diff = 10.0 * (obstacle.angle() - snapshot.angle).abs();
        let steps = ((diff * 30.0) as i32)
            .max(ang_diff as i32)
            .clamp(1, MAX_INTERP_STEPS as i32) as u32;

        TargetParam {
            cur_step: 0,
            num_steps: steps,
            p0: obstacle.position(),
            p1: obstacle.position() + obstacle.linear_velocity() / 10.0,
            p2: snapshot.position - snapshot.velocity / 10.0,
            p3: snapshot.position,
            target_vel: snapshot.velocity,
            target_angle: snapshot.angle,
            target_ang_vel: snapshot.angular_velocity,
            integral: Vec2::ZERO,
            num_integral: 0,
        }
    }

    /// Installs a target, replacing any interpolation already in flight.
    /// When replacing, the body's velocity snaps to the previous target's
    /// velocity and the PID accumulator carries over.
    fn add_sync_target(&mut self, id: ObstacleId, mut param: TargetParam) {
        if let Some(previous) = self.cache.get(&id) {
            if cfg!(feature = "interp-bezier") {
                // The curve already bends toward the old target; let it run.
                return;
            }
            if let Some(obstacle) = self.world.get_mut(id) {
                obstacle.set_shared(false);
                obstacle.set_linear_velocity(previous.target_vel);
                obstacle.set_angular_velocity(previous.target_ang_vel);
                obstacle.set_shared(true);
            }
            param.integral = previous.integral;
            param.num_integral = previous.num_integral;
        }
        self.stats.itpr_count += 1;
        self.stats.step_sum += param.num_steps as u64;
        self.cache.insert(id, param);
    }

    // --- Fixed update ---

    /// Per-tick work: pack dirty-bit events, decay ownership leases, and
    /// advance every in-flight interpolation by one step.
    pub fn fixed_update(&mut self) {
        self.pack_phys_obj();
        self.decay_leases();
        self.advance_interpolation();
    }

    /// Counts finite leases down. A lease reaching 1 releases the obstacle
    /// back to the host; 0 is permanent and never decays.
    fn decay_leases(&mut self) {
        let leases: Vec<(ObstacleId, u64)> = self
            .world
            .ids()
            .iter()
            .filter_map(|id| self.world.owned().get(id).map(|lease| (*id, *lease)))
            .collect();
        for (id, lease) in leases {
            if lease == 1 {
                self.release_obs(id);
            } else if lease > 1 {
                self.world.owned_mut().insert(id, lease - 1);
            }
        }
    }

    fn advance_interpolation(&mut self) {
        let mut finished: Vec<ObstacleId> = Vec::new();
        let ids: Vec<ObstacleId> = self.cache.keys().copied().collect();

        for id in ids {
            let Some(param) = self.cache.get_mut(&id) else {
                continue;
            };
            let Some(obstacle) = self.world.get_mut(id) else {
                finished.push(id);
                continue;
            };
            if !obstacle.is_shared() {
                finished.push(id);
                continue;
            }

            obstacle.set_shared(false);
            let steps_left = param.num_steps.saturating_sub(param.cur_step);
            if steps_left <= 1 {
                obstacle.set_position(param.p3);
                obstacle.set_linear_velocity(param.target_vel);
                obstacle.set_angle(param.target_angle);
                obstacle.set_angular_velocity(param.target_ang_vel);
                finished.push(id);
                self.stats.ovrd_count += 1;
            } else if cfg!(feature = "interp-bezier") {
                let t = param.cur_step as f32 / param.num_steps as f32;
                let u = 1.0 - t;
                let p1 = obstacle.position() + obstacle.linear_velocity() / 10.0;
                let position = obstacle.position() * (u * u * u)
                    + p1 * (3.0 * u * u * t)
                    + param.p2 * (3.0 * u * t * t)
                    + param.p3 * (t * t * t);
                obstacle.set_position(position);
            } else if cfg!(feature = "interp-hermite") {
                let t = param.cur_step as f32 / param.num_steps as f32;
                let t2 = t * t;
                let t3 = t2 * t;
                let position = obstacle.position() * (2.0 * t3 - 3.0 * t2 + 1.0)
                    + obstacle.linear_velocity() * (t3 - 2.0 * t2 + t)
                    + param.p3 * (-2.0 * t3 + 3.0 * t2)
                    + param.target_vel * (t3 - t2);
                obstacle.set_position(position);
            } else if cfg!(feature = "interp-pid") {
                let error = param.p3 - obstacle.position();
                param.num_integral += 1;
                param.integral += error;
                let proportional = error * 10.0;
                let integral = param.integral * 0.01;
                let derivative = obstacle.linear_velocity() * 0.5;
                obstacle.set_linear_velocity(
                    obstacle.linear_velocity() + proportional - derivative + integral,
                );
            } else {
                obstacle.set_x(interpolate(steps_left, param.p3.x, obstacle.x()));
                obstacle.set_y(interpolate(steps_left, param.p3.y, obstacle.y()));
                obstacle.set_vx(interpolate(steps_left, param.target_vel.x, obstacle.vx()));
                obstacle.set_vy(interpolate(steps_left, param.target_vel.y, obstacle.vy()));
            }

            if steps_left > 1 {
                obstacle.set_angle(interpolate(steps_left, param.target_angle, obstacle.angle()));
                obstacle.set_angular_velocity(interpolate(
                    steps_left,
                    param.target_ang_vel,
                    obstacle.angular_velocity(),
                ));
                param.cur_step += 1;
            }
            obstacle.set_shared(true);
        }

        if !finished.is_empty() {
            for id in &finished {
                self.cache.remove(id);
            }
            debug!(finished = finished.len(), "interpolations completed");
        }
    }
}

/// One step of per-axis convergence: `(target - source) / steps + source`.
#[inline]
fn interpolate(steps_left: u32, target: f32, source: f32) -> f32 {
    (target - source) / steps_left as f32 + source
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use netphys_core::{SharedShape, WorldBounds};
    use netphys_protocol::Serializer;

    /// Factory used across tests: params are `(x, y)` as two f32s.
    struct BallFactory;

    impl ObstacleFactory for BallFactory {
        fn create_obstacle(&self, params: &[u8]) -> (Obstacle, Option<Box<dyn RenderNode>>) {
            let mut d = netphys_protocol::Deserializer::new(params);
            let mut obstacle = Obstacle::new(SharedShape::ball(0.5));
            obstacle.set_position(Vec2::new(d.read_f32(), d.read_f32()));
            (obstacle, None)
        }
    }

    fn ball_params(x: f32, y: f32) -> Vec<u8> {
        let mut s = Serializer::new();
        s.write_f32(x);
        s.write_f32(y);
        s.finish()
    }

    fn empty_world(is_host: bool) -> ObstacleWorld {
        let mut world = ObstacleWorld::new(WorldBounds::new(0.0, 0.0, 100.0, 100.0));
        world.set_gravity(Vec2::ZERO);
        world.set_short_uid(if is_host { 1 } else { 2 });
        world.set_host(is_host);
        world
    }

    fn controller(is_host: bool) -> NetPhysicsController {
        let mut controller = NetPhysicsController::new(empty_world(is_host), is_host, None);
        controller.attach_factory(Box::new(BallFactory));
        controller
    }

    fn shared_ball(controller: &mut NetPhysicsController, x: f32, y: f32) -> ObstacleId {
        let mut obstacle = Obstacle::new(SharedShape::ball(0.5));
        obstacle.set_position(Vec2::new(x, y));
        obstacle.set_shared(true);
        let id = controller.world_mut().add_obstacle(obstacle);
        controller.world_mut().get_mut(id).unwrap().clear_dirty();
        id
    }

    fn snapshot_event(id: ObstacleId, position: Vec2, velocity: Vec2) -> PhysSyncEvent {
        let mut event = PhysSyncEvent::new();
        event.add_snapshot(ObjSnapshot {
            id,
            position,
            velocity,
            angle: 0.0,
            angular_velocity: 0.0,
        });
        event
    }

    #[test]
    fn linear_interpolation_converges_exactly() {
        let mut client = controller(false);
        let id = shared_ball(&mut client, 0.0, 0.0);

        let event = snapshot_event(id, Vec2::new(1.5, 0.0), Vec2::ZERO);
        client.process_phys_sync_event(&event, "peer-1");

        let target = client.interpolation_target(id).unwrap();
        assert_eq!(target.num_steps, 30);

        for _ in 0..30 {
            client.fixed_update();
        }

        let obstacle = client.world().get(id).unwrap();
        assert_eq!(obstacle.position(), Vec2::new(1.5, 0.0));
        assert_eq!(obstacle.linear_velocity(), Vec2::ZERO);
        assert!(!client.is_in_sync(id));
        assert_eq!(client.stats().itpr_count, 1);
        assert_eq!(client.stats().ovrd_count, 1);
    }

    #[test]
    fn tiny_errors_interpolate_in_one_step() {
        let mut client = controller(false);
        let id = shared_ball(&mut client, 10.0, 10.0);

        let event = snapshot_event(id, Vec2::new(10.01, 10.0), Vec2::ZERO);
        client.process_phys_sync_event(&event, "peer-1");
        assert_eq!(client.interpolation_target(id).unwrap().num_steps, 1);

        client.fixed_update();
        assert_eq!(
            client.world().get(id).unwrap().position(),
            Vec2::new(10.01, 10.0)
        );
        assert!(!client.is_in_sync(id));
    }

    #[test]
    fn snapshots_are_idempotent() {
        let mut client = controller(false);
        let id = shared_ball(&mut client, 0.0, 0.0);
        let event = snapshot_event(id, Vec2::new(3.0, 4.0), Vec2::new(1.0, 0.0));

        client.process_phys_sync_event(&event, "peer-1");
        let first = client.interpolation_target(id).unwrap().clone();

        client.process_phys_sync_event(&event, "peer-1");
        let second = client.interpolation_target(id).unwrap().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn self_echoes_are_ignored() {
        let mut client = controller(false);
        let id = shared_ball(&mut client, 0.0, 0.0);

        let event = snapshot_event(id, Vec2::new(5.0, 5.0), Vec2::ZERO);
        client.process_phys_sync_event(&event, "");
        assert!(!client.is_in_sync(id));

        let delete = PhysObjEvent::deletion(id);
        client.process_phys_obj_event(&delete, "");
        assert!(client.world().contains(id));
    }

    #[test]
    fn unknown_ids_are_skipped() {
        let mut client = controller(false);
        let ghost = ObstacleId::from_raw(0xDEAD);

        client.process_phys_sync_event(&snapshot_event(ghost, Vec2::ONE, Vec2::ZERO), "peer-1");
        assert!(!client.is_in_sync(ghost));

        client.process_phys_obj_event(&PhysObjEvent::position(ghost, Vec2::ONE), "peer-1");
        assert!(client.world().is_empty());
    }

    #[test]
    fn pack_phys_obj_clears_dirty_bits_in_order() {
        let mut host = controller(true);
        let id = shared_ball(&mut host, 5.0, 5.0);

        {
            let obstacle = host.world_mut().get_mut(id).unwrap();
            obstacle.set_linear_velocity(Vec2::new(1.0, 0.0));
            obstacle.set_position(Vec2::new(6.0, 5.0));
            obstacle.set_angle(0.5);
        }
        host.pack_phys_obj();

        let events = host.take_out_events();
        let kinds: Vec<PhysObjEvent> = events
            .iter()
            .filter_map(|e| e.as_any().downcast_ref::<PhysObjEvent>().cloned())
            .collect();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(kinds[0].kind, PhysObjKind::Position(_)));
        assert!(matches!(kinds[1].kind, PhysObjKind::Angle(_)));
        assert!(matches!(kinds[2].kind, PhysObjKind::Velocity(_)));

        assert!(host.world().get(id).unwrap().dirty().is_empty());
        host.pack_phys_obj();
        assert!(host.take_out_events().is_empty());
    }

    #[test]
    fn full_sync_covers_owned_shared_obstacles_only() {
        let mut host = controller(true);
        let owned = shared_ball(&mut host, 1.0, 1.0);
        let foreign = shared_ball(&mut host, 2.0, 2.0);
        // Someone else acquired this one.
        host.world_mut().owned_mut().remove(&foreign);

        host.pack_phys_sync(SyncType::FullSync);
        let events = host.take_out_events();
        let sync = events[0].as_any().downcast_ref::<PhysSyncEvent>().unwrap();
        assert_eq!(sync.len(), 1);
        assert_eq!(sync.snapshots()[0].id, owned);

        host.pack_phys_sync(SyncType::OverrideFullSync);
        let events = host.take_out_events();
        let sync = events[0].as_any().downcast_ref::<PhysSyncEvent>().unwrap();
        assert_eq!(sync.len(), 2);
    }

    #[test]
    fn prio_sync_deduplicates_the_rotation_window() {
        let mut host = controller(true);
        for n in 0..3 {
            let id = shared_ball(&mut host, 1.0 + n as f32, 1.0);
            host.world_mut()
                .get_mut(id)
                .unwrap()
                .set_linear_velocity(Vec2::new(n as f32, 0.0));
        }

        host.pack_phys_sync(SyncType::PrioSync);
        let events = host.take_out_events();
        let sync = events[0].as_any().downcast_ref::<PhysSyncEvent>().unwrap();
        // Three by speed plus the rotation window, minus duplicates.
        assert_eq!(sync.len(), 3);
        // Fastest first.
        assert_eq!(sync.snapshots()[0].velocity.x, 2.0);
    }

    #[test]
    fn remote_creation_goes_through_the_factory() {
        let mut host = controller(true);
        let id = ObstacleId::new(2, 0);
        let event = PhysObjEvent::creation(id, 0, ball_params(7.0, 8.0));

        host.process_phys_obj_event(&event, "peer-2");

        let obstacle = host.world().get(id).expect("obstacle created");
        assert_eq!(obstacle.position(), Vec2::new(7.0, 8.0));
        assert!(obstacle.is_shared());
        // The host records ownership of remotely created obstacles.
        assert_eq!(host.world().owned().get(&id), Some(&0));
    }

    #[test]
    fn shared_creation_replicates_to_a_peer() {
        let mut host = controller(true);
        let mut client = controller(false);

        let id = host
            .add_shared_obstacle(0, ball_params(4.0, 4.0))
            .expect("factory registered");
        let events = host.take_out_events();
        let creation = events[0].as_any().downcast_ref::<PhysObjEvent>().unwrap();

        client.process_phys_obj_event(creation, "peer-1");
        assert!(client.world().contains(id));
        // Clients do not own what the host created.
        assert!(!client.world().owned().contains_key(&id));
    }

    #[test]
    fn remote_state_changes_do_not_redirty() {
        let mut client = controller(false);
        let id = shared_ball(&mut client, 1.0, 1.0);

        client.process_phys_obj_event(&PhysObjEvent::position(id, Vec2::new(9.0, 9.0)), "peer-1");

        let obstacle = client.world().get(id).unwrap();
        assert_eq!(obstacle.position(), Vec2::new(9.0, 9.0));
        assert!(obstacle.is_shared());
        assert!(obstacle.dirty().is_empty());
    }

    #[test]
    fn lease_counts_down_and_releases() {
        let mut client = controller(false);
        let id = shared_ball(&mut client, 1.0, 1.0);

        client.acquire_obs(id, 3);
        assert_eq!(client.world().owned().get(&id), Some(&3));
        client.take_out_events(); // drop the acquire event

        client.fixed_update();
        assert_eq!(client.world().owned().get(&id), Some(&2));
        client.fixed_update();
        assert_eq!(client.world().owned().get(&id), Some(&1));
        client.fixed_update();
        assert!(!client.world().owned().contains_key(&id));

        let events = client.take_out_events();
        let releases: Vec<_> = events
            .iter()
            .filter_map(|e| e.as_any().downcast_ref::<PhysObjEvent>())
            .filter(|e| matches!(e.kind, PhysObjKind::OwnerRelease))
            .collect();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].id, id);
    }

    #[test]
    fn host_acquires_permanently() {
        let mut host = controller(true);
        let id = shared_ball(&mut host, 1.0, 1.0);
        host.world_mut().owned_mut().remove(&id);

        host.acquire_obs(id, 5);
        assert_eq!(host.world().owned().get(&id), Some(&0));
        host.fixed_update();
        assert_eq!(host.world().owned().get(&id), Some(&0));
    }

    #[test]
    fn ownership_transfer_round_trip() {
        let mut host = controller(true);
        let mut client = controller(false);

        // Same obstacle known on both sides.
        let id = host
            .add_shared_obstacle(0, ball_params(2.0, 2.0))
            .unwrap();
        let events = host.take_out_events();
        let creation = events[0].as_any().downcast_ref::<PhysObjEvent>().unwrap();
        client.process_phys_obj_event(creation, "peer-1");
        assert_eq!(host.world().owned().get(&id), Some(&0));

        // Client acquires for 2 ticks; host yields.
        client.acquire_obs(id, 2);
        let events = client.take_out_events();
        let acquire = events[0].as_any().downcast_ref::<PhysObjEvent>().unwrap();
        host.process_phys_obj_event(acquire, "peer-2");
        assert!(!host.world().owned().contains_key(&id));

        // Lease expires; the release hands it back to the host.
        client.fixed_update();
        client.fixed_update();
        let events = client.take_out_events();
        let release = events
            .iter()
            .filter_map(|e| e.as_any().downcast_ref::<PhysObjEvent>())
            .find(|e| matches!(e.kind, PhysObjKind::OwnerRelease))
            .expect("release emitted");
        host.process_phys_obj_event(release, "peer-2");
        assert_eq!(host.world().owned().get(&id), Some(&0));
    }

    #[test]
    fn own_all_takes_everything() {
        let mut host = controller(true);
        let a = shared_ball(&mut host, 1.0, 1.0);
        let b = shared_ball(&mut host, 2.0, 2.0);
        host.world_mut().owned_mut().clear();

        host.own_all();
        assert_eq!(host.world().owned().get(&a), Some(&0));
        assert_eq!(host.world().owned().get(&b), Some(&0));
    }

    #[test]
    fn retarget_snaps_to_previous_target_velocity() {
        let mut client = controller(false);
        let id = shared_ball(&mut client, 0.0, 0.0);

        let first = snapshot_event(id, Vec2::new(10.0, 0.0), Vec2::new(4.0, 0.0));
        client.process_phys_sync_event(&first, "peer-1");
        client.fixed_update();

        let second = snapshot_event(id, Vec2::new(12.0, 0.0), Vec2::new(6.0, 0.0));
        client.process_phys_sync_event(&second, "peer-1");

        // Velocity snapped to the first snapshot's target velocity when the
        // new target replaced it.
        let obstacle = client.world().get(id).unwrap();
        assert_eq!(obstacle.linear_velocity(), Vec2::new(4.0, 0.0));
        let target = client.interpolation_target(id).unwrap();
        assert_eq!(target.cur_step, 0);
        assert_eq!(target.target_vel, Vec2::new(6.0, 0.0));
    }

    struct FlagNode(Rc<Cell<bool>>);

    impl RenderNode for FlagNode {
        fn detach(&mut self) {
            self.0.set(true);
        }
    }

    /// Factory that attaches a node whose detach flips a flag.
    struct NodeFactory(Rc<Cell<bool>>);

    impl ObstacleFactory for NodeFactory {
        fn create_obstacle(&self, params: &[u8]) -> (Obstacle, Option<Box<dyn RenderNode>>) {
            let mut d = netphys_protocol::Deserializer::new(params);
            let mut obstacle = Obstacle::new(SharedShape::ball(0.5));
            obstacle.set_position(Vec2::new(d.read_f32(), d.read_f32()));
            (obstacle, Some(Box::new(FlagNode(self.0.clone()))))
        }
    }

    #[test]
    fn deletion_detaches_the_render_node() {
        let detached = Rc::new(Cell::new(false));
        let linked = Rc::new(Cell::new(0u32));
        let linked_count = linked.clone();

        let mut client = NetPhysicsController::new(
            empty_world(false),
            false,
            Some(Box::new(move |_, _, node| {
                if node.is_some() {
                    linked_count.set(linked_count.get() + 1);
                }
            })),
        );
        client.attach_factory(Box::new(NodeFactory(detached.clone())));

        let id = ObstacleId::new(1, 0);
        client.process_phys_obj_event(
            &PhysObjEvent::creation(id, 0, ball_params(3.0, 3.0)),
            "peer-1",
        );
        assert_eq!(linked.get(), 1);
        assert!(!detached.get());

        client.process_phys_obj_event(&PhysObjEvent::deletion(id), "peer-1");
        assert!(!client.world().contains(id));
        assert!(detached.get());
    }
}

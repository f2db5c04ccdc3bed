//! End-to-end tests: two controllers over the in-memory transport, from
//! lobby connect through shared physics.

use assert_approx_eq::assert_approx_eq;
use glam::Vec2;
use netphys_core::{Obstacle, ObstacleFactory, ObstacleWorld, RenderNode, SharedShape, WorldBounds};
use netphys_protocol::{Deserializer, Serializer};
use netphys_session::{
    MemoryTransport, NetConfig, NetEventController, SessionStatus, SyncType,
};

type Controller = NetEventController<MemoryTransport>;

/// Factory shared by every peer: params are `(x, y)` as two f32s.
struct BallFactory;

impl ObstacleFactory for BallFactory {
    fn create_obstacle(&self, params: &[u8]) -> (Obstacle, Option<Box<dyn RenderNode>>) {
        let mut d = Deserializer::new(params);
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

fn world() -> ObstacleWorld {
    let mut world = ObstacleWorld::new(WorldBounds::new(0.0, 0.0, 100.0, 100.0));
    world.set_gravity(Vec2::ZERO);
    world
}

fn pump(peers: &mut [&mut Controller], rounds: usize) {
    for _ in 0..rounds {
        for peer in peers.iter_mut() {
            peer.update_net();
        }
    }
}

/// Connects a host and one client, finishes the handshake, and enables
/// physics with the standard factory on both sides.
fn physics_session(lobby: &str) -> (Controller, Controller) {
    let config = NetConfig::new(lobby, 9000, 4);
    let mut host = NetEventController::new(config.clone());
    assert!(host.connect_as_host());
    let room = host.room_id().to_string();

    let mut client = NetEventController::new(config);
    assert!(client.connect_as_client(&room));

    host.start_game();
    pump(&mut [&mut host, &mut client], 2);
    assert_eq!(host.short_uid(), 1);
    assert_eq!(client.short_uid(), 2);

    host.enable_physics(world(), None);
    client.enable_physics(world(), None);
    host.physics_mut().unwrap().attach_factory(Box::new(BallFactory));
    client.physics_mut().unwrap().attach_factory(Box::new(BallFactory));

    assert!(host.mark_ready());
    assert!(client.mark_ready());
    pump(&mut [&mut host, &mut client], 6);
    assert_eq!(host.status(), SessionStatus::InGame);
    assert_eq!(client.status(), SessionStatus::InGame);

    (host, client)
}

#[test]
fn shared_creation_reaches_the_client() {
    let (mut host, mut client) = physics_session("e2e-create");

    let id = host
        .physics_mut()
        .unwrap()
        .add_shared_obstacle(0, ball_params(5.0, 5.0))
        .unwrap();
    pump(&mut [&mut host, &mut client], 1);

    let client_world = client.physics().unwrap().world();
    let obstacle = client_world.get(id).expect("creation replicated");
    assert_eq!(obstacle.position(), Vec2::new(5.0, 5.0));
    assert!(obstacle.is_shared());
    // Only the host owns it.
    assert!(!client_world.owned().contains_key(&id));
    assert!(host.physics().unwrap().world().owned().contains_key(&id));
}

#[test]
fn explicit_mutations_replicate_exactly() {
    let (mut host, mut client) = physics_session("e2e-mutate");

    let id = host
        .physics_mut()
        .unwrap()
        .add_shared_obstacle(0, ball_params(5.0, 5.0))
        .unwrap();
    pump(&mut [&mut host, &mut client], 1);

    host.physics_mut()
        .unwrap()
        .world_mut()
        .get_mut(id)
        .unwrap()
        .set_position(Vec2::new(10.0, 10.0));
    pump(&mut [&mut host, &mut client], 1);

    // Object events apply immediately, no interpolation involved.
    let obstacle = client.physics().unwrap().world().get(id).unwrap();
    assert_eq!(obstacle.position(), Vec2::new(10.0, 10.0));
}

#[test]
fn snapshots_pull_the_client_toward_the_host() {
    let (mut host, mut client) = physics_session("e2e-snapshots");

    let id = host
        .physics_mut()
        .unwrap()
        .add_shared_obstacle(0, ball_params(10.0, 10.0))
        .unwrap();
    pump(&mut [&mut host, &mut client], 1);

    // The host simulates actual movement; the client never steps its world
    // and relies purely on the host's per-tick full sync.
    host.physics_mut()
        .unwrap()
        .world_mut()
        .get_mut(id)
        .unwrap()
        .set_linear_velocity(Vec2::new(2.0, 0.0));
    for _ in 0..30 {
        host.update_net();
        host.physics_mut().unwrap().world_mut().update(1.0 / 60.0);
        client.update_net();
    }

    // Freeze the host body, then give the client time to converge.
    {
        let physics = host.physics_mut().unwrap();
        let obstacle = physics.world_mut().get_mut(id).unwrap();
        obstacle.set_linear_velocity(Vec2::ZERO);
    }
    pump(&mut [&mut host, &mut client], 35);

    let host_pos = host.physics().unwrap().world().get(id).unwrap().position();
    let client_pos = client.physics().unwrap().world().get(id).unwrap().position();
    assert!(host_pos.x > 10.5, "host body did not move: {host_pos:?}");
    assert_approx_eq!(client_pos.x, host_pos.x, 0.05);
    assert_approx_eq!(client_pos.y, host_pos.y, 0.05);
}

#[test]
fn ownership_lease_round_trip() {
    let (mut host, mut client) = physics_session("e2e-ownership");

    let id = host
        .physics_mut()
        .unwrap()
        .add_shared_obstacle(0, ball_params(5.0, 5.0))
        .unwrap();
    pump(&mut [&mut host, &mut client], 1);

    // Client acquires for five ticks. The acquire goes out on the client's
    // next tick and the host yields on the tick after that.
    client.physics_mut().unwrap().acquire_obs(id, 5);
    pump(&mut [&mut host, &mut client], 2);
    assert!(!host.physics().unwrap().world().owned().contains_key(&id));
    assert!(client.physics().unwrap().world().owned().contains_key(&id));

    // The lease decays once per client tick and auto-releases; the host
    // then re-inserts a permanent lease.
    pump(&mut [&mut host, &mut client], 6);
    assert!(!client.physics().unwrap().world().owned().contains_key(&id));
    assert_eq!(host.physics().unwrap().world().owned().get(&id), Some(&0));
}

#[test]
fn deletion_reaches_the_client() {
    let (mut host, mut client) = physics_session("e2e-delete");

    let id = host
        .physics_mut()
        .unwrap()
        .add_shared_obstacle(0, ball_params(5.0, 5.0))
        .unwrap();
    pump(&mut [&mut host, &mut client], 1);
    assert!(client.physics().unwrap().world().contains(id));

    host.physics_mut().unwrap().remove_shared_obstacle(id);
    pump(&mut [&mut host, &mut client], 1);
    assert!(!client.physics().unwrap().world().contains(id));
    assert!(!host.physics().unwrap().world().contains(id));
}

#[test]
fn override_sync_repairs_a_desynced_client() {
    let (mut host, mut client) = physics_session("e2e-override");

    let id = host
        .physics_mut()
        .unwrap()
        .add_shared_obstacle(0, ball_params(20.0, 20.0))
        .unwrap();
    pump(&mut [&mut host, &mut client], 1);

    // Someone else owns the body, so the host's steady-state full sync
    // skips it. Let the client's in-flight interpolation drain first.
    host.physics_mut().unwrap().world_mut().owned_mut().remove(&id);
    pump(&mut [&mut host, &mut client], 2);

    // The client drifts with nothing correcting it.
    {
        let physics = client.physics_mut().unwrap();
        let obstacle = physics.world_mut().get_mut(id).unwrap();
        obstacle.set_shared(false);
        obstacle.set_position(Vec2::new(40.0, 40.0));
        obstacle.set_shared(true);
    }
    pump(&mut [&mut host, &mut client], 2);
    let drifted = client.physics().unwrap().world().get(id).unwrap().position();
    assert_eq!(drifted, Vec2::new(40.0, 40.0));

    // An explicit override full sync covers unowned obstacles too.
    host.physics_mut().unwrap().pack_phys_sync(SyncType::OverrideFullSync);
    pump(&mut [&mut host, &mut client], 35);

    let repaired = client.physics().unwrap().world().get(id).unwrap().position();
    assert!(
        (repaired - Vec2::new(20.0, 20.0)).length() < 0.01,
        "client not repaired: {repaired:?}"
    );
}

//! Snapshot events: the kinematic state of a selected set of obstacles.

use std::any::Any;
use std::collections::HashSet;

use glam::Vec2;
use netphys_core::{Obstacle, ObstacleId};

use crate::event::{DecodeError, NetEvent};
use crate::serialize::{Deserializer, Serializer};

/// Wire size of one snapshot record: id + six floats.
const RECORD_BYTES: usize = 8 + 6 * 4;

/// One obstacle's kinematic state at the sender's tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjSnapshot {
    pub id: ObstacleId,
    pub position: Vec2,
    pub velocity: Vec2,
    pub angle: f32,
    pub angular_velocity: f32,
}

/// Periodic state broadcast consumed by the synchronizer's interpolation.
/// Only the runtime builds these; custom game data belongs in custom events.
#[derive(Debug, Clone, Default)]
pub struct PhysSyncEvent {
    snapshots: Vec<ObjSnapshot>,
    seen: HashSet<ObstacleId>,
}

impl PhysSyncEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots the obstacle's current state. A second add for the same ID
    /// is ignored; a single event never carries duplicates.
    pub fn add_obstacle(&mut self, id: ObstacleId, obstacle: &Obstacle) {
        self.add_snapshot(ObjSnapshot {
            id,
            position: obstacle.position(),
            velocity: obstacle.linear_velocity(),
            angle: obstacle.angle(),
            angular_velocity: obstacle.angular_velocity(),
        });
    }

    pub fn add_snapshot(&mut self, snapshot: ObjSnapshot) {
        if !self.seen.insert(snapshot.id) {
            return;
        }
        self.snapshots.push(snapshot);
    }

    pub fn snapshots(&self) -> &[ObjSnapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl NetEvent for PhysSyncEvent {
    fn serialize(&self) -> Vec<u8> {
        let mut s = Serializer::new();
        s.write_u64(self.snapshots.len() as u64);
        for snap in &self.snapshots {
            s.write_u64(snap.id.raw());
            s.write_f32(snap.position.x);
            s.write_f32(snap.position.y);
            s.write_f32(snap.velocity.x);
            s.write_f32(snap.velocity.y);
            s.write_f32(snap.angle);
            s.write_f32(snap.angular_velocity);
        }
        s.finish()
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        if data.len() < 8 {
            return Err(DecodeError::Truncated {
                got: data.len(),
                need: 8,
            });
        }
        self.snapshots.clear();
        self.seen.clear();

        let mut d = Deserializer::new(data);
        let count = d.read_u64();
        // Never trust the count further than the payload actually reaches.
        let available = (d.remaining().len() / RECORD_BYTES) as u64;
        for _ in 0..count.min(available) {
            let snapshot = ObjSnapshot {
                id: ObstacleId::from_raw(d.read_u64()),
                position: Vec2::new(d.read_f32(), d.read_f32()),
                velocity: Vec2::new(d.read_f32(), d.read_f32()),
                angle: d.read_f32(),
                angular_velocity: d.read_f32(),
            };
            self.add_snapshot(snapshot);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u64, x: f32) -> ObjSnapshot {
        ObjSnapshot {
            id: ObstacleId::from_raw(id),
            position: Vec2::new(x, x + 1.0),
            velocity: Vec2::new(-x, 0.25),
            angle: 0.5 * x,
            angular_velocity: -1.5,
        }
    }

    #[test]
    fn snapshots_roundtrip() {
        let mut event = PhysSyncEvent::new();
        event.add_snapshot(snapshot(0x0000_0001_0000_0000, 1.0));
        event.add_snapshot(snapshot(0x0000_0002_0000_0005, 2.0));

        let mut decoded = PhysSyncEvent::default();
        decoded.deserialize(&event.serialize()).unwrap();
        assert_eq!(decoded.snapshots(), event.snapshots());
    }

    #[test]
    fn duplicate_ids_are_dropped_by_the_sender() {
        let mut event = PhysSyncEvent::new();
        event.add_snapshot(snapshot(7, 1.0));
        event.add_snapshot(snapshot(7, 99.0));
        assert_eq!(event.len(), 1);
        assert_eq!(event.snapshots()[0].position.x, 1.0);
    }

    #[test]
    fn empty_event_is_eight_bytes() {
        let event = PhysSyncEvent::new();
        let bytes = event.serialize();
        assert_eq!(bytes.len(), 8);

        let mut decoded = PhysSyncEvent::default();
        decoded.deserialize(&bytes).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn lying_count_is_clamped_to_payload() {
        let mut s = Serializer::new();
        s.write_u64(u64::MAX);
        let mut decoded = PhysSyncEvent::default();
        decoded.deserialize(&s.finish()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut decoded = PhysSyncEvent::default();
        assert!(matches!(
            decoded.deserialize(&[0, 0, 0]),
            Err(DecodeError::Truncated { .. })
        ));
    }
}

//! Netphys Core - Shared Obstacle World
//!
//! This crate holds the rigid-body side of the networked physics runtime:
//! the [`Obstacle`] record with its replication dirty bits, and the
//! [`ObstacleWorld`] registry that assigns session-unique 64-bit IDs,
//! tracks ownership leases, and pumps the underlying 2D solver.
//!
//! All cross-component references go through [`ObstacleId`] / [`JointId`].
//! Solver handles never leave this crate.

pub mod bounds;
pub mod factory;
pub mod id;
pub mod obstacle;
pub mod world;

pub use bounds::WorldBounds;
pub use factory::{ObstacleFactory, RenderNode};
pub use id::{JointId, ObstacleId};
pub use obstacle::{BodyFlags, BodyParams, BodyType, Obstacle, StateBits};
pub use world::{JointDef, JointSet, ObstacleWorld, PlacedJointSet};

// Consumers build shapes and joint definitions with the solver's own types.
pub use rapier2d;
pub use rapier2d::geometry::SharedShape;

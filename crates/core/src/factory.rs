//! Obstacle factories and the renderer hook.
//!
//! Creation of a shared obstacle is replicated by sending a factory index
//! plus that factory's serialized parameters, never body or texture data.
//! Every peer must register the same factories in the same order.

use crate::obstacle::Obstacle;

/// A renderable scene node linked to an obstacle. The runtime only needs to
/// detach the node when the obstacle it follows is deleted; everything else
/// is the host application's business.
pub trait RenderNode {
    /// Remove this node from its parent in the scene graph.
    fn detach(&mut self);
}

/// Builds an obstacle (and optionally its scene node) from serialized
/// parameters.
///
/// Typical parameters are a position, a size, and whatever metadata the
/// obstacle needs; the factory decides the encoding. Returning `None` for
/// the node leaves scene linking entirely to the caller.
pub trait ObstacleFactory {
    fn create_obstacle(&self, params: &[u8]) -> (Obstacle, Option<Box<dyn RenderNode>>);
}

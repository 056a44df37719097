//! # sift_math - Broadphase Math Primitives
//!
//! Vector and axis-aligned bounding-box arithmetic for spatial indexing.
//! Small on purpose: only what a broadphase needs, kept cache-friendly.

pub mod bounds;
pub mod vector;

pub use bounds::Aabb;
pub use vector::Vec3;

/// Componentwise epsilon used for near-degenerate comparisons
pub const EPSILON: f32 = 1e-6;

/// Default margin added around tree node bounds to absorb small movements
pub const AABB_MARGIN: f32 = 0.02;

pub mod prelude {
    pub use crate::bounds::Aabb;
    pub use crate::vector::Vec3;
    pub use crate::{AABB_MARGIN, EPSILON};
}

//! Axis-aligned bounding boxes for spatial queries

use crate::vector::Vec3;

/// Axis-Aligned Bounding Box
///
/// A valid box satisfies `min <= max` componentwise. [`Aabb::EMPTY`] is the
/// inverted box (min = +inf, max = -inf); it contains nothing and is the
/// identity of [`Aabb::union`].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// The empty (inverted) box, absorbing under union
    pub const EMPTY: Self = Self {
        min: Vec3::INFINITY,
        max: Vec3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
    };

    /// Create from min and max points
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create from center and half-extents
    #[inline]
    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// Get the center point
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size (full extents)
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Get the volume
    #[inline]
    pub fn volume(&self) -> f32 {
        let size = self.size();
        size.x * size.y * size.z
    }

    /// Get the surface area
    #[inline]
    pub fn surface_area(&self) -> f32 {
        let size = self.size();
        2.0 * (size.x * size.y + size.y * size.z + size.z * size.x)
    }

    /// Check if the box is valid (min <= max)
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Check if the box is empty (inverted on any axis)
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Union of two boxes
    #[inline]
    pub fn union(&self, other: &Aabb) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Intersection of two boxes (may come out inverted when disjoint)
    #[inline]
    pub fn intersection(&self, other: &Aabb) -> Self {
        Self {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// Expand uniformly in all directions
    #[inline]
    pub fn expanded(&self, amount: f32) -> Self {
        Self {
            min: self.min - Vec3::splat(amount),
            max: self.max + Vec3::splat(amount),
        }
    }

    /// Check if a point is inside
    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.x >= self.min.x && point.x <= self.max.x
            && point.y >= self.min.y && point.y <= self.max.y
            && point.z >= self.min.z && point.z <= self.max.z
    }

    /// Check if another box is fully contained
    #[inline]
    pub fn contains_aabb(&self, other: &Aabb) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    /// Check if two boxes intersect
    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x
            && self.min.y <= other.max.y && self.max.y >= other.min.y
            && self.min.z <= other.max.z && self.max.z >= other.min.z
    }

    /// Slab test against a ray segment.
    ///
    /// `inv_dir` is the componentwise reciprocal of the *unnormalized*
    /// direction (end - start), so the returned parameters are fractions of
    /// the segment: 0.0 at the start, 1.0 at the end. Zero direction
    /// components must be replaced with a large finite value by the caller so
    /// the products below stay finite. `signs[i]` is 1 where `inv_dir` is
    /// negative; ordering the slab bounds by sign keeps near <= far per axis.
    ///
    /// Returns `(near, far)` with near clamped to 0, or `None` when the
    /// segment misses the box, the box lies behind the start, or the entry
    /// point lies beyond `cut`.
    pub fn slab_ray_test(
        &self,
        origin: Vec3,
        inv_dir: Vec3,
        signs: [usize; 3],
        cut: f32,
    ) -> Option<(f32, f32)> {
        let bounds = [self.min.to_array(), self.max.to_array()];
        let ro = origin.to_array();
        let inv = inv_dir.to_array();

        let mut near = f32::NEG_INFINITY;
        let mut far = f32::INFINITY;
        for i in 0..3 {
            let t_near = (bounds[signs[i]][i] - ro[i]) * inv[i];
            let t_far = (bounds[1 - signs[i]][i] - ro[i]) * inv[i];
            near = near.max(t_near);
            far = far.min(t_far);
        }

        if near > far || far < 0.0 || near > cut {
            return None;
        }

        Some((near.max(0.0), far))
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

//! Query callbacks shared by every index
//!
//! A query is a callback object handed to an index. The index streams
//! candidate entities through the user closure; for rays the closure's
//! return value feeds back into the traversal by shortening the ray.

use sift_math::{Aabb, Vec3};

use crate::types::{Entity, Mask};

/// AABB query state: the query box, the admission mask, per-query counters
/// and the user closure receiving every intersecting entity.
pub struct AabbCallback<'a> {
    /// Query box
    pub aabb: Aabb,
    /// Admission mask; candidates need a non-zero AND with it
    pub mask: Mask,
    /// Internal tree nodes tested against the query box
    pub nodes_tested: usize,
    /// Entity boxes tested against the query box
    pub tested: usize,
    handler: &'a mut dyn FnMut(Entity),
}

impl<'a> AabbCallback<'a> {
    pub fn new(aabb: Aabb, mask: Mask, handler: &'a mut dyn FnMut(Entity)) -> Self {
        Self {
            aabb,
            mask,
            nodes_tested: 0,
            tested: 0,
            handler,
        }
    }

    /// Test a subtree box against the query box
    #[inline]
    pub fn is_relevant(&self, aabb: &Aabb) -> bool {
        self.aabb.intersects(aabb)
    }

    /// Test an entity box and invoke the user closure on intersection.
    /// Returns whether the closure ran.
    #[inline]
    pub fn execute_if_relevant(&mut self, aabb: &Aabb, entity: Entity) -> bool {
        self.tested += 1;
        if self.aabb.intersects(aabb) {
            (self.handler)(entity);
            true
        } else {
            false
        }
    }
}

/// Verdict returned by a ray-query closure for one candidate.
///
/// `dist` is a fraction of the original segment: 0.0 at the start, 1.0 at
/// the end. Reporting a hit with `dist` below the current cut shortens the
/// ray so farther candidates can be pruned; `dist` is clamped into [0, 1]
/// first, so a hit can never lengthen the ray. Returning `dist` 0.0
/// terminates the traversal as early as the tree allows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHitResult {
    pub dist: f32,
    pub hit: bool,
}

impl RayHitResult {
    /// The candidate was not actually intersected
    #[inline]
    pub const fn miss() -> Self {
        Self {
            dist: 1.0,
            hit: false,
        }
    }

    /// The candidate was intersected at `dist` along the segment
    #[inline]
    pub const fn hit_at(dist: f32) -> Self {
        Self { dist, hit: true }
    }
}

/// Ray (segment) query state.
///
/// Holds the segment, its derived vectors, the admission mask and the
/// current cut factor (1.0 = full segment, shrinking as hits come in).
/// Derived vectors are computed once per query behind an idempotent guard.
pub struct RayCallback<'a> {
    /// Segment start
    pub start: Vec3,
    /// Segment end
    pub end: Vec3,
    /// Admission mask; candidates need a non-zero AND with it
    pub mask: Mask,
    /// Fraction of the segment beyond which candidates are pruned
    pub cut_factor: f32,
    /// Internal tree nodes tested against the ray
    pub nodes_tested: usize,
    /// Entity boxes tested against the ray
    pub tested: usize,
    /// Closure invocations that reported a hit
    pub hits: usize,
    dir: Vec3,
    dir_normalized: Vec3,
    inv_dir: Vec3,
    signs: [usize; 3],
    length: f32,
    inited: bool,
    handler: &'a mut dyn FnMut(Entity) -> RayHitResult,
}

impl<'a> RayCallback<'a> {
    pub fn new(
        start: Vec3,
        end: Vec3,
        mask: Mask,
        handler: &'a mut dyn FnMut(Entity) -> RayHitResult,
    ) -> Self {
        Self {
            start,
            end,
            mask,
            cut_factor: 1.0,
            nodes_tested: 0,
            tested: 0,
            hits: 0,
            dir: Vec3::ZERO,
            dir_normalized: Vec3::ZERO,
            inv_dir: Vec3::ZERO,
            signs: [0; 3],
            length: 0.0,
            inited: false,
            handler,
        }
    }

    /// Compute the derived ray vectors. Called by every index at query
    /// entry; only the first call does work.
    pub fn init_derived(&mut self) {
        if self.inited {
            return;
        }
        self.inited = true;

        self.dir = self.end - self.start;
        self.length = self.dir.length();
        self.dir_normalized = self.dir.normalize();

        // Reciprocal of the unnormalized direction, so slab parameters come
        // out as fractions of the segment. Zero components get a huge finite
        // stand-in instead of infinity to keep the slab products NaN-free.
        let d = self.dir.to_array();
        let mut inv = [0.0f32; 3];
        for i in 0..3 {
            inv[i] = if d[i] == 0.0 { 1e18 } else { 1.0 / d[i] };
        }
        self.inv_dir = Vec3::new(inv[0], inv[1], inv[2]);
        self.signs = [
            (inv[0] < 0.0) as usize,
            (inv[1] < 0.0) as usize,
            (inv[2] < 0.0) as usize,
        ];
    }

    /// Unnormalized direction (end - start)
    #[inline]
    pub fn dir(&self) -> Vec3 {
        self.dir
    }

    /// Unit direction
    #[inline]
    pub fn dir_normalized(&self) -> Vec3 {
        self.dir_normalized
    }

    /// Segment length in world units
    #[inline]
    pub fn length(&self) -> f32 {
        self.length
    }

    /// Point at fraction `t` of the segment
    #[inline]
    pub fn point_at(&self, t: f32) -> Vec3 {
        self.start + self.dir * t
    }

    /// Slab-test a subtree box against the segment, pruned by the current
    /// cut factor. Returns the entry/exit fractions on success.
    #[inline]
    pub fn is_relevant(&self, aabb: &Aabb) -> Option<(f32, f32)> {
        aabb.slab_ray_test(self.start, self.inv_dir, self.signs, self.cut_factor)
    }

    /// Slab-test an entity box; on success run the user closure and absorb
    /// its verdict into the cut factor. Returns whether the closure ran.
    pub fn execute_if_relevant(&mut self, aabb: &Aabb, entity: Entity) -> bool {
        if self.is_relevant(aabb).is_none() {
            return false;
        }
        self.tested += 1;

        let result = (self.handler)(entity);
        if result.hit {
            self.hits += 1;
            let dist = result.dist.clamp(0.0, 1.0);
            if dist < self.cut_factor {
                self.cut_factor = dist;
            }
        }
        true
    }
}

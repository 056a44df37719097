//! The common index contract
//!
//! Every spatial index implements [`Broadphase`]; the three-stage
//! orchestrator composes indexes through it as trait objects.

use sift_math::Aabb;

use crate::callbacks::{AabbCallback, RayCallback};
use crate::types::{Entity, IndexEntry, Mask};

/// Uniform contract over the spatial indexes.
///
/// Mutation preconditions follow a single rule: `add` requires the entity to
/// be absent, everything else requires it present. Violations are debug
/// assertions; release builds treat them as benign no-ops and lookups on
/// missing entities return zero values ([`Aabb::EMPTY`], mask 0).
///
/// Queries take `&mut self` because lazily-maintained indexes rebuild on
/// first read.
pub trait Broadphase {
    /// Short static identifier for diagnostics and test output
    fn name(&self) -> &'static str;

    /// Drop all records, keeping buffers
    fn clear(&mut self);

    /// Approximate heap footprint in bytes
    fn memory_usage(&self) -> usize;

    /// Return spare capacity to the allocator
    fn shrink_to_fit(&mut self);

    /// Hint: a burst of adds follows; index maintenance may be deferred
    /// until [`Broadphase::stop_fast_adding`]
    fn start_fast_adding(&mut self) {}

    /// Hint: the burst of adds is over
    fn stop_fast_adding(&mut self) {}

    /// Add a record. The entity must not exist yet.
    fn add(&mut self, entity: Entity, aabb: Aabb, mask: Mask);

    /// Replace an existing record's box
    fn update(&mut self, entity: Entity, aabb: Aabb);

    /// Remove an existing record
    fn remove(&mut self, entity: Entity);

    /// Replace an existing record's mask, repropagating where applicable
    fn set_mask(&mut self, entity: Entity, mask: Mask);

    /// Live record count
    fn count(&self) -> usize;

    /// Check whether a record exists
    fn exists(&self, entity: Entity) -> bool;

    /// Last stored box, or [`Aabb::EMPTY`] for a missing entity
    fn get_aabb(&self, entity: Entity) -> Aabb;

    /// Last stored mask, or 0 for a missing entity
    fn get_mask(&self, entity: Entity) -> Mask;

    /// Implementation-defined batch optimisation
    fn rebuild(&mut self);

    /// Stream every entity whose box intersects the query box into the
    /// callback's closure
    fn intersect_aabb(&mut self, callback: &mut AabbCallback<'_>);

    /// Stream every entity whose box intersects the segment into the
    /// callback's closure, honouring in-flight cut-factor updates
    fn intersect_ray(&mut self, callback: &mut RayCallback<'_>);

    /// Visit every live record exactly once, in implementation-defined
    /// order. The borrow freezes the index, so mutations cannot invalidate
    /// a live iterator; to restart, call `iter` again.
    fn iter(&self) -> Box<dyn Iterator<Item = IndexEntry> + '_>;
}

//! Entity handles, masks and iteration records

use sift_math::Aabb;

/// Opaque entity handle chosen by the caller.
///
/// The library never invents or reuses handles; it only stores them. The
/// value 0 is reserved as [`EMPTY_ENTITY`] and must not be added.
pub type Entity = u64;

/// Reserved handle marking an empty record slot
pub const EMPTY_ENTITY: Entity = 0;

/// Query/entity filter bitfield.
///
/// A query admits a candidate only when `query_mask & entity_mask != 0`, so
/// an entity with mask 0 is invisible to every query.
pub type Mask = u32;

/// One live record as yielded by [`crate::Broadphase::iter`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexEntry {
    pub entity: Entity,
    pub aabb: Aabb,
    pub mask: Mask,
}

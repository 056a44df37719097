//! Median-split BVH in heap layout
//!
//! Bulk-built tree over a flat entity array. Nodes live in an implicit heap
//! (root at 1, children of `i` at `2i`/`2i+1`); a node's entity range is
//! derived from its heap index, so nodes store only the subtree box and the
//! OR of subtree masks. `SKIP_LOW_LAYERS` collapses the bottom layers of the
//! heap: leaf-adjacent nodes then address a group of `2 << SKIP_LOW_LAYERS`
//! records which the traversal scans linearly. That halves node memory per
//! skipped layer and trades it for redundant leaf tests.

use sift_math::{Aabb, AABB_MARGIN};
use sift_structures::DenseSparseMap;

use crate::broadphase::Broadphase;
use crate::callbacks::{AabbCallback, RayCallback};
use crate::types::{Entity, IndexEntry, Mask, EMPTY_ENTITY};

/// What `update` does to the tree.
///
/// Extending never shrinks node boxes, so a long-lived index under churn
/// drifts toward pessimistic bounds; a periodic [`MedianSplitBvh::rebuild`]
/// (or an orchestrator that schedules one) is the remedy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AabbUpdatePolicy {
    /// Widen the boxes along the heap path to cover the new box; no rebuild
    #[default]
    ExtendAabb,
    /// Defer: mark the tree dirty and rebuild on the next query
    RebuildOnNextRead,
}

#[derive(Clone, Copy, Debug, Default)]
struct EntityData {
    aabb: Aabb,
    entity: Entity,
    mask: Mask,
}

#[derive(Clone, Copy, Debug, Default)]
struct HeapNode {
    aabb: Aabb,
    mask: Mask,
}

/// Incremental-rebuild cursor for [`MedianSplitBvh::rebuild_step`].
///
/// Create one with `Default::default()` and feed it to `rebuild_step` until
/// it reports completion; each call performs a bounded slice of the rebuild.
#[derive(Clone, Debug)]
pub struct RebuildProgress {
    stack: [usize; 64],
    size: usize,
    stage: u32,
    it: usize,
    done: bool,
}

impl Default for RebuildProgress {
    fn default() -> Self {
        Self {
            stack: [0; 64],
            size: 0,
            stage: 0,
            it: 0,
            done: false,
        }
    }
}

impl RebuildProgress {
    /// Whether the rebuild this cursor tracks has finished
    #[inline]
    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Heap-layout BVH bulk-built by median split along the longest axis.
///
/// Adding marks the tree dirty; queries rebuild lazily. Updates follow the
/// configured [`AabbUpdatePolicy`]. The tree is perfectly balanced because
/// the leaf count is padded to the next power of two.
pub struct MedianSplitBvh<const SKIP_LOW_LAYERS: u32 = 0> {
    /// Entity -> offset into `entities`; -1 marks absence
    offsets: DenseSparseMap<i32>,
    /// Heap of subtree bounds; index 0 unused
    nodes: Vec<HeapNode>,
    entities: Vec<EntityData>,
    /// Live records (the entity array may contain holes between rebuilds)
    count: usize,
    pow2_count: usize,
    dirty: bool,
    policy: AabbUpdatePolicy,
    margin: f32,
}

/// One collapsed bottom layer: leaf groups of 4
pub type MedianSplitBvh1 = MedianSplitBvh<1>;
/// Two collapsed bottom layers: leaf groups of 8
pub type MedianSplitBvh2 = MedianSplitBvh<2>;

impl<const SKIP_LOW_LAYERS: u32> MedianSplitBvh<SKIP_LOW_LAYERS> {
    /// Create an index whose handle table keeps handles up to
    /// `dense_entity_range` in its dense section
    pub fn new(dense_entity_range: Entity) -> Self {
        Self {
            offsets: DenseSparseMap::new(dense_entity_range, -1),
            nodes: Vec::new(),
            entities: Vec::new(),
            count: 0,
            pow2_count: 0,
            dirty: false,
            policy: AabbUpdatePolicy::default(),
            margin: AABB_MARGIN,
        }
    }

    pub fn set_aabb_update_policy(&mut self, policy: AabbUpdatePolicy) {
        self.policy = policy;
    }

    pub fn aabb_update_policy(&self) -> AabbUpdatePolicy {
        self.policy
    }

    /// Margin added around node bounds during rebuild and path propagation
    pub fn set_margin(&mut self, margin: f32) {
        self.margin = margin;
    }

    /// Entities addressed by one collapsed leaf node
    #[inline]
    fn group_size() -> usize {
        2usize << SKIP_LOW_LAYERS
    }

    fn prune_empty_tail(&mut self) {
        while let Some(last) = self.entities.last() {
            if last.entity != EMPTY_ENTITY {
                return;
            }
            self.entities.pop();
        }
    }

    fn resize_nodes(&mut self) {
        let len = if SKIP_LOW_LAYERS > 0 {
            self.pow2_count >> SKIP_LOW_LAYERS
        } else {
            self.pow2_count / 2 + (self.count + 1) / 2
        };
        self.nodes.resize(len, HeapNode::default());
    }

    /// Recompute the leaf group containing `offset` and push the result up
    /// the heap path, widening ancestors as it goes
    fn update_aabb_path(&mut self, offset: usize) {
        if self.nodes.is_empty() {
            return;
        }

        let mut mask: Mask = 0;
        let mut aabb = Aabb::EMPTY;
        for i in 0..Self::group_size() {
            let o = offset ^ i;
            if let Some(ed) = self.entities.get(o) {
                if ed.entity != EMPTY_ENTITY && ed.mask != 0 {
                    aabb = aabb.union(&ed.aabb);
                    mask |= ed.mask;
                }
            }
        }
        let mut aabb = aabb.expanded(self.margin);

        let mut n = (offset + self.pow2_count) >> (1 + SKIP_LOW_LAYERS);
        while n > 0 {
            if let Some(node) = self.nodes.get_mut(n) {
                node.aabb = aabb;
                node.mask = mask;
            }
            let sibling = n ^ 1;
            if sibling > 0 && sibling < self.nodes.len() {
                let sib = self.nodes[sibling];
                if sib.mask != 0 {
                    aabb = if mask != 0 { aabb.union(&sib.aabb) } else { sib.aabb };
                    mask |= sib.mask;
                }
            }
            n >>= 1;
        }
    }

    fn compact_entities(&mut self) {
        self.prune_empty_tail();
        let mut i = 0;
        while i + 1 < self.entities.len() {
            if self.entities[i].entity == EMPTY_ENTITY {
                let last = self.entities.len() - 1;
                self.entities.swap(i, last);
                self.prune_empty_tail();
            }
            i += 1;
        }
    }

    /// Build the node at `node`: derive its entity range from the heap
    /// index, write its bounds/mask, and either register leaf offsets or
    /// partition the range around the median of the longest axis.
    ///
    /// Returns the first child to continue with (when there is more to do)
    /// and the number of records touched, for work accounting.
    fn rebuild_node_partial(&mut self, node: usize) -> (Option<usize>, usize) {
        let mut offset = node;
        let mut count = 1usize;
        while offset < self.pow2_count {
            offset <<= 1;
            count <<= 1;
        }
        let org_count = count;
        offset -= self.pow2_count;
        if offset >= self.entities.len() {
            return (None, 0);
        }
        let count = count.min(self.entities.len() - offset);
        if count == 0 {
            return (None, 0);
        }

        let mut total = self.entities[offset].aabb;
        let mut mask = self.entities[offset].mask;
        for ed in &self.entities[offset + 1..offset + count] {
            total = total.union(&ed.aabb);
            mask |= ed.mask;
        }

        if node < self.nodes.len() {
            self.nodes[node] = HeapNode {
                aabb: total.expanded(self.margin),
                mask,
            };
        }

        if count <= Self::group_size() {
            for i in offset..offset + count {
                let entity = self.entities[i].entity;
                self.offsets.set(entity, i as i32);
            }
            let next = if org_count <= 2 { None } else { Some(node << 1) };
            return (next, count);
        }

        let axis = total.size().largest_axis();
        let mid = org_count >> 1;
        if mid < count {
            self.entities[offset..offset + count].select_nth_unstable_by(mid, |l, r| {
                l.aabb
                    .center()
                    .axis(axis)
                    .partial_cmp(&r.aabb.center().axis(axis))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        (Some(node << 1), count)
    }

    fn rebuild_node(&mut self, node: usize) {
        let (next, _) = self.rebuild_node_partial(node);
        if let Some(child) = next {
            if child > 1 && child < self.nodes.len() {
                self.rebuild_node(child);
                if child + 1 < self.nodes.len() {
                    self.rebuild_node(child + 1);
                }
            }
        }
    }

    /// Advance an incremental rebuild by one bounded slice of work.
    ///
    /// Returns true once the rebuild is complete. The stages mirror
    /// [`MedianSplitBvh::rebuild`]: size the heap, clear node masks, reserve
    /// the handle table, compact the entity array, then expand build nodes
    /// from an explicit stack.
    pub fn rebuild_step(&mut self, progress: &mut RebuildProgress) -> bool {
        if progress.done {
            return true;
        }

        match progress.stage {
            0 => {
                self.dirty = false;
                self.pow2_count = self.count.next_power_of_two().max(2);
                self.resize_nodes();
                progress.stage = 1;
                progress.it = 0;
            }
            1 => {
                let end = (progress.it + 1024).min(self.nodes.len());
                for node in &mut self.nodes[progress.it..end] {
                    node.mask = 0;
                }
                progress.it = end;
                if progress.it >= self.nodes.len() {
                    progress.stage = 2;
                }
            }
            2 => {
                self.offsets.reserve(self.count);
                progress.stage = 3;
            }
            3 => {
                self.prune_empty_tail();
                progress.it = 0;
                progress.stage = 4;
            }
            4 => {
                for _ in 0..4096 {
                    if progress.it + 1 >= self.entities.len() {
                        break;
                    }
                    if self.entities[progress.it].entity == EMPTY_ENTITY {
                        let last = self.entities.len() - 1;
                        self.entities.swap(progress.it, last);
                        self.prune_empty_tail();
                    }
                    progress.it += 1;
                }
                if progress.it + 1 >= self.entities.len() {
                    progress.size = 1;
                    progress.stack[0] = 1;
                    progress.stage = 5;
                }
            }
            5 => {
                let mut work = 0usize;
                while work < 300 && progress.size > 0 {
                    work += 1;
                    progress.size -= 1;
                    let id = progress.stack[progress.size];
                    let (next, touched) = self.rebuild_node_partial(id);
                    if let Some(child) = next {
                        progress.stack[progress.size] = child + 1;
                        progress.stack[progress.size + 1] = child;
                        progress.size += 2;
                    }
                    work += touched;
                }
                if progress.size == 0 {
                    progress.stage = 6;
                }
            }
            _ => {
                progress.done = true;
            }
        }
        progress.done
    }

    fn query_aabb_node(&self, cb: &mut AabbCallback<'_>, node: usize) {
        let n = node << 1;

        if n >= self.pow2_count {
            // Bottom of the heap: the node addresses an entity pair
            let start = n - self.pow2_count;
            let end = (start + 2).min(self.entities.len());
            for ed in self.entities.get(start..end).unwrap_or(&[]) {
                if ed.mask & cb.mask != 0 && ed.entity != EMPTY_ENTITY {
                    cb.execute_if_relevant(&ed.aabb, ed.entity);
                }
            }
        } else if SKIP_LOW_LAYERS > 0 && n >= self.nodes.len() {
            // Collapsed layers: scan the whole leaf group linearly
            let start = (n << SKIP_LOW_LAYERS) - self.pow2_count;
            if start >= self.entities.len() {
                return;
            }
            let end = (start + Self::group_size()).min(self.entities.len());
            for ed in &self.entities[start..end] {
                if ed.mask & cb.mask != 0 && ed.entity != EMPTY_ENTITY {
                    cb.execute_if_relevant(&ed.aabb, ed.entity);
                }
            }
        } else {
            for i in 0..2 {
                let child = n + i;
                if child >= self.nodes.len() {
                    break;
                }
                if self.nodes[child].mask & cb.mask != 0 {
                    cb.nodes_tested += 1;
                    if cb.is_relevant(&self.nodes[child].aabb) {
                        self.query_aabb_node(cb, child);
                    }
                }
            }
        }
    }

    fn query_ray_node(&self, cb: &mut RayCallback<'_>, node: usize) {
        let n = node << 1;

        if n >= self.pow2_count {
            let start = n - self.pow2_count;
            let end = (start + 2).min(self.entities.len());
            for ed in self.entities.get(start..end).unwrap_or(&[]) {
                if ed.mask & cb.mask != 0 && ed.entity != EMPTY_ENTITY {
                    cb.execute_if_relevant(&ed.aabb, ed.entity);
                }
            }
        } else if SKIP_LOW_LAYERS > 0 && n >= self.nodes.len() {
            let start = (n << SKIP_LOW_LAYERS) - self.pow2_count;
            if start >= self.entities.len() {
                return;
            }
            let end = (start + Self::group_size()).min(self.entities.len());
            for ed in &self.entities[start..end] {
                if ed.mask & cb.mask != 0 && ed.entity != EMPTY_ENTITY {
                    cb.execute_if_relevant(&ed.aabb, ed.entity);
                }
            }
        } else {
            let mut nears = [0.0f32; 2];
            let mut relevant = 0usize;
            for i in 0..2 {
                let child = n + i;
                if child >= self.nodes.len() {
                    break;
                }
                if self.nodes[child].mask & cb.mask != 0 {
                    cb.nodes_tested += 1;
                    if let Some((near, _)) = cb.is_relevant(&self.nodes[child].aabb) {
                        nears[i] = near;
                        relevant += i + 1;
                    }
                }
            }
            match relevant {
                1 => self.query_ray_node(cb, n),
                2 => self.query_ray_node(cb, n + 1),
                3 => {
                    // Both children hit: descend nearer-first, then revisit
                    // the sibling only if it still starts within the cut
                    if nears[1] < nears[0] {
                        self.query_ray_node(cb, n + 1);
                        if nears[0] <= cb.cut_factor {
                            self.query_ray_node(cb, n);
                        }
                    } else {
                        self.query_ray_node(cb, n);
                        if nears[1] <= cb.cut_factor {
                            self.query_ray_node(cb, n + 1);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl<const SKIP_LOW_LAYERS: u32> Broadphase for MedianSplitBvh<SKIP_LOW_LAYERS> {
    fn name(&self) -> &'static str {
        match SKIP_LOW_LAYERS {
            0 => "median_split_bvh",
            1 => "median_split_bvh_skip1",
            2 => "median_split_bvh_skip2",
            _ => "median_split_bvh_skip_n",
        }
    }

    fn clear(&mut self) {
        self.entities.clear();
        self.nodes.clear();
        self.offsets.clear();
        self.dirty = false;
        self.count = 0;
        self.pow2_count = 0;
    }

    fn memory_usage(&self) -> usize {
        self.offsets.memory_usage()
            + self.nodes.capacity() * std::mem::size_of::<HeapNode>()
            + self.entities.capacity() * std::mem::size_of::<EntityData>()
    }

    fn shrink_to_fit(&mut self) {
        self.nodes.shrink_to_fit();
        self.entities.shrink_to_fit();
        self.offsets.shrink_to_fit();
    }

    fn add(&mut self, entity: Entity, aabb: Aabb, mask: Mask) {
        debug_assert_ne!(entity, EMPTY_ENTITY, "entity handle 0 is reserved");
        if self.offsets.has(entity) {
            debug_assert!(false, "entity {entity} already exists");
            return;
        }
        self.offsets.set(entity, self.entities.len() as i32);
        self.entities.push(EntityData { aabb, entity, mask });
        self.dirty = true;
        self.count += 1;
    }

    fn update(&mut self, entity: Entity, aabb: Aabb) {
        let Some(offset) = self.offsets.find(entity) else {
            return;
        };
        let offset = offset as usize;
        self.entities[offset].aabb = aabb;
        if self.policy == AabbUpdatePolicy::ExtendAabb && !self.dirty {
            self.update_aabb_path(offset);
        } else {
            self.dirty = true;
        }
    }

    fn remove(&mut self, entity: Entity) {
        let Some(offset) = self.offsets.find(entity) else {
            return;
        };
        let offset = offset as usize;
        self.offsets.remove(entity);
        self.entities[offset].entity = EMPTY_ENTITY;
        self.entities[offset].mask = 0;
        self.count -= 1;

        if self.count == 0 {
            self.clear();
            return;
        }

        self.prune_empty_tail();
        if !self.dirty {
            self.update_aabb_path(offset);
        }
    }

    fn set_mask(&mut self, entity: Entity, mask: Mask) {
        let Some(offset) = self.offsets.find(entity) else {
            return;
        };
        let offset = offset as usize;
        if self.entities[offset].mask == mask {
            return;
        }
        self.entities[offset].mask = mask;

        if self.dirty || self.nodes.is_empty() {
            // The next rebuild folds the new mask in
            return;
        }

        let mut mask = mask;
        for i in 1..Self::group_size() {
            let o = offset ^ i;
            if let Some(ed) = self.entities.get(o) {
                if ed.entity != EMPTY_ENTITY {
                    mask |= ed.mask;
                }
            }
        }

        let mut n = (offset + self.pow2_count) >> (1 + SKIP_LOW_LAYERS);
        while n > 0 {
            if let Some(node) = self.nodes.get_mut(n) {
                node.mask = mask;
            }
            let sibling = n ^ 1;
            if sibling > 0 && sibling < self.nodes.len() {
                mask |= self.nodes[sibling].mask;
            }
            n >>= 1;
        }
    }

    fn count(&self) -> usize {
        self.count
    }

    fn exists(&self, entity: Entity) -> bool {
        self.offsets.has(entity)
    }

    fn get_aabb(&self, entity: Entity) -> Aabb {
        match self.offsets.find(entity) {
            Some(offset) => self.entities[offset as usize].aabb,
            None => Aabb::EMPTY,
        }
    }

    fn get_mask(&self, entity: Entity) -> Mask {
        match self.offsets.find(entity) {
            Some(offset) => self.entities[offset as usize].mask,
            None => 0,
        }
    }

    fn rebuild(&mut self) {
        self.dirty = false;
        // Pad to at least two leaves so the root's child offsets stay valid
        // for a single-entity tree
        self.pow2_count = self.count.next_power_of_two().max(2);
        self.resize_nodes();
        for node in &mut self.nodes {
            node.mask = 0;
        }
        self.offsets.reserve(self.count);
        self.compact_entities();
        self.rebuild_node(1);
    }

    fn intersect_aabb(&mut self, callback: &mut AabbCallback<'_>) {
        if self.dirty {
            self.rebuild();
        }
        self.query_aabb_node(callback, 1);
    }

    fn intersect_ray(&mut self, callback: &mut RayCallback<'_>) {
        if self.dirty {
            self.rebuild();
        }
        callback.init_derived();
        self.query_ray_node(callback, 1);
    }

    fn iter(&self) -> Box<dyn Iterator<Item = IndexEntry> + '_> {
        Box::new(
            self.entities
                .iter()
                .filter(|ed| ed.entity != EMPTY_ENTITY)
                .map(|ed| IndexEntry {
                    entity: ed.entity,
                    aabb: ed.aabb,
                    mask: ed.mask,
                }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_math::Vec3;

    fn aabb(min: [f32; 3], max: [f32; 3]) -> Aabb {
        Aabb::new(
            Vec3::new(min[0], min[1], min[2]),
            Vec3::new(max[0], max[1], max[2]),
        )
    }

    fn query_aabb<const K: u32>(bvh: &mut MedianSplitBvh<K>, q: Aabb, mask: Mask) -> Vec<Entity> {
        let mut found = Vec::new();
        let mut handler = |e: Entity| found.push(e);
        let mut cb = AabbCallback::new(q, mask, &mut handler);
        bvh.intersect_aabb(&mut cb);
        drop(cb);
        found.sort_unstable();
        found
    }

    fn grid_population<const K: u32>(bvh: &mut MedianSplitBvh<K>, n: u64) {
        for e in 1..=n {
            let x = (e % 10) as f32 * 4.0;
            let y = ((e / 10) % 10) as f32 * 4.0;
            let z = (e / 100) as f32 * 4.0;
            bvh.add(
                e,
                aabb([x, y, z], [x + 1.0, y + 1.0, z + 1.0]),
                1 << (e % 8),
            );
        }
    }

    #[test]
    fn test_add_and_query() {
        let mut bvh: MedianSplitBvh = MedianSplitBvh::new(100);
        bvh.add(1, aabb([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]), 1);
        bvh.add(2, aabb([2.0, 0.0, 0.0], [3.0, 1.0, 1.0]), 2);

        assert_eq!(
            query_aabb(&mut bvh, aabb([0.0, 0.0, 0.0], [3.0, 1.0, 1.0]), 3),
            vec![1, 2]
        );
        assert_eq!(
            query_aabb(&mut bvh, aabb([0.5, 0.5, 0.5], [0.9, 0.9, 0.9]), 3),
            vec![1]
        );
    }

    #[test]
    fn test_mask_filter() {
        let mut bvh: MedianSplitBvh = MedianSplitBvh::new(100);
        bvh.add(1, aabb([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]), 1);
        bvh.add(2, aabb([2.0, 0.0, 0.0], [3.0, 1.0, 1.0]), 2);

        let all = aabb([-1.0, -1.0, -1.0], [4.0, 2.0, 2.0]);
        assert_eq!(query_aabb(&mut bvh, all, 1), vec![1]);
        assert_eq!(query_aabb(&mut bvh, all, 2), vec![2]);
        assert_eq!(query_aabb(&mut bvh, all, 0), Vec::<Entity>::new());
    }

    #[test]
    fn test_update_extends_path() {
        let mut bvh: MedianSplitBvh = MedianSplitBvh::new(100);
        grid_population(&mut bvh, 32);
        // Build once so the extend policy operates on a clean tree
        bvh.rebuild();

        bvh.update(5, aabb([100.0, 100.0, 100.0], [101.0, 101.0, 101.0]));
        let found = query_aabb(&mut bvh, aabb([99.0, 99.0, 99.0], [102.0, 102.0, 102.0]), !0);
        assert_eq!(found, vec![5]);
    }

    #[test]
    fn test_update_rebuild_policy() {
        let mut bvh: MedianSplitBvh = MedianSplitBvh::new(100);
        bvh.set_aabb_update_policy(AabbUpdatePolicy::RebuildOnNextRead);
        grid_population(&mut bvh, 32);
        bvh.rebuild();

        bvh.update(5, aabb([100.0, 100.0, 100.0], [101.0, 101.0, 101.0]));
        // Old location no longer reports the entity after the deferred rebuild
        let x = (5 % 10) as f32 * 4.0;
        let old = query_aabb(&mut bvh, aabb([x, 0.0, 0.0], [x + 1.0, 1.0, 1.0]), !0);
        assert!(!old.contains(&5));
    }

    #[test]
    fn test_remove_and_requery() {
        let mut bvh: MedianSplitBvh = MedianSplitBvh::new(200);
        grid_population(&mut bvh, 100);
        for e in (2..=100).step_by(2) {
            bvh.remove(e);
        }

        assert_eq!(bvh.count(), 50);
        let found = query_aabb(&mut bvh, aabb([-10.0, -10.0, -10.0], [50.0, 50.0, 50.0]), !0);
        assert_eq!(found, (1..=100).step_by(2).collect::<Vec<_>>());
        assert!(!bvh.exists(2));
        assert!(bvh.exists(3));
    }

    #[test]
    fn test_skip_layer_variants_agree() {
        let mut plain: MedianSplitBvh = MedianSplitBvh::new(200);
        let mut skip1: MedianSplitBvh1 = MedianSplitBvh::new(200);
        let mut skip2: MedianSplitBvh2 = MedianSplitBvh::new(200);
        grid_population(&mut plain, 100);
        grid_population(&mut skip1, 100);
        grid_population(&mut skip2, 100);

        let q = aabb([3.0, 3.0, -1.0], [9.0, 9.0, 2.0]);
        let expected = query_aabb(&mut plain, q, !0);
        assert!(!expected.is_empty());
        assert_eq!(query_aabb(&mut skip1, q, !0), expected);
        assert_eq!(query_aabb(&mut skip2, q, !0), expected);
    }

    #[test]
    fn test_rebuild_step_matches_rebuild() {
        let mut stepped: MedianSplitBvh = MedianSplitBvh::new(200);
        let mut bulk: MedianSplitBvh = MedianSplitBvh::new(200);
        grid_population(&mut stepped, 150);
        grid_population(&mut bulk, 150);

        bulk.rebuild();
        let mut progress = RebuildProgress::default();
        let mut steps = 0;
        while !stepped.rebuild_step(&mut progress) {
            steps += 1;
            assert!(steps < 10_000, "rebuild_step failed to converge");
        }
        assert!(progress.is_done());

        let q = aabb([2.0, 2.0, -1.0], [20.0, 20.0, 3.0]);
        assert_eq!(query_aabb(&mut stepped, q, !0), query_aabb(&mut bulk, q, !0));
    }

    #[test]
    fn test_ray_nearest_first() {
        let mut bvh: MedianSplitBvh = MedianSplitBvh::new(100);
        bvh.add(1, aabb([5.0, -1.0, -1.0], [6.0, 1.0, 1.0]), 1);
        bvh.add(2, aabb([10.0, -1.0, -1.0], [11.0, 1.0, 1.0]), 1);

        let mut order = Vec::new();
        let mut handler = |e: Entity| {
            order.push(e);
            // Accept every hit at its entry distance to tighten the cut
            crate::callbacks::RayHitResult::hit_at(if e == 1 { 0.25 } else { 0.5 })
        };
        let mut cb = RayCallback::new(
            Vec3::ZERO,
            Vec3::new(20.0, 0.0, 0.0),
            1,
            &mut handler,
        );
        bvh.intersect_ray(&mut cb);
        let cut = cb.cut_factor;
        drop(cb);

        assert_eq!(order[0], 1);
        approx::assert_relative_eq!(cut, 0.25);
    }

    #[test]
    fn test_iterator_visits_each_once() {
        let mut bvh: MedianSplitBvh = MedianSplitBvh::new(100);
        grid_population(&mut bvh, 20);
        bvh.remove(7);

        let mut seen: Vec<Entity> = bvh.iter().map(|e| e.entity).collect();
        seen.sort_unstable();
        let expected: Vec<Entity> = (1..=20).filter(|e| *e != 7).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_empty_index_queries() {
        let mut bvh: MedianSplitBvh = MedianSplitBvh::new(10);
        assert_eq!(
            query_aabb(&mut bvh, aabb([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]), !0),
            Vec::<Entity>::new()
        );
        assert_eq!(bvh.count(), 0);
        assert_eq!(bvh.get_mask(1), 0);
        assert_eq!(bvh.get_aabb(1), Aabb::EMPTY);
    }
}

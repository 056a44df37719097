//! Dynamic BVH with per-insert placement and local rotations
//!
//! Accepts point mutations without bulk rebuilds: insertion descends toward
//! the child whose box grows least, removal collapses the parent into the
//! sibling, and a small table of canonical subtree rotations keeps the tree
//! from degenerating under adversarial insertion orders.

use std::collections::HashMap;
use std::mem::size_of;

use sift_math::Aabb;
use sift_structures::NodePool;

use crate::broadphase::Broadphase;
use crate::callbacks::{AabbCallback, RayCallback};
use crate::types::{Entity, IndexEntry, Mask, EMPTY_ENTITY};

/// Link from an inner node to one of its two subtrees
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Child {
    /// No subtree; only the root may carry empty slots
    #[default]
    Empty,
    /// Inner node, by offset into the node pool
    Node(u32),
    /// Entity record, by offset into the leaf pool
    Leaf(u32),
}

/// Inner node. `aabb[i]` caches the bounds of the subtree under
/// `children[i]`; `mask` is the OR of both subtrees' masks.
#[derive(Clone, Copy, Debug, Default)]
struct TreeNode {
    parent: u32,
    children: [Child; 2],
    aabb: [Aabb; 2],
    mask: Mask,
}

#[derive(Clone, Copy, Debug, Default)]
struct LeafData {
    aabb: Aabb,
    entity: Entity,
    mask: Mask,
    parent: u32,
}

/// Candidate subtree swaps around a node, encoded as pairs of 4-bit codes:
/// `0b0100`/`0b1000` name the node's own children, `0b01sx`/`0b10sx` name a
/// grandchild (low bit = slot). The first entry exchanges the two direct
/// children, which leaves the volume sum unchanged and so acts as the
/// keep-as-is baseline.
const ROTATIONS: [(u8, u8); 7] = [
    (0b0100, 0b1000),
    (0b0100, 0b1010),
    (0b0100, 0b1011),
    (0b0110, 0b1000),
    (0b0111, 0b1000),
    (0b0111, 0b1010),
    (0b0111, 0b1011),
];

/// Insertion depth beyond which a bounded rebalance pass runs up to the root
const DEFAULT_ROTATION_DEPTH: usize = 40;

/// Incremental BVH for churn-heavy populations.
///
/// The root node is a fixture: it is never collapsed and its child slots may
/// be empty while the tree holds fewer than two entities.
pub struct DynamicBvh {
    nodes: NodePool<TreeNode>,
    leaves: NodePool<LeafData>,
    offsets: HashMap<Entity, u32>,
    root: u32,
    rotation_depth: usize,
}

impl DynamicBvh {
    pub fn new() -> Self {
        let mut nodes = NodePool::new();
        let root = nodes.add(TreeNode::default());
        Self {
            nodes,
            leaves: NodePool::new(),
            offsets: HashMap::new(),
            root,
            rotation_depth: DEFAULT_ROTATION_DEPTH,
        }
    }

    /// Insertion depth that triggers the bounded rebalance pass
    pub fn set_rotation_depth(&mut self, depth: usize) {
        self.rotation_depth = depth;
    }

    fn set_parent(&mut self, child: Child, parent: u32) {
        match child {
            Child::Node(n) => self.nodes[n].parent = parent,
            Child::Leaf(l) => self.leaves[l].parent = parent,
            Child::Empty => debug_assert!(false, "linking an empty child"),
        }
    }

    /// Mask of a subtree as cached at its top
    fn direct_mask(&self, child: Child) -> Mask {
        match child {
            Child::Empty => 0,
            Child::Node(n) => self.nodes[n].mask,
            Child::Leaf(l) => self.leaves[l].mask,
        }
    }

    /// Bounds of a subtree from its top-level caches
    fn direct_aabb(&self, child: Child) -> Aabb {
        match child {
            Child::Empty => Aabb::EMPTY,
            Child::Leaf(l) => self.leaves[l].aabb,
            Child::Node(n) => {
                let node = &self.nodes[n];
                match (node.children[0], node.children[1]) {
                    (Child::Empty, Child::Empty) => Aabb::EMPTY,
                    (Child::Empty, _) => node.aabb[1],
                    (_, Child::Empty) => node.aabb[0],
                    _ => node.aabb[0].union(&node.aabb[1]),
                }
            }
        }
    }

    /// Which slot of `node` holds `child`
    fn slot_of(&self, node: u32, child: Child) -> usize {
        if self.nodes[node].children[0] == child {
            0
        } else {
            debug_assert!(self.nodes[node].children[1] == child, "broken parent link");
            1
        }
    }

    /// Recompute masks from `node_id` up, stopping once an ancestor's
    /// stored mask already matches the recomputation
    fn refresh_masks_from(&mut self, node_id: u32) {
        let mut mask =
            self.direct_mask(self.nodes[node_id].children[0])
                | self.direct_mask(self.nodes[node_id].children[1]);
        self.nodes[node_id].mask = mask;

        let mut child = node_id;
        let mut id = self.nodes[node_id].parent;
        while id != 0 {
            let slot = self.slot_of(id, Child::Node(child));
            let combined = mask | self.direct_mask(self.nodes[id].children[slot ^ 1]);
            if self.nodes[id].mask == combined {
                break;
            }
            self.nodes[id].mask = combined;
            mask = combined;
            child = id;
            id = self.nodes[id].parent;
        }
    }

    /// Recompute `node_id`'s child boxes and push the change upward until an
    /// ancestor's cached box already contains the result
    fn update_aabb_upward(&mut self, node_id: u32) {
        let mut aabb = Aabb::EMPTY;
        for i in 0..2 {
            let child = self.nodes[node_id].children[i];
            if child != Child::Empty {
                let boxed = self.direct_aabb(child);
                self.nodes[node_id].aabb[i] = boxed;
                aabb = aabb.union(&boxed);
            }
        }

        let mut child = node_id;
        let mut id = self.nodes[node_id].parent;
        while id != 0 {
            let slot = self.slot_of(id, Child::Node(child));
            if self.nodes[id].aabb[slot].contains_aabb(&aabb) {
                return;
            }
            self.nodes[id].aabb[slot] = aabb;
            if self.nodes[id].children[slot ^ 1] != Child::Empty {
                aabb = aabb.union(&self.nodes[id].aabb[slot ^ 1]);
            }
            self.rebalance_recursive(id, 1);
            child = id;
            id = self.nodes[child].parent;
        }
    }

    /// As [`Self::update_aabb_upward`] but also recomputing masks; used
    /// after a removal collapsed a node
    fn update_aabb_and_mask_upward(&mut self, node_id: u32) {
        let mut aabb = Aabb::EMPTY;
        let mut mask = 0;
        for i in 0..2 {
            let child = self.nodes[node_id].children[i];
            if child != Child::Empty {
                let boxed = self.direct_aabb(child);
                self.nodes[node_id].aabb[i] = boxed;
                aabb = aabb.union(&boxed);
                mask |= self.direct_mask(child);
            }
        }

        let mut child = node_id;
        let mut id = self.nodes[node_id].parent;
        while id != 0 {
            let slot = self.slot_of(id, Child::Node(child));
            let sibling_mask = self.direct_mask(self.nodes[id].children[slot ^ 1]);
            let combined = mask | sibling_mask;
            if self.nodes[id].mask == combined && self.nodes[id].aabb[slot].contains_aabb(&aabb) {
                return;
            }
            mask = combined;
            self.nodes[id].mask = mask;
            self.nodes[id].aabb[slot] = aabb;
            if self.nodes[id].children[slot ^ 1] != Child::Empty {
                aabb = aabb.union(&self.nodes[id].aabb[slot ^ 1]);
            }
            self.rebalance_recursive(id, 1);
            child = id;
            id = self.nodes[child].parent;
        }
    }

    /// Resolve a rotation operand code around `around` to (parent, slot)
    fn resolve_operand(&self, around: u32, code: u8) -> Option<(u32, usize)> {
        let side = if code & 0b0100 != 0 {
            0
        } else if code & 0b1000 != 0 {
            1
        } else {
            return None;
        };

        if code & 0b0010 == 0 {
            // The node's own child
            return Some((around, side));
        }

        // A grandchild: the child on that side must itself be an inner node
        match self.nodes[around].children[side] {
            Child::Node(parent) => Some((parent, (code & 1) as usize)),
            _ => None,
        }
    }

    /// Volume sum of `around`'s two subtrees after swapping the operands,
    /// or None when an operand does not exist
    fn rotation_cost(&self, around: u32, l: u8, r: u8) -> Option<f32> {
        let (lp, ls) = self.resolve_operand(around, l)?;
        let (rp, rs) = self.resolve_operand(around, r)?;
        if self.nodes[lp].children[ls] == Child::Empty
            || self.nodes[rp].children[rs] == Child::Empty
        {
            return None;
        }

        let la = self.nodes[lp].aabb[ls];
        let ra = self.nodes[rp].aabb[rs];

        let (v0, v1) = if lp == around && rp == around {
            // Swapping the direct children changes nothing volume-wise
            (la, ra)
        } else if lp == around {
            (ra, la.union(&self.nodes[rp].aabb[rs ^ 1]))
        } else if rp == around {
            (la, ra.union(&self.nodes[lp].aabb[ls ^ 1]))
        } else {
            (
                ra.union(&self.nodes[lp].aabb[ls ^ 1]),
                la.union(&self.nodes[rp].aabb[rs ^ 1]),
            )
        };
        Some(v0.volume() + v1.volume())
    }

    fn apply_rotation(&mut self, around: u32, l: u8, r: u8) {
        let Some((lp, ls)) = self.resolve_operand(around, l) else {
            return;
        };
        let Some((rp, rs)) = self.resolve_operand(around, r) else {
            return;
        };

        let lchild = self.nodes[lp].children[ls];
        let rchild = self.nodes[rp].children[rs];
        if lchild == Child::Empty || rchild == Child::Empty {
            return;
        }

        self.nodes[lp].children[ls] = rchild;
        self.nodes[rp].children[rs] = lchild;
        let tmp = self.nodes[lp].aabb[ls];
        self.nodes[lp].aabb[ls] = self.nodes[rp].aabb[rs];
        self.nodes[rp].aabb[rs] = tmp;
        self.set_parent(rchild, lp);
        self.set_parent(lchild, rp);

        // Refresh the caches the swap invalidated: a moved grandchild
        // changes the extent of its (former and new) parent subtree, so the
        // node's own cached child boxes and all three masks are recomputed.
        for side in 0..2 {
            if let Child::Node(p) = self.nodes[around].children[side] {
                if p == lp || p == rp {
                    self.nodes[around].aabb[side] = self.direct_aabb(Child::Node(p));
                    self.nodes[p].mask = self.direct_mask(self.nodes[p].children[0])
                        | self.direct_mask(self.nodes[p].children[1]);
                }
            }
        }
        self.nodes[around].mask = self.direct_mask(self.nodes[around].children[0])
            | self.direct_mask(self.nodes[around].children[1]);
    }

    /// Try the canonical rotations at `around` and apply the best one
    fn do_best_rotation(&mut self, around: u32) {
        if self.nodes[around].children[0] == Child::Empty
            || self.nodes[around].children[1] == Child::Empty
        {
            return;
        }

        let mut best = 0;
        let mut best_cost = self
            .rotation_cost(around, ROTATIONS[0].0, ROTATIONS[0].1)
            .unwrap_or(f32::INFINITY);
        for (i, (l, r)) in ROTATIONS.iter().enumerate().skip(1) {
            if let Some(cost) = self.rotation_cost(around, *l, *r) {
                if cost < best_cost {
                    best = i;
                    best_cost = cost;
                }
            }
        }

        if best > 0 {
            let (l, r) = ROTATIONS[best];
            self.apply_rotation(around, l, r);
        }
    }

    /// Rotate `node`, recurse `depth` levels down, rotate again on the way
    /// out. Negative depth means the whole subtree.
    fn rebalance_recursive(&mut self, node: u32, depth: i32) {
        if depth == 0 {
            return;
        }

        self.do_best_rotation(node);
        for i in 0..2 {
            if let Child::Node(child) = self.nodes[node].children[i] {
                self.rebalance_recursive(child, depth - 1);
            }
        }
        self.do_best_rotation(node);
    }

    fn rebalance_up_to_root(&mut self, start: u32, depth: i32) {
        let mut node = start;
        while node != 0 && node != self.root {
            self.rebalance_recursive(node, depth);
            node = self.nodes[node].parent;
        }
    }

    fn query_aabb_child(&self, cb: &mut AabbCallback<'_>, child: Child) {
        match child {
            Child::Empty => {}
            Child::Node(n) => {
                let node = self.nodes[n];
                if node.mask & cb.mask != 0 {
                    cb.nodes_tested += 1;
                    for i in 0..2 {
                        if node.children[i] != Child::Empty && cb.is_relevant(&node.aabb[i]) {
                            self.query_aabb_child(cb, node.children[i]);
                        }
                    }
                }
            }
            Child::Leaf(l) => {
                let leaf = self.leaves[l];
                if leaf.mask & cb.mask != 0 {
                    cb.execute_if_relevant(&leaf.aabb, leaf.entity);
                }
            }
        }
    }

    fn query_ray_child(&self, cb: &mut RayCallback<'_>, child: Child) {
        match child {
            Child::Empty => {}
            Child::Node(n) => {
                let node = self.nodes[n];
                if node.mask & cb.mask == 0 {
                    return;
                }
                let mut nears = [0.0f32; 2];
                let mut relevant = 0usize;
                for i in 0..2 {
                    if node.children[i] != Child::Empty {
                        cb.nodes_tested += 1;
                        if let Some((near, _)) = cb.is_relevant(&node.aabb[i]) {
                            nears[i] = near;
                            relevant += i + 1;
                        }
                    }
                }
                match relevant {
                    1 => self.query_ray_child(cb, node.children[0]),
                    2 => self.query_ray_child(cb, node.children[1]),
                    3 => {
                        if nears[1] < nears[0] {
                            self.query_ray_child(cb, node.children[1]);
                            if nears[0] <= cb.cut_factor {
                                self.query_ray_child(cb, node.children[0]);
                            }
                        } else {
                            self.query_ray_child(cb, node.children[0]);
                            if nears[1] <= cb.cut_factor {
                                self.query_ray_child(cb, node.children[1]);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Child::Leaf(l) => {
                let leaf = self.leaves[l];
                if leaf.mask & cb.mask != 0 {
                    cb.execute_if_relevant(&leaf.aabb, leaf.entity);
                }
            }
        }
    }
}

impl Default for DynamicBvh {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadphase for DynamicBvh {
    fn name(&self) -> &'static str {
        "dynamic_bvh"
    }

    fn clear(&mut self) {
        self.leaves.clear();
        self.offsets.clear();
        self.nodes.clear();
        self.root = self.nodes.add(TreeNode::default());
    }

    fn memory_usage(&self) -> usize {
        self.nodes.memory_usage()
            + self.leaves.memory_usage()
            + self.offsets.capacity() * (size_of::<Entity>() + size_of::<u32>())
    }

    fn shrink_to_fit(&mut self) {
        self.nodes.shrink_to_fit();
        self.leaves.shrink_to_fit();
        self.offsets.shrink_to_fit();
    }

    fn add(&mut self, entity: Entity, aabb: Aabb, mask: Mask) {
        debug_assert_ne!(entity, EMPTY_ENTITY, "entity handle 0 is reserved");
        if self.offsets.contains_key(&entity) {
            debug_assert!(false, "entity {entity} already exists");
            return;
        }

        let leaf = self.leaves.add(LeafData {
            aabb,
            entity,
            mask,
            parent: 0,
        });
        self.offsets.insert(entity, leaf);

        let root = self.root;
        for i in 0..2 {
            if self.nodes[root].children[i] == Child::Empty {
                self.nodes[root].children[i] = Child::Leaf(leaf);
                self.nodes[root].aabb[i] = aabb;
                self.nodes[root].mask |= mask;
                self.leaves[leaf].parent = root;
                return;
            }
        }

        let mut node = root;
        let mut depth = 0usize;
        loop {
            depth += 1;

            let (v0, v1) = {
                let n = &self.nodes[node];
                (
                    n.aabb[0].union(&aabb).volume(),
                    n.aabb[1].union(&aabb).volume(),
                )
            };
            let c = usize::from(v1 < v0);

            match self.nodes[node].children[c] {
                Child::Empty => {
                    debug_assert!(false, "non-root node with an empty child");
                    return;
                }
                Child::Node(next) => {
                    self.nodes[node].mask |= mask;
                    self.nodes[node].aabb[c] = self.nodes[node].aabb[c].union(&aabb);
                    node = next;
                }
                Child::Leaf(existing) => {
                    // Split the occupied slot: a fresh inner node unites the
                    // resident leaf and the new one
                    let new_id = self.nodes.add(TreeNode::default());
                    let (old_aabb, old_mask) = (self.leaves[existing].aabb, self.leaves[existing].mask);
                    {
                        let new_node = &mut self.nodes[new_id];
                        new_node.parent = node;
                        new_node.mask = old_mask | mask;
                        new_node.children[0] = Child::Leaf(existing);
                        new_node.aabb[0] = old_aabb;
                        new_node.children[1] = Child::Leaf(leaf);
                        new_node.aabb[1] = aabb;
                    }
                    {
                        let parent = &mut self.nodes[node];
                        parent.mask |= mask;
                        parent.aabb[c] = parent.aabb[c].union(&aabb);
                        parent.children[c] = Child::Node(new_id);
                    }
                    self.leaves[existing].parent = new_id;
                    self.leaves[leaf].parent = new_id;

                    if depth > self.rotation_depth {
                        self.rebalance_up_to_root(new_id, 1);
                    }
                    return;
                }
            }
        }
    }

    fn update(&mut self, entity: Entity, aabb: Aabb) {
        let Some(&leaf) = self.offsets.get(&entity) else {
            return;
        };
        self.leaves[leaf].aabb = aabb;
        let parent = self.leaves[leaf].parent;
        self.update_aabb_upward(parent);
    }

    fn remove(&mut self, entity: Entity) {
        let Some(leaf) = self.offsets.remove(&entity) else {
            return;
        };
        let id = self.leaves[leaf].parent;
        let slot = self.slot_of(id, Child::Leaf(leaf));

        if id == self.root {
            self.nodes[id].children[slot] = Child::Empty;
            let other = self.nodes[id].children[slot ^ 1];
            self.nodes[id].mask = self.direct_mask(other);
        } else {
            // Collapse: the sibling takes this node's place in the parent
            let other = self.nodes[id].children[slot ^ 1];
            let other_aabb = self.nodes[id].aabb[slot ^ 1];
            let other_mask = self.direct_mask(other);

            let parent_id = self.nodes[id].parent;
            let parent_slot = self.slot_of(parent_id, Child::Node(id));
            self.nodes[parent_id].children[parent_slot] = other;
            self.nodes[parent_id].aabb[parent_slot] = other_aabb;
            self.nodes[parent_id].mask = other_mask
                | self.direct_mask(self.nodes[parent_id].children[parent_slot ^ 1]);
            self.set_parent(other, parent_id);
            self.nodes.remove(id);
            self.update_aabb_and_mask_upward(parent_id);
        }

        self.leaves.remove(leaf);
    }

    fn set_mask(&mut self, entity: Entity, mask: Mask) {
        let Some(&leaf) = self.offsets.get(&entity) else {
            return;
        };
        self.leaves[leaf].mask = mask;
        let parent = self.leaves[leaf].parent;
        self.refresh_masks_from(parent);
    }

    fn count(&self) -> usize {
        self.offsets.len()
    }

    fn exists(&self, entity: Entity) -> bool {
        self.offsets.contains_key(&entity)
    }

    fn get_aabb(&self, entity: Entity) -> Aabb {
        match self.offsets.get(&entity) {
            Some(&leaf) => self.leaves[leaf].aabb,
            None => Aabb::EMPTY,
        }
    }

    fn get_mask(&self, entity: Entity) -> Mask {
        match self.offsets.get(&entity) {
            Some(&leaf) => self.leaves[leaf].mask,
            None => 0,
        }
    }

    fn rebuild(&mut self) {
        self.rebalance_recursive(self.root, -1);
    }

    fn intersect_aabb(&mut self, callback: &mut AabbCallback<'_>) {
        self.query_aabb_child(callback, Child::Node(self.root));
    }

    fn intersect_ray(&mut self, callback: &mut RayCallback<'_>) {
        callback.init_derived();
        self.query_ray_child(callback, Child::Node(self.root));
    }

    fn iter(&self) -> Box<dyn Iterator<Item = IndexEntry> + '_> {
        Box::new(
            self.leaves
                .raw()
                .iter()
                .filter(|leaf| leaf.entity != EMPTY_ENTITY)
                .map(|leaf| IndexEntry {
                    entity: leaf.entity,
                    aabb: leaf.aabb,
                    mask: leaf.mask,
                }),
        )
    }
}

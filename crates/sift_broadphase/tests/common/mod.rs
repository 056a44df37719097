//! Shared helpers for the integration suite

use std::collections::HashMap;

use sift_broadphase::prelude::*;

/// Linear-scan reference index. Slow and obviously correct; every tree is
/// compared against it.
pub struct BruteForce {
    records: Vec<IndexEntry>,
}

impl BruteForce {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    fn position(&self, entity: Entity) -> Option<usize> {
        self.records.iter().position(|r| r.entity == entity)
    }
}

impl Broadphase for BruteForce {
    fn name(&self) -> &'static str {
        "brute_force"
    }

    fn clear(&mut self) {
        self.records.clear();
    }

    fn memory_usage(&self) -> usize {
        self.records.capacity() * std::mem::size_of::<IndexEntry>()
    }

    fn shrink_to_fit(&mut self) {
        self.records.shrink_to_fit();
    }

    fn add(&mut self, entity: Entity, aabb: Aabb, mask: Mask) {
        debug_assert!(self.position(entity).is_none());
        self.records.push(IndexEntry { entity, aabb, mask });
    }

    fn update(&mut self, entity: Entity, aabb: Aabb) {
        if let Some(i) = self.position(entity) {
            self.records[i].aabb = aabb;
        }
    }

    fn remove(&mut self, entity: Entity) {
        if let Some(i) = self.position(entity) {
            self.records.swap_remove(i);
        }
    }

    fn set_mask(&mut self, entity: Entity, mask: Mask) {
        if let Some(i) = self.position(entity) {
            self.records[i].mask = mask;
        }
    }

    fn count(&self) -> usize {
        self.records.len()
    }

    fn exists(&self, entity: Entity) -> bool {
        self.position(entity).is_some()
    }

    fn get_aabb(&self, entity: Entity) -> Aabb {
        self.position(entity)
            .map_or(Aabb::EMPTY, |i| self.records[i].aabb)
    }

    fn get_mask(&self, entity: Entity) -> Mask {
        self.position(entity).map_or(0, |i| self.records[i].mask)
    }

    fn rebuild(&mut self) {}

    fn intersect_aabb(&mut self, callback: &mut AabbCallback<'_>) {
        for i in 0..self.records.len() {
            let record = self.records[i];
            if record.mask & callback.mask != 0 {
                callback.execute_if_relevant(&record.aabb, record.entity);
            }
        }
    }

    fn intersect_ray(&mut self, callback: &mut RayCallback<'_>) {
        callback.init_derived();
        for i in 0..self.records.len() {
            let record = self.records[i];
            if record.mask & callback.mask != 0 {
                callback.execute_if_relevant(&record.aabb, record.entity);
            }
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = IndexEntry> + '_> {
        Box::new(self.records.iter().copied())
    }
}

/// Tiny deterministic PRNG so runs are reproducible without a dependency
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    /// Uniform float in [0, 1)
    pub fn unit_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    pub fn range_f32(&mut self, lo: f32, hi: f32) -> f32 {
        lo + self.unit_f32() * (hi - lo)
    }

    pub fn below(&mut self, n: u32) -> u32 {
        self.next_u32() % n
    }
}

/// A box with random position inside the world cube and random small size
pub fn random_aabb(rng: &mut Lcg, world: f32) -> Aabb {
    let min = Vec3::new(
        rng.range_f32(-world, world),
        rng.range_f32(-world, world),
        rng.range_f32(-world, world),
    );
    let size = Vec3::new(
        rng.range_f32(0.1, 4.0),
        rng.range_f32(0.1, 4.0),
        rng.range_f32(0.1, 4.0),
    );
    Aabb::new(min, min + size)
}

/// Run an AABB query and return the sorted hit set
pub fn query_set(index: &mut dyn Broadphase, q: Aabb, mask: Mask) -> Vec<Entity> {
    let mut found = Vec::new();
    let mut handler = |e: Entity| found.push(e);
    let mut cb = AabbCallback::new(q, mask, &mut handler);
    index.intersect_aabb(&mut cb);
    drop(cb);
    found.sort_unstable();
    found.dedup();
    found
}

/// Cast a segment and return the nearest admissible hit, ties broken by the
/// smaller entity handle
pub fn ray_nearest(
    index: &mut dyn Broadphase,
    start: Vec3,
    end: Vec3,
    mask: Mask,
) -> Option<(Entity, f32)> {
    let boxes: HashMap<Entity, Aabb> = index.iter().map(|e| (e.entity, e.aabb)).collect();

    let dir = end - start;
    let d = dir.to_array();
    let mut inv = [0.0f32; 3];
    for i in 0..3 {
        inv[i] = if d[i] == 0.0 { 1e18 } else { 1.0 / d[i] };
    }
    let inv_dir = Vec3::new(inv[0], inv[1], inv[2]);
    let signs = [
        (inv[0] < 0.0) as usize,
        (inv[1] < 0.0) as usize,
        (inv[2] < 0.0) as usize,
    ];

    let mut best: Option<(Entity, f32)> = None;
    let mut handler = |entity: Entity| -> RayHitResult {
        let aabb = boxes[&entity];
        match aabb.slab_ray_test(start, inv_dir, signs, 1.0) {
            Some((near, _)) => {
                let better = match best {
                    None => true,
                    Some((be, bd)) => near < bd || (near == bd && entity < be),
                };
                if better {
                    best = Some((entity, near));
                }
                RayHitResult::hit_at(near)
            }
            None => RayHitResult::miss(),
        }
    };
    let mut cb = RayCallback::new(start, end, mask, &mut handler);
    index.intersect_ray(&mut cb);
    drop(cb);
    best
}

pub fn aabb(min: [f32; 3], max: [f32; 3]) -> Aabb {
    Aabb::new(
        Vec3::new(min[0], min[1], min[2]),
        Vec3::new(max[0], max[1], max[2]),
    )
}

//! Three-stage orchestrator
//!
//! Composes an optimised primary index, a small dynamic churn index and an
//! asynchronously rebuilt shadow of the primary. Mutations land in the
//! dynamic shard; once enough of them accumulate, a snapshot of both shards
//! is handed to the scheduler for an off-thread rebuild, and the finished
//! shadow is swapped in at the next mutation or query. Rebuild cost is thus
//! amortised away from the tick without ever locking the live indexes.

use std::collections::{HashMap, HashSet};
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use sift_math::Aabb;

use crate::broadphase::Broadphase;
use crate::callbacks::{AabbCallback, RayCallback};
use crate::dynamic_bvh::DynamicBvh;
use crate::median_split::MedianSplitBvh1;
use crate::rebuild_worker::{RebuildScheduler, RebuildTask, SharedIndex};
use crate::types::{Entity, IndexEntry, Mask};

/// Orchestrator tunables
#[derive(Clone, Copy, Debug)]
pub struct ThreeStageConfig {
    /// Mutations since the last rebuild that trigger scheduling a new one
    pub rebuild_threshold: usize,
    /// During integration, an entity whose primary and dynamic boxes differ
    /// by less than this (L1 distance over both corners, world units) is
    /// dropped from the dynamic shard in favour of the primary's copy
    pub integrate_tolerance: f32,
}

impl Default for ThreeStageConfig {
    fn default() -> Self {
        Self {
            rebuild_threshold: 100_000,
            integrate_tolerance: 1e-3,
        }
    }
}

/// Broadphase composed of (optimised, dynamic, rebuilding) shards.
///
/// Every entity lives in exactly one shard at a time. Queries fan out to the
/// dynamic shard first, then the primary, through the same callback, so
/// mask filtering and ray shortening compose across shards.
///
/// Without a scheduler installed the orchestrator falls back to synchronous
/// rebuilds: crossing the mutation threshold merges the dynamic shard into
/// the primary and rebuilds it in place.
pub struct ThreeStageIndex {
    optimised: SharedIndex,
    dynamic: SharedIndex,
    /// Shadow of the primary; taken while a rebuild is in flight
    shadow: Option<SharedIndex>,
    rebuilding: bool,
    finished: Arc<AtomicBool>,
    done_tx: Sender<SharedIndex>,
    done_rx: Receiver<SharedIndex>,
    /// Entities mutated while the shadow was building; replayed after swap
    remove_after_rebuild: HashSet<Entity>,
    masks_after_rebuild: HashMap<Entity, Mask>,
    /// Set when the live state was cleared under an in-flight rebuild;
    /// the finished shadow is then discarded instead of swapped in
    discard_shadow: bool,
    fast_adding: bool,
    dynamic_updates: usize,
    optimised_updates: usize,
    config: ThreeStageConfig,
    scheduler: Option<RebuildScheduler>,
}

impl ThreeStageIndex {
    /// Compose an orchestrator from a primary index, a shadow of the same
    /// shape, and a churn index
    pub fn new(optimised: SharedIndex, shadow: SharedIndex, dynamic: SharedIndex) -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            optimised,
            dynamic,
            shadow: Some(shadow),
            rebuilding: false,
            finished: Arc::new(AtomicBool::new(false)),
            done_tx,
            done_rx,
            remove_after_rebuild: HashSet::new(),
            masks_after_rebuild: HashMap::new(),
            discard_shadow: false,
            fast_adding: false,
            dynamic_updates: 0,
            optimised_updates: 0,
            config: ThreeStageConfig::default(),
            scheduler: None,
        }
    }

    /// The stock composition: median-split primary and shadow, dynamic BVH
    /// for churn
    pub fn with_defaults(dense_entity_range: Entity) -> Self {
        Self::new(
            Box::new(MedianSplitBvh1::new(dense_entity_range)),
            Box::new(MedianSplitBvh1::new(dense_entity_range)),
            Box::new(DynamicBvh::new()),
        )
    }

    /// Install the hook that receives shadow rebuild tasks (see
    /// [`crate::rebuild_worker::RebuildWorker`])
    pub fn set_rebuild_scheduler(&mut self, scheduler: RebuildScheduler) {
        self.scheduler = Some(scheduler);
    }

    pub fn set_config(&mut self, config: ThreeStageConfig) {
        self.config = config;
    }

    pub fn config(&self) -> ThreeStageConfig {
        self.config
    }

    /// Whether a shadow rebuild is currently in flight
    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding
    }

    /// Swap a finished shadow in. Called at the top of every mutation and
    /// query; does nothing while the worker is still busy.
    fn try_integrate(&mut self) {
        if !self.rebuilding || !self.finished.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut shadow) = self.done_rx.try_recv() else {
            // Flag observed before the hand-back arrived; next entry point
            // will pick it up
            return;
        };
        self.rebuilding = false;
        self.finished.store(false, Ordering::Relaxed);

        if self.discard_shadow {
            self.discard_shadow = false;
            shadow.clear();
            self.shadow = Some(shadow);
            log::debug!("discarded stale shadow rebuild");
            return;
        }

        std::mem::swap(&mut self.optimised, &mut shadow);
        shadow.clear();
        self.shadow = Some(shadow);

        // Replay mutations that targeted the primary while it was copied
        for entity in self.remove_after_rebuild.drain() {
            if self.optimised.exists(entity) {
                self.optimised.remove(entity);
            }
        }
        for (entity, mask) in self.masks_after_rebuild.drain() {
            if self.optimised.exists(entity) {
                self.optimised.set_mask(entity, mask);
            }
        }

        // Entities updated during the rebuild exist in both shards now.
        // Where the copies agree the dynamic one is redundant; where they
        // differ the primary's copy is stale.
        let mut drop_from_dynamic = Vec::new();
        let mut drop_from_primary = Vec::new();
        for entry in self.dynamic.iter() {
            if self.optimised.exists(entry.entity) {
                let primary = self.optimised.get_aabb(entry.entity);
                let distance = (entry.aabb.min - primary.min).abs().element_sum()
                    + (entry.aabb.max - primary.max).abs().element_sum();
                if distance < self.config.integrate_tolerance {
                    drop_from_dynamic.push(entry.entity);
                } else {
                    drop_from_primary.push(entry.entity);
                }
            }
        }
        for entity in drop_from_primary {
            self.optimised.remove(entity);
        }
        for entity in drop_from_dynamic {
            self.dynamic.remove(entity);
        }

        log::debug!(
            "integrated rebuilt primary: {} optimised, {} dynamic",
            self.optimised.count(),
            self.dynamic.count()
        );
    }

    /// Snapshot both shards into the shadow and hand it to the scheduler.
    /// No-op while a previous rebuild is still running.
    fn try_schedule_rebuild(&mut self) {
        if self.rebuilding {
            if !self.finished.load(Ordering::Acquire) {
                return;
            }
            self.try_integrate();
            if self.rebuilding {
                return;
            }
        }

        if self.scheduler.is_some() {
            if let Some(mut shadow) = self.shadow.take() {
                shadow.clear();
                for entry in self.optimised.iter() {
                    shadow.add(entry.entity, entry.aabb, entry.mask);
                }
                for entry in self.dynamic.iter() {
                    shadow.add(entry.entity, entry.aabb, entry.mask);
                }

                self.dynamic_updates = 0;
                self.optimised_updates = 0;
                self.remove_after_rebuild.clear();
                self.masks_after_rebuild.clear();
                self.finished.store(false, Ordering::Relaxed);
                self.rebuilding = true;

                log::debug!("scheduling shadow rebuild of {} entities", shadow.count());
                let task =
                    RebuildTask::new(shadow, Arc::clone(&self.finished), self.done_tx.clone());
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler(task);
                }
                return;
            }
        }

        self.rebuild();
    }

    fn maybe_schedule_rebuild(&mut self) {
        if self.dynamic_updates + self.optimised_updates > self.config.rebuild_threshold {
            self.try_schedule_rebuild();
        }
    }
}

impl Broadphase for ThreeStageIndex {
    fn name(&self) -> &'static str {
        "three_stage_index"
    }

    fn clear(&mut self) {
        if self.rebuilding {
            self.discard_shadow = true;
            self.try_integrate();
        }
        self.dynamic.clear();
        self.optimised.clear();
        self.remove_after_rebuild.clear();
        self.masks_after_rebuild.clear();
        self.dynamic_updates = 0;
        self.optimised_updates = 0;
    }

    fn memory_usage(&self) -> usize {
        self.optimised.memory_usage()
            + self.dynamic.memory_usage()
            + self.shadow.as_ref().map_or(0, |s| s.memory_usage())
            + self.remove_after_rebuild.capacity() * size_of::<Entity>()
            + self.masks_after_rebuild.capacity() * (size_of::<Entity>() + size_of::<Mask>())
    }

    fn shrink_to_fit(&mut self) {
        self.optimised.shrink_to_fit();
        self.dynamic.shrink_to_fit();
        if let Some(shadow) = self.shadow.as_mut() {
            shadow.shrink_to_fit();
        }
        self.remove_after_rebuild.shrink_to_fit();
        self.masks_after_rebuild.shrink_to_fit();
    }

    fn start_fast_adding(&mut self) {
        self.fast_adding = true;
        if self.rebuilding {
            self.discard_shadow = true;
        }
        for entry in self.dynamic.iter() {
            self.optimised.add(entry.entity, entry.aabb, entry.mask);
        }
        self.dynamic.clear();
        self.dynamic_updates = 0;
        self.optimised_updates = 0;
    }

    fn stop_fast_adding(&mut self) {
        self.fast_adding = false;
    }

    fn add(&mut self, entity: Entity, aabb: Aabb, mask: Mask) {
        debug_assert!(!self.exists(entity), "entity {entity} already exists");

        if self.fast_adding {
            self.optimised.add(entity, aabb, mask);
            return;
        }

        self.try_integrate();
        self.dynamic_updates += 1;
        self.dynamic.add(entity, aabb, mask);
        self.maybe_schedule_rebuild();
    }

    fn update(&mut self, entity: Entity, aabb: Aabb) {
        if self.fast_adding {
            self.optimised.update(entity, aabb);
            return;
        }

        self.try_integrate();

        if self.dynamic.exists(entity) {
            self.dynamic_updates += 1;
            self.dynamic.update(entity, aabb);
        } else if self.optimised.exists(entity) {
            // Moving entities migrate to the churn shard; remember to strip
            // the stale copy from the shadow being built
            if self.rebuilding {
                self.remove_after_rebuild.insert(entity);
            }
            let mask = self.optimised.get_mask(entity);
            self.optimised.remove(entity);
            self.optimised_updates += 1;
            self.dynamic_updates += 1;
            self.dynamic.add(entity, aabb, mask);
        }

        self.maybe_schedule_rebuild();
    }

    fn remove(&mut self, entity: Entity) {
        if self.fast_adding {
            self.optimised.remove(entity);
            return;
        }

        self.try_integrate();

        if self.rebuilding {
            self.remove_after_rebuild.insert(entity);
        }

        if self.dynamic.exists(entity) {
            self.dynamic.remove(entity);
        } else if self.optimised.exists(entity) {
            self.optimised.remove(entity);
        }
    }

    fn set_mask(&mut self, entity: Entity, mask: Mask) {
        self.try_integrate();

        if self.dynamic.exists(entity) {
            self.dynamic.set_mask(entity, mask);
        } else if self.optimised.exists(entity) {
            self.optimised.set_mask(entity, mask);
            if self.rebuilding {
                self.masks_after_rebuild.insert(entity, mask);
            }
        }
    }

    fn count(&self) -> usize {
        self.dynamic.count() + self.optimised.count()
    }

    fn exists(&self, entity: Entity) -> bool {
        self.optimised.exists(entity) || self.dynamic.exists(entity)
    }

    fn get_aabb(&self, entity: Entity) -> Aabb {
        if self.optimised.exists(entity) {
            self.optimised.get_aabb(entity)
        } else {
            self.dynamic.get_aabb(entity)
        }
    }

    fn get_mask(&self, entity: Entity) -> Mask {
        if self.optimised.exists(entity) {
            self.optimised.get_mask(entity)
        } else {
            self.dynamic.get_mask(entity)
        }
    }

    /// Synchronous fallback: merge the dynamic shard into the primary and
    /// rebuild it in place
    fn rebuild(&mut self) {
        if self.rebuilding {
            self.discard_shadow = true;
        }

        for entry in self.dynamic.iter() {
            self.optimised.add(entry.entity, entry.aabb, entry.mask);
        }
        self.optimised.rebuild();
        self.dynamic.clear();

        self.dynamic_updates = 0;
        self.optimised_updates = 0;
        self.remove_after_rebuild.clear();
        self.masks_after_rebuild.clear();
    }

    fn intersect_aabb(&mut self, callback: &mut AabbCallback<'_>) {
        self.try_integrate();
        self.dynamic.intersect_aabb(callback);
        self.optimised.intersect_aabb(callback);
    }

    fn intersect_ray(&mut self, callback: &mut RayCallback<'_>) {
        self.try_integrate();
        self.dynamic.intersect_ray(callback);
        self.optimised.intersect_ray(callback);
    }

    fn iter(&self) -> Box<dyn Iterator<Item = IndexEntry> + '_> {
        Box::new(self.optimised.iter().chain(self.dynamic.iter()))
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

    fn unit_cube_at(x: f32) -> Aabb {
        aabb([x, 0.0, 0.0], [x + 1.0, 1.0, 1.0])
    }

    fn query(index: &mut ThreeStageIndex, q: Aabb, mask: Mask) -> Vec<Entity> {
        let mut found = Vec::new();
        let mut handler = |e: Entity| found.push(e);
        let mut cb = AabbCallback::new(q, mask, &mut handler);
        index.intersect_aabb(&mut cb);
        drop(cb);
        found.sort_unstable();
        found
    }

    /// Scheduler that runs the rebuild on the calling thread; completion is
    /// published immediately, so the next entry point integrates it
    fn inline_scheduler() -> RebuildScheduler {
        Box::new(|task| task.run())
    }

    #[test]
    fn test_adds_route_to_dynamic() {
        let mut index = ThreeStageIndex::with_defaults(1000);
        index.add(1, unit_cube_at(0.0), 1);
        index.add(2, unit_cube_at(5.0), 1);

        assert_eq!(index.dynamic.count(), 2);
        assert_eq!(index.optimised.count(), 0);
        assert_eq!(index.count(), 2);
        assert_eq!(query(&mut index, aabb([-1.0, -1.0, -1.0], [9.0, 2.0, 2.0]), 1), vec![1, 2]);
    }

    #[test]
    fn test_sync_rebuild_moves_entities_to_primary() {
        let mut index = ThreeStageIndex::with_defaults(1000);
        for e in 1..=50u64 {
            index.add(e, unit_cube_at(e as f32 * 2.0), 1);
        }
        index.rebuild();

        assert_eq!(index.dynamic.count(), 0);
        assert_eq!(index.optimised.count(), 50);
        assert_eq!(
            query(&mut index, aabb([-1.0, -1.0, -1.0], [200.0, 2.0, 2.0]), 1).len(),
            50
        );
    }

    #[test]
    fn test_update_migrates_from_primary_to_dynamic() {
        let mut index = ThreeStageIndex::with_defaults(1000);
        index.add(1, unit_cube_at(0.0), 5);
        index.rebuild();
        assert!(index.optimised.exists(1));

        index.update(1, unit_cube_at(50.0));
        assert!(index.dynamic.exists(1));
        assert!(!index.optimised.exists(1));
        // The mask travels with the record
        assert_eq!(index.get_mask(1), 5);
        assert_eq!(query(&mut index, aabb([49.0, -1.0, -1.0], [52.0, 2.0, 2.0]), 4), vec![1]);
    }

    #[test]
    fn test_threshold_triggers_scheduled_rebuild() {
        let mut index = ThreeStageIndex::with_defaults(1000);
        index.set_config(ThreeStageConfig {
            rebuild_threshold: 10,
            ..ThreeStageConfig::default()
        });
        index.set_rebuild_scheduler(inline_scheduler());

        for e in 1..=30u64 {
            index.add(e, unit_cube_at(e as f32 * 2.0), 1);
        }
        // The inline scheduler finished during some add; any mutation or
        // query afterwards integrates the result
        index.update(1, unit_cube_at(0.5));
        assert!(index.optimised.count() > 0);
        assert_eq!(index.count(), 30);

        let all = query(&mut index, aabb([-10.0, -10.0, -10.0], [100.0, 10.0, 10.0]), 1);
        assert_eq!(all, (1..=30u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_entity_in_both_shards_after_integration() {
        let mut index = ThreeStageIndex::with_defaults(1000);
        index.set_config(ThreeStageConfig {
            rebuild_threshold: 5,
            ..ThreeStageConfig::default()
        });
        index.set_rebuild_scheduler(inline_scheduler());

        for e in 1..=20u64 {
            index.add(e, unit_cube_at(e as f32 * 2.0), 1);
        }
        for e in 1..=20u64 {
            index.update(e, unit_cube_at(e as f32 * 2.0 + 0.25));
        }

        let mut seen: Vec<Entity> = index.iter().map(|entry| entry.entity).collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=20u64).collect::<Vec<_>>());
        for e in 1..=20u64 {
            assert!(
                !(index.optimised.exists(e) && index.dynamic.exists(e)),
                "entity {e} owned by both shards"
            );
        }
    }

    #[test]
    fn test_remove_replayed_after_rebuild() {
        let mut index = ThreeStageIndex::with_defaults(1000);

        // Capture the task instead of running it, to keep the rebuild
        // window open while we mutate
        let (task_tx, task_rx) = crossbeam_channel::unbounded::<RebuildTask>();
        index.set_rebuild_scheduler(Box::new(move |task| {
            let _ = task_tx.send(task);
        }));
        index.set_config(ThreeStageConfig {
            rebuild_threshold: 3,
            ..ThreeStageConfig::default()
        });

        for e in 1..=10u64 {
            index.add(e, unit_cube_at(e as f32 * 2.0), 1);
        }
        assert!(index.is_rebuilding());

        // The shadow snapshot contains entity 4; removing it now must not
        // let the swap resurrect it
        index.remove(4);
        let task = task_rx.try_recv().expect("rebuild scheduled");
        task.run();
        index.update(1, unit_cube_at(0.0));

        assert!(!index.exists(4));
        assert_eq!(index.count(), 9);
        let found = query(&mut index, aabb([-10.0, -10.0, -10.0], [100.0, 10.0, 10.0]), 1);
        assert!(!found.contains(&4));
    }

    #[test]
    fn test_clear_discards_inflight_rebuild() {
        let mut index = ThreeStageIndex::with_defaults(1000);
        let (task_tx, task_rx) = crossbeam_channel::unbounded::<RebuildTask>();
        index.set_rebuild_scheduler(Box::new(move |task| {
            let _ = task_tx.send(task);
        }));
        index.set_config(ThreeStageConfig {
            rebuild_threshold: 3,
            ..ThreeStageConfig::default()
        });

        for e in 1..=10u64 {
            index.add(e, unit_cube_at(e as f32 * 2.0), 1);
        }
        assert!(index.is_rebuilding());

        index.clear();
        assert_eq!(index.count(), 0);

        // Completion after the clear: the shadow's contents must not leak in
        let task = task_rx.try_recv().expect("rebuild scheduled");
        task.run();
        index.add(99, unit_cube_at(0.0), 1);

        assert_eq!(index.count(), 1);
        assert_eq!(
            query(&mut index, aabb([-100.0, -10.0, -10.0], [100.0, 10.0, 10.0]), 1),
            vec![99]
        );
    }

    #[test]
    fn test_fast_adding_routes_to_primary() {
        let mut index = ThreeStageIndex::with_defaults(1000);
        index.add(1, unit_cube_at(0.0), 1);

        index.start_fast_adding();
        for e in 2..=20u64 {
            index.add(e, unit_cube_at(e as f32 * 2.0), 1);
        }
        index.stop_fast_adding();

        assert_eq!(index.dynamic.count(), 0);
        assert_eq!(index.optimised.count(), 20);
        assert_eq!(
            query(&mut index, aabb([-10.0, -10.0, -10.0], [100.0, 10.0, 10.0]), 1).len(),
            20
        );
    }

    #[test]
    fn test_missing_entity_operations_are_noops() {
        let mut index = ThreeStageIndex::with_defaults(100);
        index.update(42, unit_cube_at(0.0));
        index.remove(42);
        index.set_mask(42, 7);
        assert_eq!(index.count(), 0);
        assert_eq!(index.get_aabb(42), Aabb::EMPTY);
        assert_eq!(index.get_mask(42), 0);
    }
}

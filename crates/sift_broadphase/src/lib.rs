//! # sift_broadphase - Tree-Based 3D Broadphase
//!
//! Spatial indexes over axis-aligned bounding boxes keyed by caller-owned
//! entity handles and filtered by bitmasks. Two queries are served at
//! interactive rates: enumerate entities intersecting a box, and enumerate
//! entities intersecting a segment with nearest-first pruning.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   ThreeStageIndex                    │
//! │  ┌────────────┐  ┌────────────┐  ┌───────────────┐  │
//! │  │ optimised  │  │  dynamic   │  │ shadow        │  │
//! │  │ MedianSplit│  │ DynamicBvh │  │ (rebuilding   │  │
//! │  │ Bvh        │  │            │  │  off-thread)  │  │
//! │  └────────────┘  └────────────┘  └───────────────┘  │
//! └──────────────────────────────────────────────────────┘
//!            │               │                │
//!            ▼               ▼                ▼
//!      AabbCallback     RayCallback     RebuildWorker
//! ```
//!
//! Every index implements [`Broadphase`]; the orchestrator composes them as
//! trait objects and amortises primary rebuilds onto a background worker.
//!
//! # Example
//!
//! ```
//! use sift_broadphase::prelude::*;
//!
//! let mut index = DynamicBvh::new();
//! index.add(1, Aabb::new(Vec3::ZERO, Vec3::ONE), 0b0001);
//! index.add(2, Aabb::new(Vec3::new(4.0, 0.0, 0.0), Vec3::new(5.0, 1.0, 1.0)), 0b0010);
//!
//! let mut hits = Vec::new();
//! let mut handler = |entity| hits.push(entity);
//! let mut query = AabbCallback::new(
//!     Aabb::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(2.0, 2.0, 2.0)),
//!     0b0011,
//!     &mut handler,
//! );
//! index.intersect_aabb(&mut query);
//! drop(query);
//! assert_eq!(hits, vec![1]);
//! ```

pub mod broadphase;
pub mod callbacks;
pub mod dynamic_bvh;
pub mod error;
pub mod median_split;
pub mod rebuild_worker;
pub mod three_stage;
pub mod types;

pub use broadphase::Broadphase;
pub use callbacks::{AabbCallback, RayCallback, RayHitResult};
pub use dynamic_bvh::DynamicBvh;
pub use error::{Result, SchedulerError};
pub use median_split::{
    AabbUpdatePolicy, MedianSplitBvh, MedianSplitBvh1, MedianSplitBvh2, RebuildProgress,
};
pub use rebuild_worker::{RebuildScheduler, RebuildTask, RebuildWorker, SharedIndex};
pub use three_stage::{ThreeStageConfig, ThreeStageIndex};
pub use types::{Entity, IndexEntry, Mask, EMPTY_ENTITY};

pub mod prelude {
    //! Common imports for broadphase usage
    pub use crate::broadphase::Broadphase;
    pub use crate::callbacks::{AabbCallback, RayCallback, RayHitResult};
    pub use crate::dynamic_bvh::DynamicBvh;
    pub use crate::error::{Result, SchedulerError};
    pub use crate::median_split::{
        AabbUpdatePolicy, MedianSplitBvh, MedianSplitBvh1, MedianSplitBvh2, RebuildProgress,
    };
    pub use crate::rebuild_worker::{RebuildScheduler, RebuildTask, RebuildWorker, SharedIndex};
    pub use crate::three_stage::{ThreeStageConfig, ThreeStageIndex};
    pub use crate::types::{Entity, IndexEntry, Mask, EMPTY_ENTITY};
    pub use sift_math::{Aabb, Vec3};
}

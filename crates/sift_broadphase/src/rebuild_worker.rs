//! Background rebuild scheduling
//!
//! The three-stage index does not run its shadow rebuilds itself; it hands
//! a [`RebuildTask`] to an installed scheduler and polls the task's atomic
//! flag. This module defines the task/scheduler contract and ships a
//! single-threaded worker that satisfies it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use crate::broadphase::Broadphase;
use crate::error::Result;

/// A boxed index that may cross threads
pub type SharedIndex = Box<dyn Broadphase + Send>;

/// One scheduled shadow rebuild.
///
/// The shadow index travels inside the task by ownership; nobody else holds
/// a reference to it while the task is pending. [`RebuildTask::run`] sends
/// the index back over the task's channel and only then publishes the
/// completion flag, so an orchestrator that observes the flag set can
/// receive the rebuilt index immediately.
pub struct RebuildTask {
    index: SharedIndex,
    finished: Arc<AtomicBool>,
    done_tx: Sender<SharedIndex>,
}

impl RebuildTask {
    pub(crate) fn new(
        index: SharedIndex,
        finished: Arc<AtomicBool>,
        done_tx: Sender<SharedIndex>,
    ) -> Self {
        Self {
            index,
            finished,
            done_tx,
        }
    }

    /// Rebuild the shadow, hand it back and publish completion
    pub fn run(mut self) {
        self.index.rebuild();
        let count = self.index.count();
        let _ = self.done_tx.send(self.index);
        self.finished.store(true, Ordering::Release);
        log::debug!("shadow rebuild finished ({count} entities)");
    }
}

/// Scheduler hook installed on a three-stage index.
///
/// The callee must eventually call [`RebuildTask::run`]; anything from
/// running it inline to queueing it on a job system is acceptable. The hook
/// itself should return quickly, since it runs inside the mutation path.
pub type RebuildScheduler = Box<dyn FnMut(RebuildTask) + Send>;

/// A named worker thread draining scheduled rebuilds in FIFO order.
///
/// ```no_run
/// use sift_broadphase::prelude::*;
///
/// let worker = RebuildWorker::spawn().expect("worker thread");
/// let mut index = ThreeStageIndex::with_defaults(10_000);
/// index.set_rebuild_scheduler(worker.scheduler());
/// ```
pub struct RebuildWorker {
    tx: Sender<RebuildTask>,
    handle: JoinHandle<()>,
}

impl RebuildWorker {
    /// Spawn the worker thread
    pub fn spawn() -> Result<Self> {
        let (tx, rx) = unbounded::<RebuildTask>();
        let handle = std::thread::Builder::new()
            .name("sift-rebuild".into())
            .spawn(move || {
                for task in rx {
                    task.run();
                }
                log::debug!("rebuild worker shutting down");
            })?;
        Ok(Self { tx, handle })
    }

    /// A scheduler hook feeding this worker, for
    /// [`crate::ThreeStageIndex::set_rebuild_scheduler`].
    ///
    /// Each hook holds its own channel handle; the worker thread exits once
    /// the worker and every hook created from it are dropped.
    pub fn scheduler(&self) -> RebuildScheduler {
        let tx = self.tx.clone();
        Box::new(move |task| {
            if let Err(returned) = tx.send(task) {
                log::error!("rebuild worker is gone; rebuilding inline");
                returned.0.run();
            }
        })
    }

    /// Stop accepting work and wait for the thread to drain.
    ///
    /// Blocks until every scheduler hook created from this worker has been
    /// dropped as well.
    pub fn join(self) {
        let Self { tx, handle } = self;
        drop(tx);
        let _ = handle.join();
    }
}

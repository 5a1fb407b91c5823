//! Work queue, bounded worker pool and periodic resync.

use std::sync::Arc;
use std::time::Duration;

use fleet_state::epoch_secs;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::queue::{WorkItem, WorkQueue, WorkReason};
use crate::reconciler::Reconciler;

/// Requeue delay after a reconcile error other than a conflict.
const ERROR_REQUEUE_SECS: u64 = 10;

pub struct Controller {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(reconciler: Reconciler, config: ControllerConfig) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue: WorkQueue::new(),
            config,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Enqueue every stored group.
    pub fn enqueue_all(&self, reason: WorkReason) {
        match self.reconciler.store().list_groups() {
            Ok(groups) => {
                for group in groups {
                    self.queue.add(group.name(), reason);
                }
            }
            Err(e) => warn!(error = %e, "failed to list node groups"),
        }
    }

    /// Run workers and the resync loop until `shutdown` fires, then give
    /// in-flight reconciles up to `shutdown_grace_secs` to finish.
    ///
    /// Workers check `leader` before starting each reconcile; a reconcile
    /// already running when leadership is lost runs to completion, bounded
    /// by `reconcile_timeout_secs`. The caller keeps the lease until this
    /// returns (see [`crate::leader::release_after`]).
    pub async fn run(self, leader: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            resync = self.config.resync_interval_secs,
            "controller started"
        );
        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            workers.spawn(worker(
                id,
                Arc::clone(&self.reconciler),
                Arc::clone(&self.queue),
                leader.clone(),
                Duration::from_secs(self.config.reconcile_timeout_secs),
            ));
        }

        let mut leader_changes = leader.clone();
        let mut resync = tokio::time::interval(Duration::from_secs(self.config.resync_interval_secs));
        loop {
            tokio::select! {
                _ = resync.tick() => {
                    if *leader.borrow() {
                        self.enqueue_all(WorkReason::Resync);
                    }
                }
                changed = leader_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *leader_changes.borrow_and_update() {
                        self.enqueue_all(WorkReason::Startup);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(in_flight = self.queue.in_flight(), "controller stopping");
        self.queue.shutdown();
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(grace_secs = grace.as_secs(), "in-flight reconciles did not finish in time");
            workers.abort_all();
        }
        info!("controller stopped");
    }
}

async fn worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    leader: watch::Receiver<bool>,
    timeout: Duration,
) {
    while let Some(WorkItem { key, reason }) = queue.next().await {
        if !*leader.borrow() {
            queue.done(&key);
            continue;
        }
        debug!(worker = id, group = %key, %reason, "reconciling");

        let requeue = match tokio::time::timeout(timeout, reconciler.reconcile(&key, epoch_secs())).await {
            Ok(Ok(Some(outcome))) => outcome.requeue_after_secs,
            Ok(Ok(None)) => None,
            Ok(Err(e)) if e.is_conflict() => {
                debug!(group = %key, "conflicting write, requeueing");
                Some(1)
            }
            Ok(Err(e)) => {
                error!(group = %key, error = %e, "reconcile failed");
                Some(ERROR_REQUEUE_SECS)
            }
            Err(_) => {
                warn!(group = %key, timeout_secs = timeout.as_secs(), "reconcile timed out");
                Some(ERROR_REQUEUE_SECS)
            }
        };

        queue.done(&key);
        if let Some(secs) = requeue {
            queue.add_after(&key, WorkReason::Requeue, Duration::from_secs(secs.max(1)));
        }
    }
    debug!(worker = id, "worker stopped");
}

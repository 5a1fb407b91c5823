//! Leader election over the store's lease table.
//!
//! Only the lease holder reconciles; every replica keeps serving the API.
//! On shutdown the lease is held until the controller has stopped, so no
//! other replica starts reconciling a group this one is still writing.

use std::time::Duration;

use fleet_state::{CONTROLLER_LEASE, StateResult, StateStore, epoch_secs};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::LeaderConfig;

pub struct LeaderElection {
    store: StateStore,
    holder: String,
    ttl_secs: u64,
    renew_interval: Duration,
    leader_tx: watch::Sender<bool>,
}

impl LeaderElection {
    pub fn new(store: StateStore, holder: String, config: &LeaderConfig) -> Self {
        let (leader_tx, _) = watch::channel(false);
        Self {
            store,
            holder,
            ttl_secs: config.lease_ttl_secs,
            renew_interval: Duration::from_secs(config.renew_interval_secs),
            leader_tx,
        }
    }

    /// Observe leadership changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    /// Acquire or renew the lease. Returns whether this replica holds it.
    pub fn try_acquire(&self, now: u64) -> StateResult<bool> {
        let lease = self
            .store
            .acquire_lease(CONTROLLER_LEASE, &self.holder, self.ttl_secs, now)?;
        Ok(lease.holder == self.holder)
    }

    fn publish(&self, is_leader: bool) {
        let was_leader = *self.leader_tx.borrow();
        if is_leader && !was_leader {
            info!(holder = %self.holder, "acquired controller lease");
        } else if !is_leader && was_leader {
            warn!(holder = %self.holder, "lost controller lease");
        }
        self.leader_tx.send_replace(is_leader);
    }

    /// Renew the lease until `release` fires, then give it up.
    pub fn start(self, mut release: watch::Receiver<bool>) -> (JoinHandle<()>, watch::Receiver<bool>) {
        let rx = self.subscribe();
        let handle = tokio::spawn(async move {
            info!(
                holder = %self.holder,
                ttl = self.ttl_secs,
                renew = self.renew_interval.as_secs(),
                "leader election started"
            );
            let mut interval = tokio::time::interval(self.renew_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.try_acquire(epoch_secs()) {
                            Ok(is_leader) => self.publish(is_leader),
                            Err(e) => {
                                warn!(error = %e, "lease renewal failed");
                                self.publish(false);
                            }
                        }
                    }
                    _ = release.changed() => break,
                }
            }

            self.publish(false);
            match self.store.release_lease(CONTROLLER_LEASE, &self.holder) {
                Ok(true) => info!(holder = %self.holder, "controller lease released"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "failed to release controller lease"),
            }
        });
        (handle, rx)
    }
}

/// Wait up to `grace` for the controller to stop, then release the lease and
/// wait for the election task. Returns whether the controller stopped
/// cleanly in time.
pub async fn release_after(
    controller: JoinHandle<()>,
    grace: Duration,
    release: watch::Sender<bool>,
    election: JoinHandle<()>,
) -> bool {
    let stopped = match tokio::time::timeout(grace, controller).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "controller task failed");
            false
        }
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "controller did not stop within the grace period");
            false
        }
    };
    let _ = release.send(true);
    if let Err(e) = election.await {
        warn!(error = %e, "leader election task failed");
    }
    stopped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn election(store: &StateStore, holder: &str) -> LeaderElection {
        LeaderElection::new(store.clone(), holder.to_string(), &LeaderConfig::default())
    }

    #[test]
    fn single_holder_at_a_time() {
        let store = StateStore::open_in_memory().unwrap();
        let a = election(&store, "a");
        let b = election(&store, "b");

        assert!(a.try_acquire(100).unwrap());
        assert!(!b.try_acquire(101).unwrap());
        assert!(a.try_acquire(110).unwrap());
        assert!(!b.try_acquire(120).unwrap());
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let store = StateStore::open_in_memory().unwrap();
        let a = election(&store, "a");
        let b = election(&store, "b");

        assert!(a.try_acquire(100).unwrap());
        assert!(b.try_acquire(100 + 15).unwrap());
        assert!(!a.try_acquire(116).unwrap());
    }

    #[tokio::test]
    async fn releases_lease_on_release_signal() {
        let store = StateStore::open_in_memory().unwrap();
        let (release_tx, release_rx) = watch::channel(false);
        let (handle, mut leader) = election(&store, "a").start(release_rx);

        leader.wait_for(|is_leader| *is_leader).await.unwrap();
        assert_eq!(store.get_lease(CONTROLLER_LEASE).unwrap().unwrap().holder, "a");

        release_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(store.get_lease(CONTROLLER_LEASE).unwrap().is_none());
        assert!(!*leader.borrow());
    }

    #[tokio::test]
    async fn lease_is_held_until_controller_stops() {
        let store = StateStore::open_in_memory().unwrap();
        let (release_tx, release_rx) = watch::channel(false);
        let (handle, mut leader) = election(&store, "a").start(release_rx);
        leader.wait_for(|is_leader| *is_leader).await.unwrap();

        // Stands in for a controller still finishing a reconcile.
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();
        let observed = store.clone();
        let observed_leader = leader.clone();
        let controller = tokio::spawn(async move {
            finish_rx.await.unwrap();
            assert_eq!(observed.get_lease(CONTROLLER_LEASE).unwrap().unwrap().holder, "a");
            assert!(*observed_leader.borrow());
        });

        let stopping = tokio::spawn(release_after(
            controller,
            Duration::from_secs(5),
            release_tx,
            handle,
        ));
        tokio::task::yield_now().await;
        assert!(!stopping.is_finished());
        assert_eq!(store.get_lease(CONTROLLER_LEASE).unwrap().unwrap().holder, "a");

        finish_tx.send(()).unwrap();
        assert!(stopping.await.unwrap());
        assert!(store.get_lease(CONTROLLER_LEASE).unwrap().is_none());
        assert!(!*leader.borrow());
    }
}

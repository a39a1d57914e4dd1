//! Periodic expiration sweep.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::key::IdentityKey;
use crate::liveness::{MasterLivenessTracker, OperatorNotifier};
use crate::store::RegistryStore;
use crate::types::{now_secs, AdType};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    /// Managers that entered DoneReporting during this pass.
    pub managers_down: Vec<IdentityKey>,
}

pub struct Housekeeper {
    store: Arc<RegistryStore>,
    liveness: MasterLivenessTracker,
    notifier: Arc<dyn OperatorNotifier>,
}

impl Housekeeper {
    pub fn new(store: Arc<RegistryStore>, notifier: Arc<dyn OperatorNotifier>) -> Self {
        Self {
            store,
            liveness: MasterLivenessTracker::new(),
            notifier,
        }
    }

    /// One pass over every collection at `now` (for testing). Does not
    /// notify.
    pub fn sweep_at(&self, now: u64) -> SweepReport {
        let store = &self.store;
        let ttl = |ad: &crate::classad::Ad| store.ttl_for(ad);
        let privates = store.collection(AdType::WorkerNodePrivate);
        let mut report = SweepReport::default();

        for (name, collection) in store.collections() {
            match collection.ad_type() {
                AdType::Manager => {
                    let r = self.liveness.check(&collection, now, ttl);
                    for key in &r.went_down {
                        info!("{}: {} stopped reporting", name, key);
                    }
                    report.removed += r.removed.len();
                    report.managers_down.extend(r.done_reporting);
                }
                ad_type => {
                    let expired = collection.remove_expired(now, ttl);
                    for key in &expired {
                        info!("{}: removed stale ad {}", name, key);
                    }
                    if ad_type == AdType::WorkerNode {
                        if let Some(p) = &privates {
                            for key in &expired {
                                p.remove(key);
                            }
                        }
                    }
                    report.removed += expired.len();
                }
            }
        }
        report
    }

    /// One pass at the current time, notifying about vanished managers.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_and_notify_at(now_secs()).await
    }

    pub async fn sweep_and_notify_at(&self, now: u64) -> SweepReport {
        let report = self.sweep_at(now);
        if !report.managers_down.is_empty() {
            self.notifier.managers_down(report.managers_down.clone()).await;
        }
        debug!("housekeeping removed {} ad(s)", report.removed);
        report
    }

    /// Sweeps every `period` until the task is aborted.
    pub async fn run(self, period: Duration) -> anyhow::Result<()> {
        info!("housekeeper running every {:?}", period);
        let mut ticker = tokio::time::interval(period);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}

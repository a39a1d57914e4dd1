//! The registry's own advertisement: aggregate pool counts and update
//! statistics, stored like any other ad and refreshed periodically.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::classad::Ad;
use crate::command::UPDATE_COLLECTOR_AD;
use crate::forward::ForwardItem;
use crate::stats::{ClassStats, ALL_CLASSES};
use crate::store::{IngestResult, RegistryStore};
use crate::types::{now_secs, AdType};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PoolCounts {
    hosts_total: i64,
    claimed: i64,
    unclaimed: i64,
    owner: i64,
    running_jobs: i64,
    idle_jobs: i64,
    submitters: i64,
}

pub struct SelfAdvertiser {
    store: Arc<RegistryStore>,
    name: String,
    address: String,
    update_interval: u64,
    forward: Option<mpsc::Sender<ForwardItem>>,
}

impl SelfAdvertiser {
    pub fn new(
        store: Arc<RegistryStore>,
        name: String,
        address: String,
        update_interval: u64,
        forward: Option<mpsc::Sender<ForwardItem>>,
    ) -> Self {
        Self {
            store,
            name,
            address,
            update_interval,
            forward,
        }
    }

    fn counts(&self) -> PoolCounts {
        let mut c = PoolCounts::default();
        if let Some(workers) = self.store.collection(AdType::WorkerNode) {
            workers.for_each(|_, ad| {
                c.hosts_total += 1;
                match ad.lookup_string("State").as_deref() {
                    Some("Claimed") => c.claimed += 1,
                    Some("Unclaimed") => c.unclaimed += 1,
                    Some("Owner") => c.owner += 1,
                    _ => {}
                }
            });
        }
        if let Some(submitters) = self.store.collection(AdType::Submitter) {
            submitters.for_each(|_, ad| {
                c.submitters += 1;
                c.running_jobs += ad.lookup_int("RunningJobs").unwrap_or(0);
                c.idle_jobs += ad.lookup_int("IdleJobs").unwrap_or(0);
            });
        }
        c
    }

    pub fn build_at(&self, now: u64) -> Ad {
        let c = self.counts();
        let sinful = format!("<{}>", self.address);
        let mut ad = Ad::new()
            .with("MyType", AdType::RegistrySelf.my_type())
            .with("TargetType", "")
            .with("Name", self.name.as_str())
            .with("MyAddress", sinful.as_str())
            .with("CollectorIpAddr", sinful.as_str())
            .with("HostsTotal", c.hosts_total)
            .with("HostsClaimed", c.claimed)
            .with("HostsUnclaimed", c.unclaimed)
            .with("HostsOwner", c.owner)
            .with("RunningJobs", c.running_jobs)
            .with("IdleJobs", c.idle_jobs)
            .with("SubmitterAds", c.submitters)
            .with("MachineAds", c.hosts_total)
            .with("UpdateInterval", self.update_interval)
            .with("ClassadLifetime", self.update_interval * 3)
            .with("CurrentTime", now);

        let stats = self.store.stats();
        if let Some(all) = stats.get(ALL_CLASSES) {
            add_stats(&mut ad, "", &all);
        }
        let mut classes = stats.classes();
        classes.sort();
        for class in classes.iter().filter(|c| c.as_str() != ALL_CLASSES) {
            if let Some(s) = stats.get(class) {
                add_stats(&mut ad, &format!("_{}", class), &s);
            }
        }
        ad
    }

    /// Stores the current self ad (for testing, at an explicit time).
    pub fn publish_at(&self, now: u64) -> IngestResult {
        let result = self
            .store
            .ingest_at(UPDATE_COLLECTOR_AD, self.build_at(now), None, None, now);
        if !result.outcome.is_stored() {
            warn!("could not store own advertisement: {:?}", result.outcome);
        }
        result
    }

    fn publish(&self) {
        let result = self.publish_at(now_secs());
        if let (Some(tx), Some(ad)) = (&self.forward, result.stored) {
            let item = ForwardItem {
                command: UPDATE_COLLECTOR_AD,
                ad,
                private: None,
            };
            if tx.try_send(item).is_err() {
                debug!("own advertisement not forwarded: queue unavailable");
            }
        }
    }

    /// Publishes now and then every `period` until aborted.
    pub async fn run(self, period: Duration) -> anyhow::Result<()> {
        info!("advertising {} every {:?}", self.name, period);
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            self.publish();
        }
    }
}

fn add_stats(ad: &mut Ad, suffix: &str, s: &ClassStats) {
    ad.insert(&format!("UpdatesTotal{}", suffix), s.total);
    ad.insert(&format!("UpdatesSequenced{}", suffix), s.sequenced);
    ad.insert(&format!("UpdatesLost{}", suffix), s.lost);
    ad.insert(&format!("UpdatesHistory{}", suffix), s.history.to_hex());
}

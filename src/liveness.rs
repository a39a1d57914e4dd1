//! Manager liveness tracking.
//!
//! Pure state machine over the manager collection: an expired manager ad is
//! replaced by a sentinel that advances one step per periodic check
//! (RecentlyDown -> DoneReporting -> LongGone -> removed). Any update for
//! the key puts a real ad back in the slot.

use async_trait::async_trait;
use log::warn;

use crate::classad::Ad;
use crate::collection::{is_expired, AdCollection, Slot, MARK_INVALIDATED};
use crate::key::IdentityKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LivenessState {
    RecentlyDown,
    DoneReporting,
    LongGone,
}

impl LivenessState {
    /// The state after one more check with the manager still absent;
    /// `None` means the slot is dropped.
    pub fn next(self) -> Option<LivenessState> {
        match self {
            LivenessState::RecentlyDown => Some(LivenessState::DoneReporting),
            LivenessState::DoneReporting => Some(LivenessState::LongGone),
            LivenessState::LongGone => None,
        }
    }
}

/// Receives the list of managers that stopped reporting.
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn managers_down(&self, keys: Vec<IdentityKey>);
}

/// Notifier that writes a warning to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn managers_down(&self, keys: Vec<IdentityKey>) {
        let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        warn!(
            "{} manager(s) stopped reporting: {}",
            names.len(),
            names.join(", ")
        );
    }
}

/// What one check did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    /// Live ads that expired during this check.
    pub went_down: Vec<IdentityKey>,
    /// Keys that just entered DoneReporting; notify about these.
    pub done_reporting: Vec<IdentityKey>,
    /// Slots dropped (LongGone, or ads invalidated for sweeping).
    pub removed: Vec<IdentityKey>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MasterLivenessTracker;

impl MasterLivenessTracker {
    pub fn new() -> Self {
        Self
    }

    /// Runs one periodic check over the manager collection.
    pub fn check<T>(&self, managers: &AdCollection, now: u64, ttl: T) -> LivenessReport
    where
        T: Fn(&Ad) -> u64,
    {
        let mut report = LivenessReport::default();
        managers.retain_entries(|key, entry| match entry.slot {
            Slot::Real(_) if entry.last_seen == MARK_INVALIDATED => {
                report.removed.push(key.clone());
                false
            }
            Slot::Real(ref ad) => {
                if is_expired(now, entry.last_seen, ttl(ad)) {
                    entry.slot = Slot::Sentinel(LivenessState::RecentlyDown);
                    report.went_down.push(key.clone());
                }
                true
            }
            Slot::Sentinel(state) => match state.next() {
                Some(next) => {
                    if next == LivenessState::DoneReporting {
                        report.done_reporting.push(key.clone());
                    }
                    entry.slot = Slot::Sentinel(next);
                    true
                }
                None => {
                    report.removed.push(key.clone());
                    false
                }
            },
        });
        report
    }

    /// Current state of a key; `None` when it holds a live ad or is absent.
    pub fn state(&self, managers: &AdCollection, key: &IdentityKey) -> Option<LivenessState> {
        match managers.slot(key)? {
            Slot::Sentinel(s) => Some(s),
            Slot::Real(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AdType;

    const TTL: u64 = 10;

    fn setup() -> (AdCollection, IdentityKey) {
        let c = AdCollection::new(AdType::Manager);
        let k = IdentityKey::named("cm.example.org");
        c.upsert(k.clone(), Ad::new().with("Name", "cm.example.org"), 100);
        (c, k)
    }

    #[test]
    fn states_advance_one_step_per_check() {
        let (c, k) = setup();
        let t = MasterLivenessTracker::new();

        let r = t.check(&c, 105, |_| TTL);
        assert_eq!(r, LivenessReport::default());

        let r = t.check(&c, 111, |_| TTL);
        assert_eq!(r.went_down, vec![k.clone()]);
        assert_eq!(t.state(&c, &k), Some(LivenessState::RecentlyDown));

        let r = t.check(&c, 121, |_| TTL);
        assert_eq!(r.done_reporting, vec![k.clone()]);
        assert_eq!(t.state(&c, &k), Some(LivenessState::DoneReporting));

        let r = t.check(&c, 131, |_| TTL);
        assert!(r.done_reporting.is_empty());
        assert_eq!(t.state(&c, &k), Some(LivenessState::LongGone));

        let r = t.check(&c, 141, |_| TTL);
        assert_eq!(r.removed, vec![k.clone()]);
        assert!(c.is_empty());
    }

    #[test]
    fn update_revives_from_any_state() {
        let (c, k) = setup();
        let t = MasterLivenessTracker::new();
        t.check(&c, 200, |_| TTL);
        t.check(&c, 210, |_| TTL);
        assert_eq!(t.state(&c, &k), Some(LivenessState::DoneReporting));

        c.upsert(k.clone(), Ad::new().with("Name", "cm.example.org"), 215);
        assert_eq!(t.state(&c, &k), None);
        assert!(c.lookup(&k).is_some());
        assert_eq!(t.check(&c, 220, |_| TTL), LivenessReport::default());
    }

    #[test]
    fn invalidated_managers_skip_liveness() {
        let (c, k) = setup();
        c.set_last_seen(&k, MARK_INVALIDATED);
        let r = MasterLivenessTracker::new().check(&c, 101, |_| TTL);
        assert_eq!(r.removed, vec![k]);
        assert!(r.went_down.is_empty());
        assert!(c.is_empty());
    }

    #[test]
    fn transitions_never_skip() {
        let mut s = LivenessState::RecentlyDown;
        let mut seen = vec![s];
        while let Some(n) = s.next() {
            seen.push(n);
            s = n;
        }
        assert_eq!(
            seen,
            vec![
                LivenessState::RecentlyDown,
                LivenessState::DoneReporting,
                LivenessState::LongGone
            ]
        );
    }
}

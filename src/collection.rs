//! A single typed store of advertisements.
//!
//! Entries are sharded by key in a [`DashMap`], so writers on different keys
//! rarely contend and writers on the same key are serialized by the shard
//! lock. Scans work on a snapshot of `Arc`s and never see a half-written ad.

use std::sync::Arc;

use dashmap::DashMap;

use crate::classad::Ad;
use crate::key::IdentityKey;
use crate::liveness::LivenessState;
use crate::types::AdType;

/// Attribute stamped on every stored ad with its last-seen time.
pub const LAST_HEARD_FROM: &str = "LastHeardFrom";

/// last-seen value of an entry invalidated for immediate sweeping.
pub const MARK_INVALIDATED: u64 = 0;
/// last-seen value of an entry invalidated to expire on the next sweep.
pub const MARK_EXPIRE: u64 = 1;

#[derive(Debug, Clone)]
pub enum Slot {
    Real(Arc<Ad>),
    /// Manager collection only: the advertiser stopped reporting.
    Sentinel(LivenessState),
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) slot: Slot,
    pub(crate) last_seen: u64,
}

#[derive(Debug, Clone)]
pub struct UpsertResult {
    pub stored: Arc<Ad>,
    /// The advertisement that was replaced, if the slot held one.
    pub previous: Option<Arc<Ad>>,
    /// `true` unless a real advertisement was replaced.
    pub inserted: bool,
}

#[derive(Debug)]
pub struct AdCollection {
    ad_type: AdType,
    entries: DashMap<IdentityKey, Entry>,
}

impl AdCollection {
    pub fn new(ad_type: AdType) -> Self {
        Self {
            ad_type,
            entries: DashMap::new(),
        }
    }

    pub fn ad_type(&self) -> AdType {
        self.ad_type
    }

    /// Stores `ad` under `key` with last-seen `now`. A liveness sentinel in
    /// the slot is always overwritten.
    pub fn upsert(&self, key: IdentityKey, mut ad: Ad, now: u64) -> UpsertResult {
        ad.insert(LAST_HEARD_FROM, now);
        let stored = Arc::new(ad);
        let entry = Entry {
            slot: Slot::Real(Arc::clone(&stored)),
            last_seen: now,
        };
        let previous = match self.entries.insert(key, entry) {
            Some(Entry {
                slot: Slot::Real(prev),
                ..
            }) => Some(prev),
            _ => None,
        };
        UpsertResult {
            inserted: previous.is_none(),
            stored,
            previous,
        }
    }

    /// Replaces the advertisement of an existing real entry, keeping its
    /// identity. Returns `None` when there is no real advertisement.
    pub fn update_existing<F>(&self, key: &IdentityKey, now: u64, f: F) -> Option<Arc<Ad>>
    where
        F: FnOnce(&mut Ad),
    {
        let mut entry = self.entries.get_mut(key)?;
        let Slot::Real(current) = &entry.slot else {
            return None;
        };
        let mut ad = current.as_ref().clone();
        f(&mut ad);
        ad.insert(LAST_HEARD_FROM, now);
        let stored = Arc::new(ad);
        entry.slot = Slot::Real(Arc::clone(&stored));
        entry.last_seen = now;
        Some(stored)
    }

    pub fn lookup(&self, key: &IdentityKey) -> Option<Arc<Ad>> {
        match &self.entries.get(key)?.slot {
            Slot::Real(ad) => Some(Arc::clone(ad)),
            Slot::Sentinel(_) => None,
        }
    }

    pub fn slot(&self, key: &IdentityKey) -> Option<Slot> {
        self.entries.get(key).map(|e| e.slot.clone())
    }

    pub fn last_seen(&self, key: &IdentityKey) -> Option<u64> {
        self.entries.get(key).map(|e| e.last_seen)
    }

    /// Overwrites the last-seen time of a real entry. Used by invalidation
    /// to mark entries for the housekeeper.
    pub fn set_last_seen(&self, key: &IdentityKey, last_seen: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(mut e) if matches!(e.slot, Slot::Real(_)) => {
                e.last_seen = last_seen;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &IdentityKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Real advertisements with their keys and last-seen times.
    pub fn snapshot(&self) -> Vec<(IdentityKey, Arc<Ad>, u64)> {
        self.entries
            .iter()
            .filter_map(|e| match &e.slot {
                Slot::Real(ad) => Some((e.key().clone(), Arc::clone(ad), e.last_seen)),
                Slot::Sentinel(_) => None,
            })
            .collect()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&IdentityKey, &Arc<Ad>),
    {
        for (key, ad, _) in self.snapshot() {
            f(&key, &ad);
        }
    }

    /// Calls `f` for every real entry older than its TTL at `now`.
    pub fn for_each_expiring<T, F>(&self, now: u64, ttl: T, mut f: F)
    where
        T: Fn(&Ad) -> u64,
        F: FnMut(&IdentityKey, &Arc<Ad>),
    {
        for (key, ad, last_seen) in self.snapshot() {
            if is_expired(now, last_seen, ttl(&ad)) {
                f(&key, &ad);
            }
        }
    }

    /// Removes every real entry older than its TTL and returns their keys.
    /// Age is re-checked under the shard lock, so an entry refreshed during
    /// the sweep survives.
    pub fn remove_expired<T>(&self, now: u64, ttl: T) -> Vec<IdentityKey>
    where
        T: Fn(&Ad) -> u64,
    {
        let mut removed = Vec::new();
        self.entries.retain(|key, entry| match &entry.slot {
            Slot::Real(ad) if is_expired(now, entry.last_seen, ttl(ad)) => {
                removed.push(key.clone());
                false
            }
            _ => true,
        });
        removed
    }

    /// Drops entries invalidated with [`MARK_INVALIDATED`].
    pub fn remove_marked(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let marked = matches!(entry.slot, Slot::Real(_)) && entry.last_seen == MARK_INVALIDATED;
            if marked {
                removed += 1;
            }
            !marked
        });
        removed
    }

    /// Visits every slot under its shard lock; returning `false` drops it.
    pub(crate) fn retain_entries<F>(&self, mut f: F)
    where
        F: FnMut(&IdentityKey, &mut Entry) -> bool,
    {
        self.entries.retain(|key, entry| f(key, entry));
    }

    /// Number of slots, sentinels included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of real advertisements.
    pub fn live_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.slot, Slot::Real(_)))
            .count()
    }
}

pub(crate) fn is_expired(now: u64, last_seen: u64, ttl: u64) -> bool {
    now.saturating_sub(last_seen) > ttl
}

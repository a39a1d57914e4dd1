//! Update statistics and sequence-loss detection.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::classad::Ad;

pub const SEQUENCE_ATTR: &str = "UpdateSequenceNumber";
pub const START_TIME_ATTR: &str = "DaemonStartTime";

/// Name of the class that aggregates every recorded update.
pub const ALL_CLASSES: &str = "All";

/// Circular history of update outcomes, one bit per update (`true` means
/// the update was lost).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitHistory {
    bits: VecDeque<bool>,
    capacity: usize,
}

impl BitHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            bits: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, lost: bool) {
        if self.capacity == 0 {
            return;
        }
        if self.bits.len() == self.capacity {
            self.bits.pop_front();
        }
        self.bits.push_back(lost);
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn lost(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Newest first, four bits per hex digit, `0x` prefixed.
    pub fn to_hex(&self) -> String {
        let mut out = String::from("0x");
        let newest_first: Vec<bool> = self.bits.iter().rev().copied().collect();
        for nibble in newest_first.chunks(4) {
            let mut v = 0u32;
            for (i, bit) in nibble.iter().enumerate() {
                if *bit {
                    v |= 1 << (3 - i);
                }
            }
            out.push(char::from_digit(v, 16).unwrap_or('0'));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStats {
    pub total: u64,
    pub sequenced: u64,
    pub lost: u64,
    pub history: BitHistory,
}

impl ClassStats {
    fn new(history_size: usize) -> Self {
        Self {
            total: 0,
            sequenced: 0,
            lost: 0,
            history: BitHistory::new(history_size),
        }
    }

    fn record(&mut self, sequenced: bool, dropped: u64) {
        self.total = self.total.saturating_add(1);
        if sequenced {
            self.sequenced = self.sequenced.saturating_add(dropped.saturating_add(1));
            self.lost = self.lost.saturating_add(dropped);
        }
        for _ in 0..dropped.min(self.history.capacity as u64) {
            self.history.push(true);
        }
        self.history.push(false);
    }
}

/// Per-class counters, keyed by class name (the ad type or a generic
/// `MyType`).
#[derive(Debug)]
pub struct StatsTracker {
    classes: DashMap<String, ClassStats>,
    history_size: usize,
}

impl StatsTracker {
    pub fn new(history_size: usize) -> Self {
        Self {
            classes: DashMap::new(),
            history_size,
        }
    }

    /// Records one received update, `dropped` being the number of updates
    /// inferred lost just before it.
    pub fn record(&self, class: &str, sequenced: bool, dropped: u64) {
        for name in [class, ALL_CLASSES] {
            self.classes
                .entry(name.to_string())
                .or_insert_with(|| ClassStats::new(self.history_size))
                .record(sequenced, dropped);
        }
    }

    /// Compares `current` against the previous ad for the same key and
    /// records the outcome. Returns the inferred number of lost updates.
    pub fn record_update(&self, class: &str, previous: Option<&Ad>, current: &Ad) -> u64 {
        let gap = previous.and_then(|p| sequence_gap(p, current));
        let dropped = gap.unwrap_or(0);
        self.record(class, gap.is_some(), dropped);
        dropped
    }

    pub fn get(&self, class: &str) -> Option<ClassStats> {
        self.classes.get(class).map(|s| s.clone())
    }

    pub fn classes(&self) -> Vec<String> {
        self.classes.iter().map(|e| e.key().clone()).collect()
    }
}

fn sequence_pair(ad: &Ad) -> Option<(i64, i64)> {
    Some((
        ad.lookup_int(SEQUENCE_ATTR)?,
        ad.lookup_int(START_TIME_ATTR)?,
    ))
}

/// Number of updates missing between `old` and `new`, or `None` when the
/// two are not comparable: either lacks a sequence number or start time,
/// the advertiser restarted, or the sequence did not move forward.
pub fn sequence_gap(old: &Ad, new: &Ad) -> Option<u64> {
    let (old_seq, old_start) = sequence_pair(old)?;
    let (new_seq, new_start) = sequence_pair(new)?;
    if old_start != new_start || new_seq <= old_seq {
        return None;
    }
    u64::try_from(i128::from(new_seq) - i128::from(old_seq) - 1).ok()
}

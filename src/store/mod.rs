//! The registry: one [`AdCollection`] per advertisement type plus lazily
//! created collections for generic types, and the update path into them.

mod invalidate;
mod query;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};

use crate::classad::{Ad, Expr};
use crate::collection::AdCollection;
use crate::command::CommandTable;
use crate::key::{derive_key, IdentityKey};
use crate::stats::StatsTracker;
use crate::types::{now_secs, AdType, CommandKind, IngestOutcome};

pub use invalidate::InvalidationPolicy;
pub use query::{Matches, QuerySpec, QueryVisitor};

/// Attributes copied from the stored public ad into its private ad so the
/// two can always be associated.
const PRIVATE_PAIRING_ATTRS: [&str; 4] = ["MyType", "MyAddress", "Name", "StartdIpAddr"];

/// Attributes of a merge request that never overwrite the stored ad.
const MERGE_STRIPPED_ATTRS: [&str; 3] = ["AuthenticatedIdentity", "MyType", "TargetType"];

/// Store-wide TTL when an ad declares none.
pub const DEFAULT_CLASSAD_LIFETIME: u64 = 900;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardFilter {
    /// Seconds after which an unchanged ad is forwarded anyway.
    pub interval: u64,
    pub watch_list: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub classad_lifetime: u64,
    /// Predicate every incoming ad must satisfy, evaluated with the ad as
    /// TARGET.
    pub validation: Option<Expr>,
    pub allow_only_one_negotiator: bool,
    pub invalidation: InvalidationPolicy,
    pub ignore_invalidate: bool,
    pub forward_filter: Option<ForwardFilter>,
    pub history_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            classad_lifetime: DEFAULT_CLASSAD_LIFETIME,
            validation: None,
            allow_only_one_negotiator: false,
            invalidation: InvalidationPolicy::MarkAndSweep,
            ignore_invalidate: false,
            forward_filter: None,
            history_size: 128,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub outcome: IngestOutcome,
    pub ad_type: AdType,
    pub key: Option<IdentityKey>,
    pub stored: Option<Arc<Ad>>,
    pub private: Option<Arc<Ad>>,
    /// `false` when forward filtering judged the update redundant.
    pub should_forward: bool,
}

impl IngestResult {
    fn rejected(ad_type: AdType, outcome: IngestOutcome) -> Self {
        Self {
            outcome,
            ad_type,
            key: None,
            stored: None,
            private: None,
            should_forward: false,
        }
    }
}

#[derive(Debug)]
pub struct RegistryStore {
    config: StoreConfig,
    commands: CommandTable,
    builtin: HashMap<AdType, Arc<AdCollection>>,
    /// lowercased MyType -> collection
    generic: DashMap<String, Arc<AdCollection>>,
    stats: StatsTracker,
}

impl RegistryStore {
    pub fn new(config: StoreConfig) -> Self {
        let builtin = AdType::BUILTIN
            .iter()
            .map(|t| (*t, Arc::new(AdCollection::new(*t))))
            .collect();
        let stats = StatsTracker::new(config.history_size);
        Self {
            config,
            commands: CommandTable::new(),
            builtin,
            generic: DashMap::new(),
            stats,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    /// Collection of a builtin type.
    pub fn collection(&self, ad_type: AdType) -> Option<Arc<AdCollection>> {
        self.builtin.get(&ad_type).cloned()
    }

    pub fn generic_collection(&self, my_type: &str) -> Option<Arc<AdCollection>> {
        self.generic
            .get(&my_type.to_lowercase())
            .map(|c| Arc::clone(c.value()))
    }

    /// Every collection with a display name: builtins first, then generics.
    pub fn collections(&self) -> Vec<(String, Arc<AdCollection>)> {
        let mut out: Vec<(String, Arc<AdCollection>)> = AdType::BUILTIN
            .iter()
            .filter_map(|t| self.collection(*t).map(|c| (t.to_string(), c)))
            .collect();
        let mut generic: Vec<_> = self
            .generic
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        generic.sort_by(|a, b| a.0.cmp(&b.0));
        out.extend(generic);
        out
    }

    /// TTL of one ad: `ClassadLifetime`, then `UpdateInterval`, then the
    /// store default.
    pub fn ttl_for(&self, ad: &Ad) -> u64 {
        ad.lookup_int("ClassadLifetime")
            .or_else(|| ad.lookup_int("UpdateInterval"))
            .and_then(|t| u64::try_from(t).ok())
            .unwrap_or(self.config.classad_lifetime)
    }

    pub fn ingest(&self, cmd: u32, ad: Ad, private: Option<Ad>, origin: Option<&str>) -> IngestResult {
        self.ingest_at(cmd, ad, private, origin, now_secs())
    }

    /// Update path with an explicit clock (for testing).
    pub fn ingest_at(
        &self,
        cmd: u32,
        mut ad: Ad,
        private: Option<Ad>,
        origin: Option<&str>,
        now: u64,
    ) -> IngestResult {
        let peer = origin.unwrap_or("(unknown)");
        let Some(spec) = self.commands.get(cmd).copied() else {
            warn!("received unknown command {} from {}", cmd, peer);
            return IngestResult::rejected(AdType::Generic, IngestOutcome::RejectedUnknownCommand);
        };
        let ad_type = spec.ad_type;
        match spec.kind {
            CommandKind::Update | CommandKind::UpdateWithAck => {}
            CommandKind::Merge => return self.merge_at(ad_type, ad, origin, now),
            CommandKind::Query | CommandKind::Invalidate => {
                warn!("{} from {} is not an update command", spec.name, peer);
                return IngestResult::rejected(ad_type, IngestOutcome::RejectedUnknownCommand);
            }
        }

        if !self.validate(ad_type, &ad, peer) {
            return IngestResult::rejected(ad_type, IngestOutcome::RejectedValidation);
        }
        let Some((collection, class)) = self.collection_for_update(ad_type, &ad) else {
            warn!("{} from {}: ad has no MyType, ignoring", spec.name, peer);
            return IngestResult::rejected(ad_type, IngestOutcome::RejectedNoKey);
        };
        let key = match derive_key(&mut ad, ad_type, origin) {
            Ok(key) => key,
            Err(why) => {
                warn!(
                    "could not make identity key for {} ad {:?} from {}: {}",
                    class,
                    ad.lookup_string("Name").unwrap_or_default(),
                    peer,
                    why
                );
                return IngestResult::rejected(ad_type, IngestOutcome::RejectedNoKey);
            }
        };

        let previous = collection.lookup(&key);
        if ad_type == AdType::Negotiator && self.config.allow_only_one_negotiator {
            let purged = collection.len();
            collection.clear();
            if purged > 0 {
                info!("purged {} negotiator ad(s) before storing {}", purged, key);
            }
        }
        let should_forward = self.apply_forward_filter(ad_type, &mut ad, previous.as_deref(), now);
        self.stats.record_update(&class, previous.as_deref(), &ad);

        let result = collection.upsert(key.clone(), ad, now);
        if result.inserted {
            info!("{}: inserting {}", class, key);
        } else {
            debug!("{}: updating {}", class, key);
        }

        let private = match (ad_type, private, self.collection(AdType::WorkerNodePrivate)) {
            (AdType::WorkerNode, Some(mut pvt), Some(privates)) => {
                for attr in PRIVATE_PAIRING_ATTRS {
                    pvt.copy_attr_from(&result.stored, attr);
                }
                Some(privates.upsert(key.clone(), pvt, now).stored)
            }
            _ => None,
        };

        IngestResult {
            outcome: if result.inserted {
                IngestOutcome::Inserted
            } else {
                IngestOutcome::Updated
            },
            ad_type,
            key: Some(key),
            stored: Some(result.stored),
            private,
            should_forward,
        }
    }

    /// Merges `ad` attribute by attribute into the stored ad for its key.
    /// Nothing is created when no ad is stored.
    pub fn merge_at(&self, ad_type: AdType, mut ad: Ad, origin: Option<&str>, now: u64) -> IngestResult {
        let peer = origin.unwrap_or("(unknown)");
        if !self.validate(ad_type, &ad, peer) {
            return IngestResult::rejected(ad_type, IngestOutcome::RejectedValidation);
        }
        let Some((collection, class)) = self.collection_for_update(ad_type, &ad) else {
            return IngestResult::rejected(ad_type, IngestOutcome::RejectedNoKey);
        };
        let key = match derive_key(&mut ad, ad_type, origin) {
            Ok(key) => key,
            Err(why) => {
                warn!("could not make identity key for {} merge from {}: {}", class, peer, why);
                return IngestResult::rejected(ad_type, IngestOutcome::RejectedNoKey);
            }
        };
        for attr in MERGE_STRIPPED_ATTRS {
            ad.remove(attr);
        }
        match collection.update_existing(&key, now, move |existing| existing.merge_from(ad)) {
            Some(stored) => {
                debug!("{}: merged into {}", class, key);
                IngestResult {
                    outcome: IngestOutcome::Updated,
                    ad_type,
                    key: Some(key),
                    stored: Some(stored),
                    private: None,
                    should_forward: true,
                }
            }
            None => {
                warn!("{}: merge for {} from {} has no existing ad, ignoring", class, key, peer);
                IngestResult::rejected(ad_type, IngestOutcome::RejectedNoExisting)
            }
        }
    }

    fn collection_for_update(&self, ad_type: AdType, ad: &Ad) -> Option<(Arc<AdCollection>, String)> {
        if ad_type == AdType::Generic {
            let my_type = ad.my_type()?;
            let collection = self
                .generic
                .entry(my_type.to_lowercase())
                .or_insert_with(|| {
                    info!("creating new collection for type {}", my_type);
                    Arc::new(AdCollection::new(AdType::Generic))
                })
                .clone();
            return Some((collection, my_type));
        }
        Some((self.collection(ad_type)?, ad_type.to_string()))
    }

    /// Address consistency check and the configured predicate. Both are
    /// skipped when no predicate is configured.
    fn validate(&self, ad_type: AdType, ad: &Ad, peer: &str) -> bool {
        let Some(requirements) = &self.config.validation else {
            return true;
        };
        if let Some(attr) = validation_address_attr(ad_type) {
            if let Some(subsys_addr) = ad.lookup_string(attr) {
                let my_addr = ad.lookup_string("MyAddress").unwrap_or_default();
                if my_addr != subsys_addr {
                    warn!(
                        "collector requirements violation: ad from {} advertises inconsistent addresses: {}={}, MyAddress={}",
                        peer, attr, subsys_addr, my_addr
                    );
                    return false;
                }
            }
        }
        let empty = Ad::new();
        if requirements.eval_bool(&empty, Some(ad)) != Some(true) {
            warn!(
                "collector requirements violation: {} ad from {} does not satisfy {}",
                ad_type, peer, requirements
            );
            return false;
        }
        true
    }

    /// Sets `ShouldForward`/`LastForwarded` on worker-node and submitter
    /// ads when forward filtering is on.
    fn apply_forward_filter(&self, ad_type: AdType, ad: &mut Ad, previous: Option<&Ad>, now: u64) -> bool {
        let Some(filter) = &self.config.forward_filter else {
            return true;
        };
        if !matches!(ad_type, AdType::WorkerNode | AdType::Submitter) {
            return true;
        }
        let (forward, last_forwarded) = match previous {
            None => (true, now),
            Some(old) => {
                let last = old
                    .lookup_int("LastForwarded")
                    .and_then(|t| u64::try_from(t).ok())
                    .unwrap_or(0);
                let changed = filter.watch_list.iter().any(|attr| {
                    old.contains(attr)
                        && ad.contains(attr)
                        && !old.eval_attr(attr).identical(&ad.eval_attr(attr))
                });
                if last + filter.interval < now || changed {
                    (true, now)
                } else {
                    (false, last)
                }
            }
        };
        ad.insert("ShouldForward", forward);
        ad.insert("LastForwarded", last_forwarded);
        forward
    }
}

fn validation_address_attr(ad_type: AdType) -> Option<&'static str> {
    match ad_type {
        AdType::WorkerNode => Some("StartdIpAddr"),
        AdType::Scheduler | AdType::Submitter => Some("ScheddIpAddr"),
        AdType::Manager => Some("MasterIpAddr"),
        AdType::Negotiator => Some("NegotiatorIpAddr"),
        AdType::RegistrySelf => Some("CollectorIpAddr"),
        _ => None,
    }
}

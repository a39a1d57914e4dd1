use log::{debug, info};

use crate::classad::Ad;
use crate::collection::{AdCollection, MARK_EXPIRE, MARK_INVALIDATED};
use crate::error::CollectorError;
use crate::key::{key_from_query, IdentityKey};
use crate::types::AdType;

use super::query::{QuerySpec, QueryVisitor};
use super::RegistryStore;

/// What happens to the entries an invalidation matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationPolicy {
    /// Mark with last-seen 1; the next housekeeping pass reclaims them.
    Expire,
    /// Mark with last-seen 0 and sweep the marked entries right away.
    MarkAndSweep,
    /// Remove during the scan.
    Remove,
}

impl InvalidationPolicy {
    /// Resolves the two deployment toggles. `expire` wins when set;
    /// housekeeping defaults to on.
    pub fn resolve(expire_invalidated_ads: Option<bool>, housekeeping_on_invalidate: Option<bool>) -> Self {
        if expire_invalidated_ads == Some(true) {
            InvalidationPolicy::Expire
        } else if housekeeping_on_invalidate.unwrap_or(true) {
            InvalidationPolicy::MarkAndSweep
        } else {
            InvalidationPolicy::Remove
        }
    }
}

impl RegistryStore {
    /// Invalidates with the configured policy. Returns the number of
    /// matched advertisements.
    pub fn invalidate(&self, ad_type: AdType, query: &Ad) -> Result<usize, CollectorError> {
        self.invalidate_with(ad_type, query, self.config.invalidation)
    }

    pub fn invalidate_with(
        &self,
        ad_type: AdType,
        query: &Ad,
        policy: InvalidationPolicy,
    ) -> Result<usize, CollectorError> {
        if self.config.ignore_invalidate {
            info!("ignoring invalidation of {} ads", ad_type);
            return Ok(0);
        }
        let privates = match ad_type {
            AdType::WorkerNode => self.collection(AdType::WorkerNodePrivate),
            _ => None,
        };

        if !matches!(ad_type, AdType::Generic | AdType::Any) {
            if let Some(key) = key_from_query(query, ad_type) {
                let hit = self
                    .collection(ad_type)
                    .is_some_and(|c| invalidate_key(&c, &key, policy));
                if let Some(p) = &privates {
                    invalidate_key(p, &key, policy);
                }
                info!(
                    "invalidated {} {} ad(s) by key {} ({:?})",
                    usize::from(hit),
                    ad_type,
                    key,
                    policy
                );
                return Ok(usize::from(hit));
            }
        }

        let spec = QuerySpec::from_query_ad(query.clone())?;
        let filtered = matches!(ad_type, AdType::Generic | AdType::Any);
        let target_type = spec.target_type.as_deref().filter(|_| filtered);
        let mut visitor = QueryVisitor::new(&spec, filtered, None);
        let mut count = 0;
        for table in self.tables_for(ad_type, target_type) {
            let matched: Vec<IdentityKey> = table
                .snapshot()
                .into_iter()
                .filter(|(_, ad, _)| visitor.visit(ad))
                .map(|(key, _, _)| key)
                .collect();
            let paired = privates
                .as_ref()
                .filter(|_| table.ad_type() == AdType::WorkerNode);
            for key in &matched {
                debug!("invalidating {} ad {}", table.ad_type(), key);
                mark_or_remove(&table, key, policy);
                if let Some(p) = paired {
                    mark_or_remove(p, key, policy);
                }
            }
            if policy == InvalidationPolicy::MarkAndSweep {
                table.remove_marked();
                if let Some(p) = paired {
                    p.remove_marked();
                }
            }
            count += matched.len();
        }
        info!(
            "invalidated {} {} ad(s) matching {} ({:?})",
            count, ad_type, spec.requirements, policy
        );
        Ok(count)
    }
}

/// Direct-key path: `Expire` marks the one entry, the other policies
/// remove it.
fn invalidate_key(collection: &AdCollection, key: &IdentityKey, policy: InvalidationPolicy) -> bool {
    if collection.lookup(key).is_none() {
        return false;
    }
    match policy {
        InvalidationPolicy::Expire => collection.set_last_seen(key, MARK_EXPIRE),
        InvalidationPolicy::MarkAndSweep | InvalidationPolicy::Remove => collection.remove(key),
    }
}

fn mark_or_remove(collection: &AdCollection, key: &IdentityKey, policy: InvalidationPolicy) {
    match policy {
        InvalidationPolicy::Expire => {
            collection.set_last_seen(key, MARK_EXPIRE);
        }
        InvalidationPolicy::MarkAndSweep => {
            collection.set_last_seen(key, MARK_INVALIDATED);
        }
        InvalidationPolicy::Remove => {
            collection.remove(key);
        }
    }
}

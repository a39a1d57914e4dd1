use std::collections::VecDeque;
use std::sync::Arc;

use crate::classad::{Ad, Expr};
use crate::collection::AdCollection;
use crate::error::CollectorError;
use crate::key::IdentityKey;
use crate::types::AdType;

use super::RegistryStore;

/// A decoded query advertisement.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub requirements: Expr,
    /// `MyType` filter; `None` also when the query targets "any".
    pub target_type: Option<String>,
    pub limit: Option<usize>,
    pub projection: Option<Vec<String>>,
    /// The query ad itself, TARGET while evaluating requirements.
    pub query: Ad,
}

impl QuerySpec {
    pub fn from_query_ad(query: Ad) -> Result<Self, CollectorError> {
        let requirements = query
            .lookup("Requirements")
            .cloned()
            .ok_or(CollectorError::MissingRequirements)?;
        let target_type = query
            .lookup_string("TargetType")
            .filter(|t| !t.eq_ignore_ascii_case("any"));
        let limit = query
            .lookup_int("LimitResults")
            .filter(|n| *n > 0)
            .and_then(|n| usize::try_from(n).ok());
        let projection = query.lookup_string("Projection").and_then(|p| {
            let names: Vec<String> = p
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            (!names.is_empty()).then_some(names)
        });
        Ok(Self {
            requirements,
            target_type,
            limit,
            projection,
            query,
        })
    }

    /// A query with only a requirements expression.
    pub fn matching(requirements: Expr) -> Self {
        Self {
            requirements,
            target_type: None,
            limit: None,
            projection: None,
            query: Ad::new(),
        }
    }

    /// Projected and limited to fewer than ten results.
    pub fn is_small(&self) -> bool {
        self.projection.is_some() && self.limit.is_some_and(|l| l < 10)
    }

    /// Reduces a matched ad to the projection, if any.
    pub fn shape(&self, ad: &Ad) -> Ad {
        match &self.projection {
            Some(names) => ad.project(names.iter().map(String::as_str)),
            None => ad.clone(),
        }
    }
}

/// Per-scan matching state. Each query owns one, so concurrent scans never
/// share counters.
#[derive(Debug, Clone)]
pub struct QueryVisitor {
    requirements: Expr,
    query: Ad,
    target_type: Option<String>,
    limit: Option<usize>,
    matched: usize,
    skipped: usize,
}

impl QueryVisitor {
    pub fn new(spec: &QuerySpec, apply_target_type: bool, limit: Option<usize>) -> Self {
        Self {
            requirements: spec.requirements.clone(),
            query: spec.query.clone(),
            target_type: spec.target_type.clone().filter(|_| apply_target_type),
            limit,
            matched: 0,
            skipped: 0,
        }
    }

    /// `true` when `ad` belongs in the result.
    pub fn visit(&mut self, ad: &Ad) -> bool {
        if let Some(tt) = &self.target_type {
            let declared = ad.my_type();
            if !declared.is_some_and(|t| t.eq_ignore_ascii_case(tt)) {
                self.skipped += 1;
                return false;
            }
        }
        if self.requirements.eval_bool(ad, Some(&self.query)) == Some(true) {
            self.matched += 1;
            true
        } else {
            self.skipped += 1;
            false
        }
    }

    pub fn exhausted(&self) -> bool {
        self.limit.is_some_and(|l| self.matched >= l)
    }

    pub fn matched(&self) -> usize {
        self.matched
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Lazy result of a query: collections are snapshotted one at a time as the
/// iterator reaches them, and each ad is tested once.
pub struct Matches {
    pending: VecDeque<Arc<AdCollection>>,
    current: std::vec::IntoIter<(IdentityKey, Arc<Ad>, u64)>,
    visitor: QueryVisitor,
}

impl Matches {
    pub fn visitor(&self) -> &QueryVisitor {
        &self.visitor
    }
}

impl Iterator for Matches {
    type Item = Arc<Ad>;

    fn next(&mut self) -> Option<Arc<Ad>> {
        loop {
            if self.visitor.exhausted() {
                return None;
            }
            for (_, ad, _) in self.current.by_ref() {
                if self.visitor.visit(&ad) {
                    return Some(ad);
                }
            }
            let next = self.pending.pop_front()?;
            self.current = next.snapshot().into_iter();
        }
    }
}

impl RegistryStore {
    /// Starts a query over the collections `ad_type` covers.
    pub fn evaluate(&self, ad_type: AdType, spec: &QuerySpec) -> Matches {
        let filtered = matches!(ad_type, AdType::Generic | AdType::Any);
        let target_type = spec.target_type.as_deref().filter(|_| filtered);
        Matches {
            pending: self.tables_for(ad_type, target_type).into(),
            current: Vec::new().into_iter(),
            visitor: QueryVisitor::new(spec, filtered, spec.limit),
        }
    }

    /// Collections scanned for `ad_type`. "Any" never includes private ads.
    pub(crate) fn tables_for(&self, ad_type: AdType, target_type: Option<&str>) -> Vec<Arc<AdCollection>> {
        match (ad_type, target_type) {
            (AdType::Any, Some(tt)) => {
                let mut tables = Vec::new();
                if let Some(t) = AdType::from_my_type(tt).filter(|t| *t != AdType::WorkerNodePrivate) {
                    tables.extend(self.collection(t));
                }
                tables.extend(self.generic_collection(tt));
                tables
            }
            (AdType::Generic, Some(tt)) => self.generic_collection(tt).into_iter().collect(),
            (AdType::Any, None) | (AdType::Generic, None) => self
                .collections()
                .into_iter()
                .filter(|(_, c)| match c.ad_type() {
                    AdType::Generic => true,
                    AdType::WorkerNodePrivate => false,
                    _ => ad_type == AdType::Any,
                })
                .map(|(_, c)| c)
                .collect(),
            (t, _) => self.collection(t).into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classad::parse_expr;
    use crate::command::*;
    use crate::store::StoreConfig;

    fn store_with_machines() -> RegistryStore {
        let store = RegistryStore::new(StoreConfig::default());
        for (name, mem) in [("slot1@a", 512), ("slot1@b", 2048), ("slot1@c", 4096)] {
            let ad = Ad::new()
                .with("MyType", "Machine")
                .with("Name", name)
                .with("StartdIpAddr", "<10.0.0.1:1>")
                .with("Memory", mem);
            store.ingest_at(UPDATE_STARTD_AD, ad, Some(Ad::new().with("Secret", 1)), None, 1);
        }
        store.ingest_at(
            UPDATE_SCHEDD_AD,
            Ad::new()
                .with("MyType", "Scheduler")
                .with("Name", "schedd@a")
                .with("ScheddIpAddr", "<10.0.0.2:1>"),
            None,
            None,
            1,
        );
        store
    }

    fn query(src: &str) -> QuerySpec {
        let mut q = Ad::new();
        q.parse_insert("Requirements", src).unwrap();
        QuerySpec::from_query_ad(q).unwrap()
    }

    #[test]
    fn requirements_select_ads() {
        let store = store_with_machines();
        let names: Vec<_> = store
            .evaluate(AdType::WorkerNode, &query("Memory >= 1024"))
            .filter_map(|ad| ad.lookup_string("Name"))
            .collect();
        assert_eq!(names.len(), 2);
        assert!(!names.contains(&"slot1@a".to_string()));
    }

    #[test]
    fn query_ad_is_target_context() {
        let store = store_with_machines();
        let mut q = Ad::new().with("RequestMemory", 3000);
        q.parse_insert("Requirements", "Memory >= TARGET.RequestMemory").unwrap();
        let spec = QuerySpec::from_query_ad(q).unwrap();
        assert_eq!(store.evaluate(AdType::WorkerNode, &spec).count(), 1);
    }

    #[test]
    fn limit_stops_the_scan() {
        let store = store_with_machines();
        let mut q = Ad::new().with("LimitResults", 2);
        q.parse_insert("Requirements", "true").unwrap();
        let spec = QuerySpec::from_query_ad(q).unwrap();
        let mut m = store.evaluate(AdType::WorkerNode, &spec);
        assert_eq!(m.by_ref().count(), 2);
        assert_eq!(m.visitor().matched(), 2);
    }

    #[test]
    fn any_query_skips_private_ads() {
        let store = store_with_machines();
        assert_eq!(store.evaluate(AdType::Any, &query("true")).count(), 4);
        assert_eq!(store.evaluate(AdType::WorkerNodePrivate, &query("true")).count(), 3);
    }

    #[test]
    fn target_type_only_filters_generic_and_any() {
        let store = store_with_machines();
        let mut q = Ad::new().with("TargetType", "Scheduler");
        q.parse_insert("Requirements", "true").unwrap();
        let spec = QuerySpec::from_query_ad(q).unwrap();
        assert_eq!(store.evaluate(AdType::Any, &spec).count(), 1);
        assert_eq!(store.evaluate(AdType::WorkerNode, &spec).count(), 3);
    }

    #[test]
    fn missing_requirements_is_rejected() {
        let err = QuerySpec::from_query_ad(Ad::new().with("TargetType", "Machine")).unwrap_err();
        assert!(matches!(err, CollectorError::MissingRequirements));
    }

    #[test]
    fn projection_is_parsed_and_applied() {
        let mut q = Ad::new().with("Projection", "Name, Memory").with("LimitResults", 5);
        q.parse_insert("Requirements", "true").unwrap();
        let spec = QuerySpec::from_query_ad(q).unwrap();
        assert!(spec.is_small());
        let ad = Ad::new().with("Name", "x").with("Memory", 1).with("Cpus", 2);
        assert_eq!(spec.shape(&ad).len(), 2);
    }
}

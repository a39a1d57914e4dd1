use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::classad::parse_expr;
use crate::error::CollectorError;
use crate::protocol::{wire, Limits};
use crate::query_pool::{InProcPolicy, QueryPool};
use crate::store::{ForwardFilter, InvalidationPolicy, StoreConfig};

const DEFAULT_WATCH_LIST: [&str; 8] = [
    "State",
    "Cpus",
    "Memory",
    "IdleJobs",
    "ClaimId",
    "Capability",
    "ClaimIdList",
    "ChildClaimIds",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub client_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub classad_lifetime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub housekeeping_interval_secs: Option<u64>,
    pub update_interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collector_requirements: Option<String>,
    pub allow_only_one_negotiator: bool,
    pub ignore_invalidate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_invalidated_ads: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub housekeeping_on_invalidate: Option<bool>,
    pub query_workers: usize,
    pub query_workers_pending: usize,
    pub query_max_worktime_secs: u64,
    pub query_in_proc_policy: InProcPolicy,
    pub daemon_history_size: usize,
    pub max_message_size: usize,
    pub forward_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_types: Option<Vec<String>>,
    pub forward_filtering: bool,
    pub forward_watch_list: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_interval_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 9618)),
            bind_ip: None,
            name: None,
            client_timeout_secs: 30,
            query_timeout_secs: 60,
            classad_lifetime_secs: crate::store::DEFAULT_CLASSAD_LIFETIME,
            housekeeping_interval_secs: None,
            update_interval_secs: 900,
            collector_requirements: None,
            allow_only_one_negotiator: false,
            ignore_invalidate: false,
            expire_invalidated_ads: None,
            housekeeping_on_invalidate: None,
            query_workers: 4,
            query_workers_pending: 50,
            query_max_worktime_secs: 0,
            query_in_proc_policy: InProcPolicy::SmallTableOrQuery,
            daemon_history_size: 128,
            max_message_size: wire::DEFAULT_MAX_MESSAGE_SIZE,
            forward_hosts: Vec::new(),
            forward_types: None,
            forward_filtering: false,
            forward_watch_list: DEFAULT_WATCH_LIST.iter().map(|s| s.to_string()).collect(),
            forward_interval_secs: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("collectord.toml"))
            .merge(Json::file("collectord.json"))
            .merge(Env::prefixed("COLLECTORD_"))
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // If bind_ip is set, override the IP part of bind
        if let Some(ref ip) = config.bind_ip {
            let port = config.bind.port();
            config.bind = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        // surface a bad predicate at startup rather than on the first update
        config.store_config()?;
        Ok(config)
    }

    pub fn invalidation_policy(&self) -> InvalidationPolicy {
        InvalidationPolicy::resolve(self.expire_invalidated_ads, self.housekeeping_on_invalidate)
    }

    pub fn store_config(&self) -> Result<StoreConfig, CollectorError> {
        let validation = match &self.collector_requirements {
            Some(src) => Some(parse_expr(src).map_err(|e| {
                CollectorError::Config(format!("collector_requirements: {}", e))
            })?),
            None => None,
        };
        let forward_filter = self.forward_filtering.then(|| ForwardFilter {
            interval: self
                .forward_interval_secs
                .unwrap_or(self.classad_lifetime_secs / 3),
            watch_list: self.forward_watch_list.clone(),
        });
        Ok(StoreConfig {
            classad_lifetime: self.classad_lifetime_secs,
            validation,
            allow_only_one_negotiator: self.allow_only_one_negotiator,
            invalidation: self.invalidation_policy(),
            ignore_invalidate: self.ignore_invalidate,
            forward_filter,
            history_size: self.daemon_history_size,
        })
    }

    pub fn limits(&self) -> Limits {
        Limits {
            client_timeout: Duration::from_secs(self.client_timeout_secs),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            max_message_size: self.max_message_size,
        }
    }

    pub fn query_pool(&self) -> QueryPool {
        let worktime = (self.query_max_worktime_secs > 0)
            .then(|| Duration::from_secs(self.query_max_worktime_secs));
        QueryPool::new(
            self.query_workers,
            self.query_workers_pending,
            worktime,
            self.query_in_proc_policy,
        )
    }

    /// `None` when housekeeping is switched off.
    pub fn housekeeping_interval(&self) -> Option<Duration> {
        let secs = self
            .housekeeping_interval_secs
            .unwrap_or(self.classad_lifetime_secs);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn registry_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("collectord@{}", self.bind))
    }
}

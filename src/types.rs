//! Data structures shared by the store, the protocol handlers and the
//! forwarder.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Advertisement type. Determines the collection an ad lives in and the
/// identity-key rule applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AdType {
    WorkerNode,
    WorkerNodePrivate,
    Scheduler,
    Submitter,
    Manager,
    License,
    RegistrySelf,
    Storage,
    Negotiator,
    Had,
    CkptServer,
    /// User-defined type; the concrete name is the ad's `MyType`.
    Generic,
    /// Query-only: every collection.
    Any,
}

impl AdType {
    /// Types with a dedicated collection, in sweep order.
    pub const BUILTIN: [AdType; 11] = [
        AdType::WorkerNode,
        AdType::WorkerNodePrivate,
        AdType::Scheduler,
        AdType::Submitter,
        AdType::Manager,
        AdType::License,
        AdType::RegistrySelf,
        AdType::Storage,
        AdType::Negotiator,
        AdType::Had,
        AdType::CkptServer,
    ];

    /// The `MyType` value advertisers of this type declare.
    pub fn my_type(self) -> &'static str {
        match self {
            AdType::WorkerNode => "Machine",
            AdType::WorkerNodePrivate => "MachinePrivate",
            AdType::Scheduler => "Scheduler",
            AdType::Submitter => "Submitter",
            AdType::Manager => "DaemonMaster",
            AdType::License => "License",
            AdType::RegistrySelf => "Collector",
            AdType::Storage => "Storage",
            AdType::Negotiator => "Negotiator",
            AdType::Had => "HAD",
            AdType::CkptServer => "CkptServer",
            AdType::Generic => "Generic",
            AdType::Any => "Any",
        }
    }

    /// Attribute holding the advertiser's own contact address, for the
    /// types whose identity key carries an address component.
    pub fn address_attr(self) -> Option<&'static str> {
        match self {
            AdType::WorkerNode | AdType::WorkerNodePrivate => Some("StartdIpAddr"),
            AdType::Scheduler | AdType::Submitter => Some("ScheddIpAddr"),
            AdType::License => Some("MyAddress"),
            _ => None,
        }
    }

    /// Builtin type whose `MyType` matches `name`, case-insensitively.
    pub fn from_my_type(name: &str) -> Option<AdType> {
        AdType::BUILTIN
            .iter()
            .copied()
            .find(|t| t.my_type().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for AdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.my_type())
    }
}

/// What a command asks the registry to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Update,
    UpdateWithAck,
    Merge,
    Query,
    Invalidate,
}

/// Result of an update or merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Updated,
    RejectedNoKey,
    RejectedUnknownCommand,
    /// The address check or the configured validation predicate failed.
    RejectedValidation,
    /// Merge for a key with no stored advertisement.
    RejectedNoExisting,
}

impl IngestOutcome {
    pub fn is_stored(self) -> bool {
        matches!(self, IngestOutcome::Inserted | IngestOutcome::Updated)
    }
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn my_type_lookup_ignores_case() {
        assert_eq!(AdType::from_my_type("machine"), Some(AdType::WorkerNode));
        assert_eq!(AdType::from_my_type("DAEMONMASTER"), Some(AdType::Manager));
        assert_eq!(AdType::from_my_type("Generic"), None);
        assert_eq!(AdType::from_my_type("Accounting"), None);
    }

    #[test]
    fn only_addressed_types_have_address_attr() {
        assert_eq!(AdType::WorkerNode.address_attr(), Some("StartdIpAddr"));
        assert_eq!(AdType::Manager.address_attr(), None);
        assert_eq!(AdType::RegistrySelf.address_attr(), None);
    }
}

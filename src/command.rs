//! Wire command codes and the table mapping each code to the operation and
//! the advertisement type it targets.
//!
//! The table is built once at startup and shared by every connection; it is
//! the only place that knows which numeric code means what.

use std::collections::HashMap;

use crate::types::{AdType, CommandKind};

pub const UPDATE_STARTD_AD: u32 = 0;
pub const UPDATE_SCHEDD_AD: u32 = 1;
pub const UPDATE_MASTER_AD: u32 = 2;
pub const UPDATE_CKPT_SRVR_AD: u32 = 4;
pub const QUERY_STARTD_ADS: u32 = 5;
pub const QUERY_SCHEDD_ADS: u32 = 6;
pub const QUERY_MASTER_ADS: u32 = 7;
pub const QUERY_CKPT_SRVR_ADS: u32 = 9;
pub const QUERY_STARTD_PVT_ADS: u32 = 10;
pub const UPDATE_SUBMITTOR_AD: u32 = 11;
pub const QUERY_SUBMITTOR_ADS: u32 = 12;
pub const INVALIDATE_STARTD_ADS: u32 = 13;
pub const INVALIDATE_SCHEDD_ADS: u32 = 14;
pub const INVALIDATE_MASTER_ADS: u32 = 15;
pub const INVALIDATE_CKPT_SRVR_ADS: u32 = 16;
pub const INVALIDATE_SUBMITTOR_ADS: u32 = 17;
pub const UPDATE_COLLECTOR_AD: u32 = 18;
pub const QUERY_COLLECTOR_ADS: u32 = 19;
pub const INVALIDATE_COLLECTOR_ADS: u32 = 20;
pub const UPDATE_LICENSE_AD: u32 = 42;
pub const QUERY_LICENSE_ADS: u32 = 43;
pub const INVALIDATE_LICENSE_ADS: u32 = 44;
pub const UPDATE_STORAGE_AD: u32 = 45;
pub const QUERY_STORAGE_ADS: u32 = 46;
pub const INVALIDATE_STORAGE_ADS: u32 = 47;
pub const QUERY_ANY_ADS: u32 = 48;
pub const UPDATE_NEGOTIATOR_AD: u32 = 49;
pub const QUERY_NEGOTIATOR_ADS: u32 = 50;
pub const INVALIDATE_NEGOTIATOR_ADS: u32 = 51;
pub const UPDATE_HAD_AD: u32 = 55;
pub const QUERY_HAD_ADS: u32 = 56;
pub const INVALIDATE_HAD_ADS: u32 = 57;
pub const UPDATE_AD_GENERIC: u32 = 58;
pub const INVALIDATE_ADS_GENERIC: u32 = 59;
pub const UPDATE_STARTD_AD_WITH_ACK: u32 = 60;
pub const MERGE_STARTD_AD: u32 = 62;
pub const QUERY_GENERIC_ADS: u32 = 74;

/// One registered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub code: u32,
    pub kind: CommandKind,
    pub ad_type: AdType,
    pub name: &'static str,
}

#[derive(Debug, Clone)]
pub struct CommandTable {
    by_code: HashMap<u32, CommandSpec>,
}

impl CommandTable {
    pub fn new() -> Self {
        use AdType::*;
        use CommandKind::*;

        let entries: [(u32, CommandKind, AdType, &'static str); 37] = [
            (UPDATE_STARTD_AD, Update, WorkerNode, "UPDATE_STARTD_AD"),
            (UPDATE_STARTD_AD_WITH_ACK, UpdateWithAck, WorkerNode, "UPDATE_STARTD_AD_WITH_ACK"),
            (MERGE_STARTD_AD, Merge, WorkerNode, "MERGE_STARTD_AD"),
            (QUERY_STARTD_ADS, Query, WorkerNode, "QUERY_STARTD_ADS"),
            (QUERY_STARTD_PVT_ADS, Query, WorkerNodePrivate, "QUERY_STARTD_PVT_ADS"),
            (INVALIDATE_STARTD_ADS, Invalidate, WorkerNode, "INVALIDATE_STARTD_ADS"),
            (UPDATE_SCHEDD_AD, Update, Scheduler, "UPDATE_SCHEDD_AD"),
            (QUERY_SCHEDD_ADS, Query, Scheduler, "QUERY_SCHEDD_ADS"),
            (INVALIDATE_SCHEDD_ADS, Invalidate, Scheduler, "INVALIDATE_SCHEDD_ADS"),
            (UPDATE_SUBMITTOR_AD, Update, Submitter, "UPDATE_SUBMITTOR_AD"),
            (QUERY_SUBMITTOR_ADS, Query, Submitter, "QUERY_SUBMITTOR_ADS"),
            (INVALIDATE_SUBMITTOR_ADS, Invalidate, Submitter, "INVALIDATE_SUBMITTOR_ADS"),
            (UPDATE_MASTER_AD, Update, Manager, "UPDATE_MASTER_AD"),
            (QUERY_MASTER_ADS, Query, Manager, "QUERY_MASTER_ADS"),
            (INVALIDATE_MASTER_ADS, Invalidate, Manager, "INVALIDATE_MASTER_ADS"),
            (UPDATE_CKPT_SRVR_AD, Update, CkptServer, "UPDATE_CKPT_SRVR_AD"),
            (QUERY_CKPT_SRVR_ADS, Query, CkptServer, "QUERY_CKPT_SRVR_ADS"),
            (INVALIDATE_CKPT_SRVR_ADS, Invalidate, CkptServer, "INVALIDATE_CKPT_SRVR_ADS"),
            (UPDATE_COLLECTOR_AD, Update, RegistrySelf, "UPDATE_COLLECTOR_AD"),
            (QUERY_COLLECTOR_ADS, Query, RegistrySelf, "QUERY_COLLECTOR_ADS"),
            (INVALIDATE_COLLECTOR_ADS, Invalidate, RegistrySelf, "INVALIDATE_COLLECTOR_ADS"),
            (UPDATE_LICENSE_AD, Update, License, "UPDATE_LICENSE_AD"),
            (QUERY_LICENSE_ADS, Query, License, "QUERY_LICENSE_ADS"),
            (INVALIDATE_LICENSE_ADS, Invalidate, License, "INVALIDATE_LICENSE_ADS"),
            (UPDATE_STORAGE_AD, Update, Storage, "UPDATE_STORAGE_AD"),
            (QUERY_STORAGE_ADS, Query, Storage, "QUERY_STORAGE_ADS"),
            (INVALIDATE_STORAGE_ADS, Invalidate, Storage, "INVALIDATE_STORAGE_ADS"),
            (UPDATE_NEGOTIATOR_AD, Update, Negotiator, "UPDATE_NEGOTIATOR_AD"),
            (QUERY_NEGOTIATOR_ADS, Query, Negotiator, "QUERY_NEGOTIATOR_ADS"),
            (INVALIDATE_NEGOTIATOR_ADS, Invalidate, Negotiator, "INVALIDATE_NEGOTIATOR_ADS"),
            (UPDATE_HAD_AD, Update, Had, "UPDATE_HAD_AD"),
            (QUERY_HAD_ADS, Query, Had, "QUERY_HAD_ADS"),
            (INVALIDATE_HAD_ADS, Invalidate, Had, "INVALIDATE_HAD_ADS"),
            (UPDATE_AD_GENERIC, Update, Generic, "UPDATE_AD_GENERIC"),
            (QUERY_GENERIC_ADS, Query, Generic, "QUERY_GENERIC_ADS"),
            (INVALIDATE_ADS_GENERIC, Invalidate, Generic, "INVALIDATE_ADS_GENERIC"),
            (QUERY_ANY_ADS, Query, Any, "QUERY_ANY_ADS"),
        ];

        let by_code = entries
            .into_iter()
            .map(|(code, kind, ad_type, name)| {
                (
                    code,
                    CommandSpec {
                        code,
                        kind,
                        ad_type,
                        name,
                    },
                )
            })
            .collect();
        Self { by_code }
    }

    pub fn get(&self, code: u32) -> Option<&CommandSpec> {
        self.by_code.get(&code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.by_code.values()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_are_unique() {
        let table = CommandTable::new();
        assert_eq!(table.len(), 37);
        let names: HashSet<_> = table.iter().map(|s| s.name).collect();
        assert_eq!(names.len(), table.len());
    }

    #[test]
    fn every_builtin_type_except_private_supports_all_three_verbs() {
        let table = CommandTable::new();
        for t in AdType::BUILTIN {
            if t == AdType::WorkerNodePrivate {
                continue;
            }
            for kind in [CommandKind::Update, CommandKind::Query, CommandKind::Invalidate] {
                assert!(
                    table.iter().any(|s| s.kind == kind && s.ad_type == t),
                    "{:?} {:?}",
                    kind,
                    t
                );
            }
        }
    }

    #[test]
    fn private_ads_are_query_only() {
        let table = CommandTable::new();
        let kinds: Vec<_> = table
            .iter()
            .filter(|s| s.ad_type == AdType::WorkerNodePrivate)
            .map(|s| s.kind)
            .collect();
        assert_eq!(kinds, vec![CommandKind::Query]);
    }

    #[test]
    fn unknown_code_is_absent() {
        assert!(CommandTable::new().get(9999).is_none());
        let spec = CommandTable::new().get(MERGE_STARTD_AD).copied();
        assert_eq!(spec.map(|s| s.kind), Some(CommandKind::Merge));
    }
}

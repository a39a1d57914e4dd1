//! A registry of cluster advertisements.
//!
//! Daemons send typed advertisements describing themselves; the registry
//! keeps the latest one per identity, expires the ones nobody refreshes,
//! answers predicate queries over them and forwards updates upstream.

pub mod classad;
pub mod collection;
pub mod command;
pub mod config;
pub mod error;
pub mod forward;
pub mod housekeeper;
pub mod key;
pub mod liveness;
pub mod protocol;
pub mod query_pool;
pub mod self_ad;
pub mod server;
pub mod stats;
pub mod store;
pub mod types;

pub use classad::{parse_expr, Ad, Expr, Value};
pub use collection::{AdCollection, Slot};
pub use config::Config;
pub use error::CollectorError;
pub use key::IdentityKey;
pub use liveness::{LivenessState, OperatorNotifier};
pub use store::{IngestResult, InvalidationPolicy, QuerySpec, RegistryStore, StoreConfig};
pub use types::{AdType, CommandKind, IngestOutcome};

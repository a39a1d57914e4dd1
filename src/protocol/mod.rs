//! The registry wire protocol: framing plus the per-command handlers.

pub mod handlers;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::forward::ForwardItem;
use crate::query_pool::QueryPool;
use crate::store::RegistryStore;

pub use handlers::{dispatch, Next};

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Deadline for reading a command and its advertisement.
    pub client_timeout: Duration,
    /// Deadline for streaming a whole query reply.
    pub query_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            client_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(60),
            max_message_size: wire::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Everything a connection handler needs, shared by all connections.
pub struct Context {
    pub store: Arc<RegistryStore>,
    pub pool: QueryPool,
    pub forward: Option<mpsc::Sender<ForwardItem>>,
    pub limits: Limits,
}

impl Context {
    /// Queues `item` for the forwarder. Never waits: a full queue drops it.
    pub fn forward(&self, item: ForwardItem) {
        let Some(tx) = &self.forward else {
            return;
        };
        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                warn!("forward queue full, dropping command {}", item.command)
            }
            Err(TrySendError::Closed(_)) => warn!("forwarder is gone"),
        }
    }
}

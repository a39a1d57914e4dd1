//! Replication of updates and invalidations to upstream registries.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::classad::Ad;
use crate::command::{CommandSpec, CommandTable};
use crate::error::CollectorError;
use crate::protocol::wire;
use crate::types::{AdType, CommandKind};

/// Share of wall-clock time reconnect attempts to one upstream may use.
pub const RECONNECT_TIME_FRACTION: f64 = 0.05;
/// Longest back-off between reconnect attempts.
pub const RECONNECT_MAX_INTERVAL: Duration = Duration::from_secs(1200);
const RECONNECT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// One command to re-issue upstream: an update with its stored ad (and
/// private ad for worker nodes), or an invalidation with its query.
#[derive(Debug, Clone)]
pub struct ForwardItem {
    pub command: u32,
    pub ad: Arc<Ad>,
    pub private: Option<Arc<Ad>>,
}

/// Rate limit for reconnects: an attempt that took `d` blocks the next one
/// for `d / fraction`, clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct Timeslice {
    fraction: f64,
    min_interval: Duration,
    max_interval: Duration,
    next_start: Option<Instant>,
}

impl Timeslice {
    pub fn new(fraction: f64, min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            fraction,
            min_interval,
            max_interval,
            next_start: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_start.map_or(true, |t| now >= t)
    }

    /// Records a failed attempt that started at `started` and took `took`.
    pub fn record_failure(&mut self, started: Instant, took: Duration) {
        let wait = took
            .div_f64(self.fraction)
            .clamp(self.min_interval, self.max_interval);
        self.next_start = Some(started + wait);
    }

    pub fn reset(&mut self) {
        self.next_start = None;
    }
}

impl Default for Timeslice {
    fn default() -> Self {
        Self::new(
            RECONNECT_TIME_FRACTION,
            RECONNECT_MIN_INTERVAL,
            RECONNECT_MAX_INTERVAL,
        )
    }
}

#[derive(Debug)]
struct Upstream {
    addr: String,
    stream: Option<TcpStream>,
    timeslice: Timeslice,
}

impl Upstream {
    fn new(addr: String) -> Self {
        Self {
            addr,
            stream: None,
            timeslice: Timeslice::default(),
        }
    }

    async fn connect(&mut self, timeout: Duration) -> bool {
        let started = Instant::now();
        if !self.timeslice.ready(started) {
            debug!("not reconnecting to {} yet", self.addr);
            return false;
        }
        match tokio::time::timeout(timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                info!("connected to upstream registry {}", self.addr);
                self.timeslice.reset();
                self.stream = Some(stream);
                true
            }
            Ok(Err(e)) => {
                warn!("cannot connect to upstream registry {}: {}", self.addr, e);
                self.timeslice.record_failure(started, started.elapsed());
                false
            }
            Err(_) => {
                warn!("connecting to upstream registry {} timed out", self.addr);
                self.timeslice.record_failure(started, started.elapsed());
                false
            }
        }
    }

    async fn send(&mut self, item: &ForwardItem, spec: &CommandSpec, timeout: Duration) {
        if self.stream.is_none() && !self.connect(timeout).await {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match tokio::time::timeout(timeout, write_item(stream, item, spec)).await {
            Ok(Ok(())) => debug!("forwarded {} to {}", spec.name, self.addr),
            Ok(Err(e)) => {
                warn!("forwarding {} to {} failed: {}", spec.name, self.addr, e);
                self.stream = None;
            }
            Err(_) => {
                warn!("forwarding {} to {} timed out", spec.name, self.addr);
                self.stream = None;
            }
        }
    }
}

async fn write_item(
    stream: &mut TcpStream,
    item: &ForwardItem,
    spec: &CommandSpec,
) -> Result<(), CollectorError> {
    wire::write_command(stream, item.command).await?;
    wire::write_ad(stream, &item.ad).await?;
    let is_update = matches!(spec.kind, CommandKind::Update | CommandKind::UpdateWithAck);
    if is_update && spec.ad_type == AdType::WorkerNode {
        wire::write_optional_ad(stream, item.private.as_deref()).await?;
    }
    if matches!(spec.kind, CommandKind::UpdateWithAck | CommandKind::Invalidate)
        && !wire::read_ack(stream).await?
    {
        debug!("upstream did not accept forwarded {}", spec.name);
    }
    Ok(())
}

pub struct Forwarder {
    upstreams: Vec<Upstream>,
    /// Forward only these `MyType`s; `None` forwards everything.
    types: Option<Vec<String>>,
    commands: CommandTable,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(hosts: Vec<String>, types: Option<Vec<String>>, timeout: Duration) -> Self {
        Self {
            upstreams: hosts.into_iter().map(Upstream::new).collect(),
            types,
            commands: CommandTable::new(),
            timeout,
        }
    }

    /// The `MyType` an item is filtered on.
    fn item_type(&self, item: &ForwardItem, spec: &CommandSpec) -> String {
        match (spec.kind, spec.ad_type) {
            (CommandKind::Invalidate, AdType::Generic) => {
                item.ad.lookup_string("TargetType").unwrap_or_default()
            }
            (CommandKind::Invalidate, t) => t.my_type().to_string(),
            (_, t) => item.ad.my_type().unwrap_or_else(|| t.my_type().to_string()),
        }
    }

    pub fn accepts(&self, item: &ForwardItem) -> bool {
        let Some(spec) = self.commands.get(item.command) else {
            return false;
        };
        match &self.types {
            None => true,
            Some(types) => {
                let t = self.item_type(item, spec);
                types.iter().any(|allowed| allowed.eq_ignore_ascii_case(&t))
            }
        }
    }

    /// Forwards items until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ForwardItem>) -> anyhow::Result<()> {
        info!(
            "forwarding to {} upstream registr{}",
            self.upstreams.len(),
            if self.upstreams.len() == 1 { "y" } else { "ies" }
        );
        while let Some(item) = rx.recv().await {
            if !self.accepts(&item) {
                debug!("not forwarding command {}: filtered", item.command);
                continue;
            }
            let Some(spec) = self.commands.get(item.command).copied() else {
                continue;
            };
            let timeout = self.timeout;
            join_all(
                self.upstreams
                    .iter_mut()
                    .map(|u| u.send(&item, &spec, timeout)),
            )
            .await;
        }
        info!("forward channel closed, shutting down");
        Ok(())
    }
}

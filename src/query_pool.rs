//! Bounded pool for expensive queries.
//!
//! A pooled query owns its client connection and streams the reply itself,
//! so the connection loop that handed it off returns immediately. At most
//! `max_workers` run at once; at most `max_pending` wait for a slot, and
//! anything beyond that is dropped.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::CollectorError;
use crate::store::QuerySpec;
use crate::types::AdType;

/// Which queries are answered on the connection task instead of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InProcPolicy {
    Always,
    Never,
    SmallTable,
    SmallQuery,
    SmallTableOrQuery,
    SmallTableAndQuery,
}

impl InProcPolicy {
    pub fn in_proc(self, ad_type: AdType, spec: &QuerySpec) -> bool {
        let small_table = !is_big_table(ad_type);
        let small_query = spec.is_small();
        match self {
            InProcPolicy::Always => true,
            InProcPolicy::Never => false,
            InProcPolicy::SmallTable => small_table,
            InProcPolicy::SmallQuery => small_query,
            InProcPolicy::SmallTableOrQuery => small_table || small_query,
            InProcPolicy::SmallTableAndQuery => small_table && small_query,
        }
    }
}

fn is_big_table(ad_type: AdType) -> bool {
    matches!(
        ad_type,
        AdType::WorkerNode
            | AdType::WorkerNodePrivate
            | AdType::Manager
            | AdType::Generic
            | AdType::Any
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    InProc,
    Pooled,
}

#[derive(Debug, Clone)]
pub struct QueryPool {
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    max_workers: usize,
    max_pending: usize,
    max_worktime: Option<Duration>,
    policy: InProcPolicy,
}

impl QueryPool {
    /// `max_worktime` of `None` lets a worker run until its reply is written.
    pub fn new(
        max_workers: usize,
        max_pending: usize,
        max_worktime: Option<Duration>,
        policy: InProcPolicy,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            pending: Arc::new(AtomicUsize::new(0)),
            max_workers,
            max_pending,
            max_worktime,
            policy,
        }
    }

    pub fn route(&self, ad_type: AdType, spec: &QuerySpec) -> Route {
        if self.max_workers == 0 || self.policy.in_proc(ad_type, spec) {
            Route::InProc
        } else {
            Route::Pooled
        }
    }

    /// Hands `work` to the pool. Fails without running it when every
    /// worker is busy and the pending queue is full.
    pub fn submit<F>(&self, work: F) -> Result<JoinHandle<()>, CollectorError>
    where
        F: Future<Output = Result<(), CollectorError>> + Send + 'static,
    {
        let deadline = self.max_worktime;
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(tokio::spawn(async move {
                let _permit = permit;
                run_bounded(work, deadline).await;
            }));
        }

        let max_pending = self.max_pending;
        if self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                (p < max_pending).then_some(p + 1)
            })
            .is_err()
        {
            return Err(CollectorError::QueryRejected {
                reason: format!(
                    "{} workers busy and {} queries pending",
                    self.max_workers, max_pending
                ),
            });
        }

        let permits = Arc::clone(&self.permits);
        let pending = Arc::clone(&self.pending);
        Ok(tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            pending.fetch_sub(1, Ordering::SeqCst);
            let Ok(_permit) = permit else {
                return;
            };
            run_bounded(work, deadline).await;
        }))
    }

    pub fn running(&self) -> usize {
        self.max_workers
            .saturating_sub(self.permits.available_permits())
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn run_bounded<F>(work: F, deadline: Option<Duration>)
where
    F: Future<Output = Result<(), CollectorError>>,
{
    let result = match deadline {
        Some(d) => match tokio::time::timeout(d, work).await {
            Ok(r) => r,
            Err(_) => Err(CollectorError::Timeout {
                phase: "running a pooled query",
            }),
        },
        None => work.await,
    };
    match result {
        Ok(()) => debug!("query worker finished"),
        Err(e) => warn!("query worker failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classad::Expr;
    use tokio::sync::oneshot;

    fn spec(projection: bool, limit: Option<usize>) -> QuerySpec {
        let mut s = QuerySpec::matching(Expr::literal(true));
        s.projection = projection.then(|| vec!["Name".to_string()]);
        s.limit = limit;
        s
    }

    #[test]
    fn policy_combines_table_and_query_size() {
        let small = spec(true, Some(5));
        let big = spec(false, None);
        use InProcPolicy::*;
        assert!(SmallTableOrQuery.in_proc(AdType::WorkerNode, &small));
        assert!(!SmallTableOrQuery.in_proc(AdType::WorkerNode, &big));
        assert!(SmallTableOrQuery.in_proc(AdType::Scheduler, &big));
        assert!(!SmallTableAndQuery.in_proc(AdType::Scheduler, &big));
        assert!(!SmallQuery.in_proc(AdType::Scheduler, &spec(true, Some(10))));
        assert!(Always.in_proc(AdType::Any, &big));
        assert!(!Never.in_proc(AdType::Scheduler, &small));
    }

    #[test]
    fn zero_workers_means_in_process() {
        let pool = QueryPool::new(0, 10, None, InProcPolicy::Never);
        assert_eq!(pool.route(AdType::WorkerNode, &spec(false, None)), Route::InProc);
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let pool = QueryPool::new(1, 1, None, InProcPolicy::Never);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let busy = pool
            .submit(async move {
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();
        let queued = pool.submit(async { Ok(()) }).unwrap();
        assert_eq!(pool.pending(), 1);
        assert!(matches!(
            pool.submit(async { Ok(()) }),
            Err(CollectorError::QueryRejected { .. })
        ));

        release_tx.send(()).unwrap();
        busy.await.unwrap();
        queued.await.unwrap();
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn worktime_limit_cancels_worker() {
        let pool = QueryPool::new(1, 0, Some(Duration::from_millis(20)), InProcPolicy::Never);
        let (tx, rx) = oneshot::channel::<()>();
        let handle = pool
            .submit(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                let _ = tx.send(());
                Ok(())
            })
            .unwrap();
        handle.await.unwrap();
        assert!(rx.await.is_err());
    }
}

//! Update, query and invalidate handlers.
//!
//! Handlers are generic over the transport so tests can drive them over an
//! in-memory duplex pipe.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::command::CommandSpec;
use crate::error::CollectorError;
use crate::forward::ForwardItem;
use crate::query_pool::Route;
use crate::store::{QuerySpec, RegistryStore};
use crate::types::{AdType, CommandKind};

use super::{wire, Context};

/// What the connection loop does after a command.
#[derive(Debug)]
pub enum Next<S> {
    /// Read the next command from the same connection.
    Continue(S),
    /// A query worker owns the connection now.
    HandedOff,
}

async fn timed<T, F>(limit: Duration, phase: &'static str, fut: F) -> Result<T, CollectorError>
where
    F: Future<Output = Result<T, CollectorError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(CollectorError::Timeout { phase }),
    }
}

/// Runs one command whose code has already been read. An error means the
/// request was malformed or timed out and the connection must be dropped.
pub async fn dispatch<S>(
    ctx: &Arc<Context>,
    cmd: u32,
    mut stream: S,
    peer: &str,
) -> Result<Next<S>, CollectorError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let limits = ctx.limits;
    let Some(spec) = ctx.store.commands().get(cmd).copied() else {
        warn!("{} from {}, skipping it", CollectorError::UnknownCommand(cmd), peer);
        // every command carries one advertisement frame; skip it
        timed(
            limits.client_timeout,
            "skipping an unknown command",
            wire::read_frame(&mut stream, limits.max_message_size),
        )
        .await?;
        return Ok(Next::Continue(stream));
    };
    match spec.kind {
        CommandKind::Update | CommandKind::UpdateWithAck | CommandKind::Merge => {
            handle_update(ctx, spec, &mut stream, peer).await?
        }
        CommandKind::Invalidate => handle_invalidate(ctx, spec, &mut stream, peer).await?,
        CommandKind::Query => return handle_query(ctx, spec, stream, peer).await,
    }
    Ok(Next::Continue(stream))
}

async fn handle_update<S>(
    ctx: &Context,
    spec: CommandSpec,
    stream: &mut S,
    peer: &str,
) -> Result<(), CollectorError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limits = ctx.limits;
    let (ad, private) = timed(limits.client_timeout, "reading an update", async {
        let ad = wire::read_ad(stream, limits.max_message_size).await?;
        let private = if spec.ad_type == AdType::WorkerNode && spec.kind != CommandKind::Merge {
            wire::read_optional_ad(stream, limits.max_message_size).await?
        } else {
            None
        };
        Ok::<_, CollectorError>((ad, private))
    })
    .await?;

    let result = ctx.store.ingest(spec.code, ad, private, Some(peer));
    if spec.kind == CommandKind::UpdateWithAck {
        timed(
            limits.client_timeout,
            "acknowledging an update",
            wire::write_ack(stream, result.outcome.is_stored()),
        )
        .await?;
    }
    if let (Some(stored), true) = (result.stored, result.should_forward) {
        ctx.forward(ForwardItem {
            command: spec.code,
            ad: stored,
            private: result.private,
        });
    }
    Ok(())
}

/// The acknowledgment goes out before any work is done.
async fn handle_invalidate<S>(
    ctx: &Context,
    spec: CommandSpec,
    stream: &mut S,
    peer: &str,
) -> Result<(), CollectorError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limits = ctx.limits;
    let query = timed(
        limits.client_timeout,
        "reading an invalidation",
        wire::read_ad(stream, limits.max_message_size),
    )
    .await?;
    timed(
        limits.client_timeout,
        "acknowledging an invalidation",
        wire::write_ack(stream, true),
    )
    .await?;

    match ctx.store.invalidate(spec.ad_type, &query) {
        // an ignored invalidation stays local
        Ok(_) if ctx.store.config().ignore_invalidate => {}
        Ok(_) => ctx.forward(ForwardItem {
            command: spec.code,
            ad: Arc::new(query),
            private: None,
        }),
        Err(e) => warn!("{} from {} failed: {}", spec.name, peer, e),
    }
    Ok(())
}

async fn handle_query<S>(
    ctx: &Arc<Context>,
    spec: CommandSpec,
    mut stream: S,
    peer: &str,
) -> Result<Next<S>, CollectorError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let limits = ctx.limits;
    let query = timed(
        limits.client_timeout,
        "reading a query",
        wire::read_ad(&mut stream, limits.max_message_size),
    )
    .await?;
    let query = match QuerySpec::from_query_ad(query) {
        Ok(q) => q,
        Err(e) => {
            warn!("{} from {} rejected: {}", spec.name, peer, e);
            timed(
                limits.query_timeout,
                "writing a query reply",
                wire::write_reply_end(&mut stream),
            )
            .await?;
            return Ok(Next::Continue(stream));
        }
    };

    match ctx.pool.route(spec.ad_type, &query) {
        Route::InProc => {
            stream_reply(&ctx.store, spec, &query, &mut stream, peer, limits.query_timeout).await?;
            Ok(Next::Continue(stream))
        }
        Route::Pooled => {
            let store = Arc::clone(&ctx.store);
            let owner = peer.to_string();
            let work = async move {
                let mut stream = stream;
                stream_reply(&store, spec, &query, &mut stream, &owner, limits.query_timeout)
                    .await
            };
            match ctx.pool.submit(work) {
                Ok(_) => debug!("{} from {} handed to the query pool", spec.name, peer),
                Err(e) => warn!("dropping {} from {}: {}", spec.name, peer, e),
            }
            Ok(Next::HandedOff)
        }
    }
}

async fn stream_reply<S>(
    store: &RegistryStore,
    spec: CommandSpec,
    query: &QuerySpec,
    stream: &mut S,
    peer: &str,
    limit: Duration,
) -> Result<(), CollectorError>
where
    S: AsyncWrite + Unpin,
{
    let mut matches = store.evaluate(spec.ad_type, query);
    timed(limit, "writing a query reply", async {
        for ad in matches.by_ref() {
            wire::write_reply_item(stream, &query.shape(&ad)).await?;
        }
        wire::write_reply_end(stream).await
    })
    .await?;
    let visitor = matches.visitor();
    debug!(
        "{} from {}: {} matched, {} skipped",
        spec.name,
        peer,
        visitor.matched(),
        visitor.skipped()
    );
    Ok(())
}

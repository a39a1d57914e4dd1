//! TCP front end: one task per connection, many commands per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::error::CollectorError;
use crate::protocol::{dispatch, wire, Context, Next};

pub struct Server {
    listener: TcpListener,
    ctx: Arc<Context>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, ctx: Arc<Context>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the task is aborted.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("registry listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(&ctx, stream, peer).await {
                    warn!("dropping connection from {}: {}", peer, e);
                }
            });
        }
    }
}

/// Reads commands until the peer closes, goes idle past the client timeout,
/// or hands the connection to a query worker.
pub async fn serve_connection<S>(
    ctx: &Arc<Context>,
    mut stream: S,
    peer: SocketAddr,
) -> Result<(), CollectorError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let origin = peer.to_string();
    loop {
        let cmd = match tokio::time::timeout(
            ctx.limits.client_timeout,
            wire::read_command(&mut stream),
        )
        .await
        {
            Ok(cmd) => cmd?,
            Err(_) => {
                debug!("closing idle connection from {}", peer);
                return Ok(());
            }
        };
        let Some(cmd) = cmd else {
            debug!("{} closed the connection", peer);
            return Ok(());
        };
        match dispatch(ctx, cmd, stream, &origin).await? {
            Next::Continue(s) => stream = s,
            Next::HandedOff => return Ok(()),
        }
    }
}

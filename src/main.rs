//! collectord entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

use collectord::config::Config;
use collectord::forward::Forwarder;
use collectord::housekeeper::Housekeeper;
use collectord::liveness::LogNotifier;
use collectord::protocol::Context;
use collectord::self_ad::SelfAdvertiser;
use collectord::server::Server;
use collectord::store::RegistryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting collectord with config: {:?}", cfg);

    let store = Arc::new(RegistryStore::new(cfg.store_config()?));
    let mut handles = Vec::new();

    // Forwarding
    let forward_tx = if cfg.forward_hosts.is_empty() {
        None
    } else {
        let (tx, rx) = mpsc::channel(1024);
        let forwarder = Forwarder::new(
            cfg.forward_hosts.clone(),
            cfg.forward_types.clone(),
            Duration::from_secs(cfg.client_timeout_secs),
        );
        handles.push(tokio::spawn(async move {
            if let Err(e) = forwarder.run(rx).await {
                error!("Forwarder failed: {}", e);
            }
        }));
        Some(tx)
    };

    // Server
    let ctx = Arc::new(Context {
        store: Arc::clone(&store),
        pool: cfg.query_pool(),
        forward: forward_tx.clone(),
        limits: cfg.limits(),
    });
    let server = Server::bind(cfg.bind, ctx).await?;
    let address = server.local_addr()?;
    handles.push(tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server failed: {}", e);
        }
    }));

    // Housekeeping
    match cfg.housekeeping_interval() {
        Some(period) => {
            let housekeeper = Housekeeper::new(Arc::clone(&store), Arc::new(LogNotifier));
            handles.push(tokio::spawn(async move {
                if let Err(e) = housekeeper.run(period).await {
                    error!("Housekeeper failed: {}", e);
                }
            }));
        }
        None => info!("housekeeping disabled"),
    }

    // Own advertisement
    let advertiser = SelfAdvertiser::new(
        Arc::clone(&store),
        cfg.registry_name(),
        address.to_string(),
        cfg.update_interval_secs,
        forward_tx,
    );
    let period = Duration::from_secs(cfg.update_interval_secs.max(1));
    handles.push(tokio::spawn(async move {
        if let Err(e) = advertiser.run(period).await {
            error!("Self advertisement failed: {}", e);
        }
    }));

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    for handle in handles {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}

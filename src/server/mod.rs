//! The edge server: accepts tunnel connections from peers and public
//! connections from regular TLS clients, routing the latter by SNI
//! (spec.md §2).

pub mod handshake;
pub mod listener;
pub mod throttle;

use fernet::Fernet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::peer_manager::PeerManager;

/// Binds both listeners described by `config` and runs them until the
/// process is torn down. `fernet` authenticates incoming handshake tokens.
pub async fn run(config: ServerConfig, fernet: Fernet) -> crate::error::Result<()> {
    config.validate()?;

    let config = Arc::new(config);
    let fernet = Arc::new(fernet);
    let registry = Arc::new(PeerManager::new());

    let tunnel_listener = TcpListener::bind(config.tunnel_listen)
        .await
        .map_err(crate::error::Error::from)?;
    let public_listener = TcpListener::bind(config.public_listen)
        .await
        .map_err(crate::error::Error::from)?;

    info!(
        tunnel = %config.tunnel_listen,
        public = %config.public_listen,
        "edge server listening"
    );

    let tunnel_task = tokio::spawn(listener::run_tunnel_listener(
        tunnel_listener,
        fernet,
        registry.clone(),
        config.clone(),
    ));
    let public_task = tokio::spawn(listener::run_public_listener(
        public_listener,
        registry.clone(),
        config.clone(),
    ));
    let health_task = tokio::spawn(log_health_periodically(
        registry.clone(),
        config.ping_interval(),
    ));
    let reaper_task = tokio::spawn(reap_unresponsive_peers(
        registry,
        config.ping_interval(),
        config.ping_timeout(),
    ));

    let _ = tokio::join!(tunnel_task, public_task, health_task, reaper_task);
    Ok(())
}

async fn log_health_periodically(registry: Arc<PeerManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        let report = registry.health();
        info!(
            peers = report.peer_count,
            channels = report.channel_count,
            "registry health"
        );
    }
}

/// Tears down any peer whose tunnel has gone quiet for longer than
/// `ping_timeout` (spec.md §8 scenario 6: a client that stops answering
/// frames is evicted so its hostnames become servable again).
async fn reap_unresponsive_peers(
    registry: Arc<PeerManager>,
    sweep_interval: Duration,
    ping_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(sweep_interval.max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        for peer in registry.peers() {
            if peer.multiplexer().idle_for() > ping_timeout {
                tracing::warn!(
                    identity = ?peer.identity(),
                    idle = ?peer.multiplexer().idle_for(),
                    "peer unresponsive, tearing down tunnel"
                );
                registry.remove(&peer.identity());
            }
        }
    }
}

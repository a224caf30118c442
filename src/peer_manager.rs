//! The registry mapping hostnames and peer identities to live tunnels
//! (spec.md §2, "route an inbound connection by SNI to the right peer").

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::peer::Peer;

/// Maps hostnames and peer identities to the [`Peer`] that currently owns
/// them. Registering a peer atomically evicts whichever prior peer owned
/// any of its hostnames, so exactly one peer ever serves a given hostname.
#[derive(Default)]
pub struct PeerManager {
    by_hostname: RwLock<HashMap<String, Arc<Peer>>>,
    by_identity: RwLock<HashMap<[u8; 32], Arc<Peer>>>,
}

impl PeerManager {
    pub fn new() -> Self {
        PeerManager::default()
    }

    /// Registers `peer`, claiming every hostname in [`Peer::hostnames`] and
    /// evicting whoever held it before. Any prior owner left with no
    /// remaining hostnames has its tunnel torn down (spec.md §8 scenario 5:
    /// a peer that loses its only hostname is no longer reachable and is
    /// closed rather than left dangling).
    pub fn register(&self, peer: Arc<Peer>) {
        let mut evicted = Vec::new();
        {
            let mut by_hostname = self.by_hostname.write();
            for hostname in peer.hostnames() {
                if let Some(prior) = by_hostname.insert(normalize(hostname), peer.clone()) {
                    if prior.identity() != peer.identity() {
                        evicted.push(prior);
                    }
                }
            }
        }
        self.by_identity.write().insert(peer.identity(), peer);

        for prior in evicted {
            if !self.owns_any_hostname(&prior) {
                self.by_identity.write().remove(&prior.identity());
                prior.multiplexer().close();
            }
        }
    }

    fn owns_any_hostname(&self, peer: &Peer) -> bool {
        self.by_hostname
            .read()
            .values()
            .any(|owner| owner.identity() == peer.identity())
    }

    /// Removes a peer and every hostname mapping pointing at it, closing its
    /// tunnel.
    pub fn remove(&self, identity: &[u8; 32]) {
        if let Some(peer) = self.by_identity.write().remove(identity) {
            let mut by_hostname = self.by_hostname.write();
            by_hostname.retain(|_, v| v.identity() != peer.identity());
            drop(by_hostname);
            peer.multiplexer().close();
        }
    }

    pub fn get_by_hostname(&self, hostname: &str) -> Option<Arc<Peer>> {
        self.by_hostname.read().get(&normalize(hostname)).cloned()
    }

    pub fn get_by_identity(&self, identity: &[u8; 32]) -> Option<Arc<Peer>> {
        self.by_identity.read().get(identity).cloned()
    }

    /// Count of currently registered peers.
    pub fn connections(&self) -> usize {
        self.by_identity.read().len()
    }

    /// Snapshot of every currently registered peer, for periodic sweeps
    /// (e.g. reaping peers that stopped responding to PING).
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.by_identity.read().values().cloned().collect()
    }

    /// A serializable snapshot for the ambient health endpoint.
    pub fn health(&self) -> HealthReport {
        let by_identity = self.by_identity.read();
        HealthReport {
            peer_count: by_identity.len(),
            channel_count: by_identity
                .values()
                .map(|p| p.multiplexer().channel_count())
                .sum(),
            hostnames: self.by_hostname.read().keys().cloned().collect(),
        }
    }
}

fn normalize(hostname: &str) -> String {
    hostname.to_ascii_lowercase()
}

/// Snapshot of registry state, served over the ambient health endpoint.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub peer_count: usize,
    pub channel_count: usize,
    pub hostnames: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::PeerCrypto;
    use crate::multiplexer::Multiplexer;

    fn peer(identity: u8, hostnames: &[&str]) -> Arc<Peer> {
        let (a, _b) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(a);
        let mux = Multiplexer::spawn(
            read_half,
            write_half,
            PeerCrypto::new([0u8; 32], [0u8; 16]),
            1024,
            128,
            1024,
        );
        Arc::new(Peer::new(
            [identity; 32],
            hostnames.iter().map(|s| s.to_string()).collect(),
            mux,
            u64::MAX,
            1_000_000,
            1_000_000,
        ))
    }

    #[tokio::test]
    async fn register_and_lookup_by_hostname() {
        let manager = PeerManager::new();
        manager.register(peer(1, &["Example.com"]));
        assert!(manager.get_by_hostname("example.com").is_some());
        assert!(manager.get_by_hostname("EXAMPLE.COM").is_some());
    }

    #[tokio::test]
    async fn registering_new_peer_evicts_old_hostname_owner() {
        let manager = PeerManager::new();
        manager.register(peer(1, &["example.com"]));
        manager.register(peer(2, &["example.com"]));
        let owner = manager.get_by_hostname("example.com").unwrap();
        assert_eq!(owner.identity(), [2u8; 32]);
        // the evicted peer held no other hostname, so it's dropped entirely
        assert!(manager.get_by_identity(&[1u8; 32]).is_none());
        assert_eq!(manager.connections(), 1);
    }

    #[tokio::test]
    async fn evicted_peer_keeps_its_other_hostnames() {
        let manager = PeerManager::new();
        manager.register(peer(1, &["h1.example.com", "h2.example.com"]));
        manager.register(peer(2, &["h1.example.com"]));
        assert_eq!(
            manager.get_by_hostname("h1.example.com").unwrap().identity(),
            [2u8; 32]
        );
        assert_eq!(
            manager.get_by_hostname("h2.example.com").unwrap().identity(),
            [1u8; 32]
        );
        assert!(manager.get_by_identity(&[1u8; 32]).is_some());
    }

    #[tokio::test]
    async fn remove_clears_hostname_mappings() {
        let manager = PeerManager::new();
        manager.register(peer(1, &["example.com"]));
        manager.remove(&[1u8; 32]);
        assert!(manager.get_by_hostname("example.com").is_none());
        assert_eq!(manager.connections(), 0);
    }
}

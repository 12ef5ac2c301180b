//! Concurrency-safe store of registered remote peers

use crate::liveness;
use crate::peer::RemotePeer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tracing::{debug, info};

/// The shared-mutable hub of the relay. Every task mutates peer state
/// through these operations; the map lock is held only for a single map
/// operation or a listing copy, never across I/O.
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<RemotePeer>>>,
    next_seq: AtomicU64,
    probe_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            probe_timeout,
        }
    }

    /// Insert or replace by address. A replaced entry's connection is closed.
    pub async fn register(
        &self,
        addr: String,
        conn: TcpStream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<RemotePeer> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(RemotePeer::new(addr.clone(), conn, seq, permit));
        let replaced = self.peers.lock().await.insert(addr.clone(), Arc::clone(&peer));
        if let Some(old) = replaced {
            debug!("Replacing stale registration for {}", addr);
            close_peer(&old).await;
        }
        debug!("Registered remote peer {}", peer.addr());
        peer
    }

    /// Remove by address and close the removed connection. Idempotent: a
    /// missing entry is a no-op.
    pub async fn remove(&self, addr: &str) {
        let removed = self.peers.lock().await.remove(addr);
        if let Some(peer) = removed {
            info!("Remove remote peer {}", addr);
            close_peer(&peer).await;
        }
    }

    pub async fn contains(&self, addr: &str) -> bool {
        self.peers.lock().await.contains_key(addr)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Copy-out of all registered peers, ordered ascending by connection
    /// time with registration order breaking ties. The numbering operators
    /// see is derived from this ordering, so it must be deterministic.
    pub async fn snapshot(&self) -> Vec<Arc<RemotePeer>> {
        let mut peers: Vec<_> = self.peers.lock().await.values().cloned().collect();
        peers.sort_by_key(|p| p.sort_key());
        peers
    }

    /// Probe every registered peer and prune the dead ones.
    ///
    /// Probing blocks on connection reads, so the sweep walks a snapshot
    /// rather than holding the map lock; concurrent register/remove calls
    /// proceed freely in between.
    pub async fn sweep_all(&self) {
        debug!("Checking if remote peers are alive...");
        let peers = self.snapshot().await;
        debug!("Count of remote peers: {}", peers.len());
        for peer in peers {
            if !liveness::check_alive(&peer, self.probe_timeout).await {
                self.remove(peer.addr()).await;
            }
        }
        debug!("Count of remote peers alive: {}", self.len().await);
    }
}

/// Shut down a peer's connection once it has left the registry.
async fn close_peer(peer: &RemotePeer) {
    info!("Closing connection {}", peer.addr());
    // A pruned or replaced peer is not busy, so the lock is free; if a proxy
    // session still holds it the stream closes when the last Arc drops.
    if let Ok(mut conn) = peer.conn.try_lock() {
        if let Err(e) = conn.shutdown().await {
            debug!("Closing connection {} failed: {}", peer.addr(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Local};
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn test_registry() -> PeerRegistry {
        PeerRegistry::new(liveness::DEFAULT_PROBE_TIMEOUT)
    }

    #[tokio::test]
    async fn reregistration_replaces_prior_entry() {
        let registry = test_registry();
        let (_c1, s1) = tcp_pair().await;
        let (_c2, s2) = tcp_pair().await;

        registry.register("10.0.0.1:4000".to_string(), s1, None).await;
        let second = registry.register("10.0.0.1:4000".to_string(), s2, None).await;

        assert_eq!(registry.len().await, 1);
        let snapshot = registry.snapshot().await;
        assert!(Arc::ptr_eq(&snapshot[0], &second), "later entry must win");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = test_registry();
        let (_client, server) = tcp_pair().await;
        registry.register("10.0.0.1:4000".to_string(), server, None).await;

        registry.remove("10.0.0.1:4000").await;
        registry.remove("10.0.0.1:4000").await;
        registry.remove("never-registered").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_orders_by_connection_time() {
        let registry = test_registry();
        let base = Local::now();
        // Insert out of order to make sure the sort does the work.
        for (addr, offset_secs) in [("b:2", 2), ("c:3", 3), ("a:1", 1)] {
            let (_client, server) = tcp_pair().await;
            let seq = registry.next_seq.fetch_add(1, Ordering::Relaxed);
            let mut peer = RemotePeer::new(addr.to_string(), server, seq, None);
            peer.backdate(base + ChronoDuration::seconds(offset_secs));
            registry
                .peers
                .lock()
                .await
                .insert(addr.to_string(), Arc::new(peer));
        }

        let order: Vec<_> = registry
            .snapshot()
            .await
            .iter()
            .map(|p| p.addr().to_string())
            .collect();
        assert_eq!(order, vec!["a:1", "b:2", "c:3"]);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_registration_order() {
        let registry = test_registry();
        let base = Local::now();
        for addr in ["first:1", "second:2", "third:3"] {
            let (_client, server) = tcp_pair().await;
            let seq = registry.next_seq.fetch_add(1, Ordering::Relaxed);
            let mut peer = RemotePeer::new(addr.to_string(), server, seq, None);
            peer.backdate(base);
            registry
                .peers
                .lock()
                .await
                .insert(addr.to_string(), Arc::new(peer));
        }

        let order: Vec<_> = registry
            .snapshot()
            .await
            .iter()
            .map(|p| p.addr().to_string())
            .collect();
        assert_eq!(order, vec!["first:1", "second:2", "third:3"]);
    }

    #[tokio::test]
    async fn sweep_prunes_dead_peers_and_keeps_live_ones() {
        let registry = test_registry();

        let (dead_client, dead_server) = tcp_pair().await;
        let (_live_client, live_server) = tcp_pair().await;
        registry.register("dead:1".to_string(), dead_server, None).await;
        registry.register("live:2".to_string(), live_server, None).await;
        drop(dead_client);

        registry.sweep_all().await;

        assert!(!registry.contains("dead:1").await);
        assert!(registry.contains("live:2").await);
    }

    #[tokio::test]
    async fn sweep_skips_busy_peers() {
        let registry = test_registry();
        let (client, server) = tcp_pair().await;
        drop(client);
        let peer = registry.register("held:1".to_string(), server, None).await;

        // A proxy session holds the claim; even though the far end is gone
        // the sweep must not prune the peer out from under it.
        let claim = peer.try_claim().unwrap();
        registry.sweep_all().await;
        assert!(registry.contains("held:1").await);

        drop(claim);
        registry.sweep_all().await;
        assert!(!registry.contains("held:1").await);
    }
}

//! Liveness probing for registered peers

use crate::peer::RemotePeer;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Default read window for a single probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(10);

/// Probe a peer's connection without consuming meaningful traffic.
///
/// A busy peer is assumed alive: an in-flight proxy session is conclusive
/// evidence of liveness, and probing it would race with real traffic.
/// Otherwise the probe claims the peer and reads with a short timeout. The
/// timeout elapsing is the healthy case (idle but reachable); incidental
/// bytes are drained until a timeout occurs; EOF or any other read error
/// means the peer is gone.
pub async fn check_alive(peer: &RemotePeer, probe_timeout: Duration) -> bool {
    let Some(_claim) = peer.try_claim() else {
        return true;
    };
    debug!("Detect if peer {} is disconnected", peer.addr());

    // The claim guarantees no proxy session holds the connection.
    let mut conn = peer.conn.lock().await;
    let mut buf = [0u8; 256];
    loop {
        match timeout(probe_timeout, conn.read(&mut buf)).await {
            // No data within the window: idle but alive.
            Err(_) => return true,
            Ok(Ok(0)) => {
                debug!("{} is disconnected", peer.addr());
                return false;
            }
            Ok(Ok(n)) => {
                trace!("Drained {} stray bytes from {}", n, peer.addr());
            }
            Ok(Err(e)) => {
                debug!("{} is disconnected: {}", peer.addr(), e);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn idle_peer_is_alive() {
        let (_client, server) = tcp_pair().await;
        let peer = RemotePeer::new("peer".to_string(), server, 0, None);
        assert!(check_alive(&peer, DEFAULT_PROBE_TIMEOUT).await);
        assert!(!peer.is_busy(), "probe must release the claim");
    }

    #[tokio::test]
    async fn closed_peer_is_dead() {
        let (client, server) = tcp_pair().await;
        drop(client);
        let peer = RemotePeer::new("peer".to_string(), server, 0, None);
        assert!(!check_alive(&peer, DEFAULT_PROBE_TIMEOUT).await);
        assert!(!peer.is_busy());
    }

    #[tokio::test]
    async fn busy_peer_is_assumed_alive() {
        let (client, server) = tcp_pair().await;
        // Close the far end so a real probe would report dead.
        drop(client);
        let peer = RemotePeer::new("peer".to_string(), server, 0, None);
        let _claim = peer.try_claim().unwrap();
        assert!(check_alive(&peer, DEFAULT_PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn stray_bytes_are_drained_as_healthy() {
        let (mut client, server) = tcp_pair().await;
        client.write_all(b"incidental noise\n").await.unwrap();
        let peer = RemotePeer::new("peer".to_string(), server, 0, None);
        assert!(check_alive(&peer, DEFAULT_PROBE_TIMEOUT).await);
    }
}

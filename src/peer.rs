//! Peer session state

use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit};

/// Which side of the relay a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Operator session arriving from loopback
    Local,
    /// Tunnel endpoint registered for proxying
    Remote,
}

/// One registered tunnel endpoint.
///
/// The connection is owned by the peer for its registered lifetime. The
/// `busy` flag is a single-holder exclusive claim over the connection: a
/// liveness probe or a proxy session holds it while reading, and a second
/// claimant is rejected immediately rather than queued.
pub struct RemotePeer {
    addr: String,
    connected_at: DateTime<Local>,
    seq: u64,
    busy: AtomicBool,
    pub(crate) conn: Mutex<TcpStream>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl RemotePeer {
    pub(crate) fn new(
        addr: String,
        conn: TcpStream,
        seq: u64,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            addr,
            connected_at: Local::now(),
            seq,
            busy: AtomicBool::new(false),
            conn: Mutex::new(conn),
            _permit: permit,
        }
    }

    /// Peer socket address; doubles as the registry key
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Registration time, used for display ordering only
    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    /// Snapshot ordering key: connection time, registration order on ties
    pub(crate) fn sort_key(&self) -> (DateTime<Local>, u64) {
        (self.connected_at, self.seq)
    }

    /// Whether a probe or proxy session currently owns the connection
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Claim exclusive use of the connection. Fails immediately if another
    /// holder has it; there is no queue. The claim is released on drop.
    pub fn try_claim(&self) -> Option<BusyClaim<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BusyClaim { peer: self })
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, connected_at: DateTime<Local>) {
        self.connected_at = connected_at;
    }
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("addr", &self.addr)
            .field("connected_at", &self.connected_at)
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// Exclusive claim on a peer's connection, released on drop
pub struct BusyClaim<'a> {
    peer: &'a RemotePeer,
}

impl Drop for BusyClaim<'_> {
    fn drop(&mut self) {
        self.peer.busy.store(false, Ordering::Release);
    }
}

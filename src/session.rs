//! Interactive operator session: the line-oriented menu protocol

use crate::peer::RemotePeer;
use crate::proxy;
use crate::registry::PeerRegistry;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Hidden command that re-registers a loopback connection as a remote peer.
/// It is the only way a single-host test driver can exercise the remote
/// path, since every loopback connection classifies as local.
const PROMOTE_COMMAND: &str = "delevate";

const QUIT_COMMAND: &str = "q";

/// How the menu loop ended.
enum Exit {
    /// Quit command, end-of-stream, or a dead connection.
    Quit,
    /// The session asked to become a remote peer.
    Promote,
}

/// One operator session over a local connection.
///
/// Runs the menu loop for the connection's lifetime: sweep, list, read one
/// command, act, re-list. The local peer itself is never registered.
pub struct LocalSession {
    addr: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    registry: Arc<PeerRegistry>,
    permit: Option<OwnedSemaphorePermit>,
}

impl LocalSession {
    pub fn new(
        stream: TcpStream,
        registry: Arc<PeerRegistry>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> crate::Result<Self> {
        let addr = stream.peer_addr()?.to_string();
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            addr,
            reader: BufReader::new(read_half),
            writer: write_half,
            registry,
            permit,
        })
    }

    /// Drive the menu loop until the operator quits or the connection dies.
    /// Every exit except a promotion passes through the common teardown.
    pub async fn run(mut self) -> crate::Result<()> {
        info!("Handling local peer {}", self.addr);
        let exit = match self.menu_loop().await {
            Ok(exit) => exit,
            Err(e) => {
                warn!("Session error with {}: {}", self.addr, e);
                Exit::Quit
            }
        };
        if let Exit::Promote = exit {
            return self.promote().await;
        }

        info!("Closing connection {}", self.addr);
        if let Err(e) = self.writer.shutdown().await {
            debug!("Closing connection {} failed: {}", self.addr, e);
        }
        Ok(())
    }

    async fn menu_loop(&mut self) -> crate::Result<Exit> {
        let greeting = format!("Hello {}\nType q to quit\n", self.addr);
        self.writer.write_all(greeting.as_bytes()).await?;

        let mut listing = self.send_listing().await?;
        let mut line = String::new();
        loop {
            line.clear();
            let n = match self.reader.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Read error from {}: {}", self.addr, e);
                    return Ok(Exit::Quit);
                }
            };
            if n == 0 {
                return Ok(Exit::Quit);
            }
            let input = line.trim();
            debug!("{} says: {}", self.addr, input);

            if input.is_empty() {
                // No reply, no re-listing.
                continue;
            }
            if input == QUIT_COMMAND {
                return Ok(Exit::Quit);
            }
            if input == PROMOTE_COMMAND {
                return Ok(Exit::Promote);
            }
            if let Ok(choice) = input.parse::<usize>() {
                if choice >= 1 && choice <= listing.len() {
                    let target = Arc::clone(&listing[choice - 1]);
                    if self.select_target(&target).await? {
                        // The operator side died mid-splice; do not keep
                        // driving a dead connection.
                        return Ok(Exit::Quit);
                    }
                }
                // Out-of-range numbers fall through to re-listing, like any
                // other unrecognized input.
            }
            listing = self.send_listing().await?;
        }
    }

    /// Re-register this connection as a remote peer and leave it open.
    async fn promote(self) -> crate::Result<()> {
        info!("Handling remote peer {}", self.addr);
        let stream = self
            .reader
            .into_inner()
            .reunite(self.writer)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.registry.register(self.addr, stream, self.permit).await;
        Ok(())
    }

    /// Sweep, then print the numbered menu. Returns the snapshot the menu
    /// numbering refers to.
    async fn send_listing(&mut self) -> crate::Result<Vec<Arc<RemotePeer>>> {
        self.writer
            .write_all(b"Please enter the number to connect to a remote client.\n")
            .await?;
        self.registry.sweep_all().await;

        let listing = self.registry.snapshot().await;
        let mut menu = String::new();
        for (i, peer) in listing.iter().enumerate() {
            let _ = writeln!(
                menu,
                "{}: {}, {}, busy={}",
                i + 1,
                peer.addr(),
                peer.connected_at().format("%Y-%m-%d %H:%M:%S"),
                peer.is_busy()
            );
        }
        self.writer.write_all(menu.as_bytes()).await?;
        Ok(listing)
    }

    /// Claim the chosen peer and splice. Returns true when the local side
    /// was found dead during the splice.
    async fn select_target(&mut self, target: &Arc<RemotePeer>) -> crate::Result<bool> {
        let Some(claim) = target.try_claim() else {
            self.writer
                .write_all(b"Sorry. The client you chose is busy now.\n")
                .await?;
            return Ok(false);
        };
        if !self.registry.contains(target.addr()).await {
            // Lost a race with a concurrent sweep.
            drop(claim);
            self.writer
                .write_all(b"Sorry. The client you chose does not exist or is just gone.\n")
                .await?;
            return Ok(false);
        }

        let spliced =
            proxy::splice(&self.addr, &mut self.reader, &mut self.writer, target).await;
        drop(claim);

        let outcome = match spliced {
            Ok(outcome) => outcome,
            Err(e) => {
                // Could not even announce the splice: the operator side is gone.
                debug!("Proxy session with {} failed: {}", target.addr(), e);
                return Ok(true);
            }
        };
        if outcome.remote_dead {
            self.registry.remove(target.addr()).await;
        }
        if outcome.local_dead {
            debug!("Local peer {} is dead", self.addr);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    #[tokio::test]
    async fn write_failure_tears_the_session_down_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_end, _) = listener.accept().await.unwrap();

        let registry = Arc::new(PeerRegistry::new(Duration::from_millis(10)));
        let session = LocalSession::new(server_end, registry, None).unwrap();

        // Reset the connection so the greeting and listing writes fail
        // instead of seeing a clean end-of-stream.
        client.set_linger(Some(Duration::from_secs(0))).unwrap();
        drop(client);

        let outcome = timeout(Duration::from_secs(5), session.run())
            .await
            .expect("session did not terminate");
        assert!(outcome.is_ok());
    }
}

//! Bidirectional splice between one local and one remote connection

use crate::peer::RemotePeer;
use std::io;
use std::pin::pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const COPY_BUF_SIZE: usize = 8192;

/// Which connection a copy direction reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// Why a copy direction stopped
#[derive(Debug)]
enum CopyEnd {
    /// Source returned end-of-stream
    Eof,
    /// Source or sink failed
    Err(io::Error),
    /// Interrupted after the opposite direction finished
    Interrupted,
}

impl CopyEnd {
    /// Whether this outcome proves the source connection is dead. An induced
    /// interrupt is ambiguous and left for the next liveness sweep to
    /// resolve.
    fn conclusive(&self) -> bool {
        !matches!(self, CopyEnd::Interrupted)
    }
}

/// Result of one proxy session
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyOutcome {
    /// The operator connection died during the splice
    pub local_dead: bool,
    /// The remote endpoint died during the splice
    pub remote_dead: bool,
}

/// Splice the operator connection and the claimed remote peer into a
/// bidirectional pipe, and tear both directions down together.
///
/// Returns only after both copy directions have fully stopped. The first
/// direction to finish identifies its source connection as dead; the other
/// direction is still blocked reading, so it is woken through a cancellation
/// token and awaited before control returns to the menu loop.
///
/// The caller must hold the peer's busy claim for the duration of the call.
pub async fn splice<R, W>(
    local_addr: &str,
    local_read: &mut R,
    local_write: &mut W,
    remote: &RemotePeer,
) -> io::Result<ProxyOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!(
        "Start port forwarding between {} and {}",
        local_addr,
        remote.addr()
    );

    let mut conn = remote.conn.lock().await;
    let (mut remote_read, mut remote_write) = conn.split();

    local_write.write_all(b"Connected!\n").await?;

    let interrupt = CancellationToken::new();
    let mut up = pin!(pump(local_read, &mut remote_write, interrupt.clone()));
    let mut down = pin!(pump(&mut remote_read, local_write, interrupt.clone()));

    let (first_side, first_end) = tokio::select! {
        end = &mut up => (Side::Local, end),
        end = &mut down => (Side::Remote, end),
    };

    debug!("Interrupt the other end");
    interrupt.cancel();
    let (second_side, second_end) = match first_side {
        Side::Local => (Side::Remote, down.await),
        Side::Remote => (Side::Local, up.await),
    };

    let mut outcome = ProxyOutcome::default();
    for (side, end) in [(first_side, first_end), (second_side, second_end)] {
        if end.conclusive() {
            match side {
                Side::Local => outcome.local_dead = true,
                Side::Remote => outcome.remote_dead = true,
            }
        }
    }

    info!(
        "End port forwarding between {} and {}",
        local_addr,
        remote.addr()
    );
    Ok(outcome)
}

/// One copy direction: read from `src`, write to `dst`, until end-of-stream,
/// an error, or an interrupt.
async fn pump<R, W>(src: &mut R, dst: &mut W, interrupt: CancellationToken) -> CopyEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut transferred: u64 = 0;
    let end = loop {
        let n = tokio::select! {
            _ = interrupt.cancelled() => break CopyEnd::Interrupted,
            read = src.read(&mut buf) => match read {
                Ok(0) => break CopyEnd::Eof,
                Ok(n) => n,
                Err(e) => break CopyEnd::Err(e),
            },
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            break CopyEnd::Err(e);
        }
        transferred += n as u64;
    };
    debug!("Copy direction ended after {} bytes: {:?}", transferred, end);
    end
}

//! Inbound connection classification

use crate::peer::PeerRole;
use crate::{Error, Result};
use std::net::IpAddr;
use tokio::net::TcpStream;

/// Decide whether a freshly accepted connection is an operator session or a
/// tunnel-endpoint registration.
///
/// Loopback origins are operators; everything else registers as a tunnel
/// endpoint. A connection whose peer address cannot be obtained is an
/// environment fault, not a per-connection error: no classification rule is
/// defined for it, so the caller must abort.
pub fn classify(conn: &TcpStream) -> Result<PeerRole> {
    let addr = conn.peer_addr().map_err(|e| Error::Classify(e.to_string()))?;
    Ok(role_for(addr.ip()))
}

fn role_for(ip: IpAddr) -> PeerRole {
    // to_canonical unwraps v4-mapped addresses like ::ffff:127.0.0.1
    if ip.to_canonical().is_loopback() {
        PeerRole::Local
    } else {
        PeerRole::Remote
    }
}

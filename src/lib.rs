//! # Switchyard
//!
//! A rendezvous/tunnel relay over plain TCP. Tunnel endpoints register by
//! connecting in from a non-loopback address; operators connect from
//! loopback, browse the registered endpoints over a line-oriented text
//! protocol, and splice their own connection into a bidirectional byte pipe
//! with the endpoint they pick.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Listener / Dispatcher                │
//! │          (accept, classify by peer origin)          │
//! ├──────────────────────────┬──────────────────────────┤
//! │       LocalSession       │       PeerRegistry       │
//! │  (menu line protocol)    │  (remote peers, sweeps)  │
//! ├──────────────────────────┴──────────────────────────┤
//! │                     ProxyEngine                     │
//! │       (bidirectional splice, joint teardown)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod classify;
pub mod config;
pub mod liveness;
pub mod peer;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod session;

pub use config::Config;
pub use server::Server;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unclassifiable peer address: {0}")]
    Classify(String),
}

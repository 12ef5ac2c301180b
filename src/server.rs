//! Listener/dispatcher: accepts raw connections and routes them by origin

use crate::classify::classify;
use crate::config::ServerConfig;
use crate::peer::PeerRole;
use crate::registry::PeerRegistry;
use crate::session::LocalSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// The relay server: one accept loop, one background sweeper.
pub struct Server {
    listener: TcpListener,
    registry: Arc<PeerRegistry>,
    limiter: Arc<Semaphore>,
    sweep_interval: Duration,
}

impl Server {
    /// Bind the listen address from the configuration.
    pub async fn bind(config: &ServerConfig) -> crate::Result<Self> {
        let listener = TcpListener::bind(&config.listen).await?;
        Ok(Self {
            listener,
            registry: Arc::new(PeerRegistry::new(Duration::from_millis(
                config.probe_timeout_ms,
            ))),
            limiter: Arc::new(Semaphore::new(config.max_connections)),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        })
    }

    /// Address actually bound; useful with a `:0` listen port.
    pub fn local_addr(&self) -> crate::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Accept connections until the process is told to stop.
    pub async fn run(self) -> crate::Result<()> {
        info!("Listening on {}", self.listener.local_addr()?);

        let sweeper = {
            let registry = Arc::clone(&self.registry);
            let period = self.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    registry.sweep_all().await;
                }
            })
        };

        let result = self.accept_loop().await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self) -> crate::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    };
                    debug!("New connection {}", peer_addr);

                    // An unclassifiable origin is an environment fault; bail out.
                    match classify(&stream)? {
                        PeerRole::Local => {
                            let registry = Arc::clone(&self.registry);
                            let limiter = Arc::clone(&self.limiter);
                            tokio::spawn(async move {
                                let permit = limiter.acquire_owned().await.ok();
                                match LocalSession::new(stream, registry, permit) {
                                    Ok(session) => {
                                        if let Err(e) = session.run().await {
                                            debug!("Local session {} ended with error: {}", peer_addr, e);
                                        }
                                    }
                                    Err(e) => {
                                        debug!("Failed to start session for {}: {}", peer_addr, e);
                                    }
                                }
                            });
                        }
                        PeerRole::Remote => {
                            self.register_remote(peer_addr.to_string(), stream).await;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Register a remote endpoint if the connection limit allows it. Must
    /// not block: it runs on the accept path.
    async fn register_remote(&self, addr: String, stream: tokio::net::TcpStream) {
        match Arc::clone(&self.limiter).try_acquire_owned() {
            Ok(permit) => {
                info!("Handling remote peer {}", addr);
                self.registry.register(addr, stream, Some(permit)).await;
            }
            Err(_) => {
                warn!("Connection limit reached, dropping remote peer {}", addr);
            }
        }
    }
}

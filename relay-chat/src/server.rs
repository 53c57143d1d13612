use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    registry::Registry,
    session::{SessionConfig, handle_connection},
};

/// Default size of each session's outbound queue, in messages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Pause after a failed accept so a persistent error such as EMFILE does
/// not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub queue_capacity: usize,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            session: SessionConfig::default(),
        }
    }
}

/// Accepts connections and runs one session task per client.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: SessionConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new(config.queue_capacity)),
            config: config.session,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Runs the accept loop until `shutdown` resolves, then closes every
    /// remaining session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            config,
        } = self;
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &config, &mut sessions).await;
                }
                Some(finished) = sessions.join_next() => reap_session(finished),
            }
        }

        drop(listener);
        info!(sessions = sessions.len(), "relay server shutting down");
        sessions.shutdown().await;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    config: &SessionConfig,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry, config, sessions),
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            sleep(ACCEPT_BACKOFF).await;
        }
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    config: &SessionConfig,
    sessions: &mut JoinSet<()>,
) {
    let registry = Arc::clone(registry);
    let config = config.clone();
    sessions.spawn(async move {
        if let Err(err) = handle_connection(stream, peer, registry, config).await {
            debug!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}

fn reap_session(finished: Result<(), JoinError>) {
    if let Err(err) = finished {
        if err.is_panic() {
            warn!(error = ?err, "session task panicked");
        }
    }
}

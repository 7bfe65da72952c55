//! The listening side of the bridge: bind, accept, spawn one session per
//! connection, and tear everything down deterministically on `stop`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::hooks::{CredentialInjector, RelayHooks};
use crate::session::{self, SessionContext};
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::upstream::UpstreamConnector;

const LISTEN_BACKLOG: i32 = 1024;
/// Pause after a failed `accept` (e.g. out of descriptors) before retrying
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Start a bridge that injects the upstream's credentials.
///
/// The listener is bound and accepting when this returns. Must be called
/// from within a tokio runtime.
pub fn start(config: BridgeConfig) -> Result<BridgeHandle, BridgeError> {
    let hooks = CredentialInjector::new(&config.upstream);
    start_with_hooks(config, hooks)
}

/// Start a bridge with a custom request pipeline.
pub fn start_with_hooks<H: RelayHooks>(config: BridgeConfig, hooks: H) -> Result<BridgeHandle, BridgeError> {
    let addr = config.bind_addr()?;
    let connector = UpstreamConnector::new(&config)?;
    let listener = bind_listener(addr)?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| BridgeError::Bind { addr, source })?;

    info!(
        listen = %local_addr,
        upstream = %config.upstream,
        authenticated = config.upstream.credentials.is_some(),
        "bridge listening"
    );

    let stats = BridgeStats::new();
    let ctx = Arc::new(SessionContext {
        connector,
        hooks,
        idle_timeout: config.idle_timeout,
        stats: Arc::clone(&stats),
    });
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx, config.shutdown_grace));

    Ok(BridgeHandle {
        local_addr,
        stats,
        shutdown: Some(shutdown_tx),
        accept_task: Some(accept_task),
    })
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, BridgeError> {
    let bind_err = |source| BridgeError::Bind { addr, source };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    // Lets a restarted bridge reuse a port still in TIME_WAIT; an active
    // listener on the same port still makes bind fail.
    #[cfg(unix)]
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    TcpListener::from_std(socket.into()).map_err(bind_err)
}

async fn accept_loop<H: RelayHooks>(
    listener: TcpListener,
    ctx: Arc<SessionContext<H>>,
    mut shutdown: oneshot::Receiver<()>,
    grace: Duration,
) {
    let next_id = AtomicU64::new(1);
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    debug!(session = id, %peer, "accepted connection");
                    sessions.spawn(session::serve(Arc::clone(&ctx), id, peer, stream));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(error = %e, "session task panicked");
                    }
                }
            }
        }
    }

    // Release the port before draining
    drop(listener);
    let in_flight = sessions.len();
    if in_flight > 0 {
        info!(in_flight, ?grace, "waiting for sessions to drain");
    }
    let drained = tokio::time::timeout(grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = sessions.len(), "grace period over, closing remaining sessions");
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}

/// Handle to a running bridge.
///
/// Dropping the handle without calling [`BridgeHandle::stop`] aborts the
/// accept loop and every session immediately.
pub struct BridgeHandle {
    local_addr: SocketAddr,
    stats: Arc<BridgeStats>,
    shutdown: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Proxy URL to hand to a browser or HTTP client.
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop accepting, drain sessions for the grace period, then close the
    /// rest. The listening port is released before this returns. Calling it
    /// again is a no-op.
    pub async fn stop(&mut self) {
        let Some(task) = self.accept_task.take() else {
            return;
        };
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = task.await {
            if e.is_panic() {
                error!(error = %e, "accept loop panicked");
            }
        }
        let stats = self.stats.snapshot();
        info!(
            listen = %self.local_addr,
            sessions = stats.total_sessions,
            failed = stats.failed_sessions,
            bytes_to_upstream = stats.bytes_to_upstream,
            bytes_to_client = stats.bytes_to_client,
            "bridge stopped"
        );
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

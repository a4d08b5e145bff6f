use std::{
    future::Future,
    io,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    line::DEFAULT_MAX_LINE_BYTES,
    registry::Registry,
    session::{Session, SessionEnd},
};

pub type TcpRegistry = Registry<OwnedWriteHalf>;

/// Pause after the process runs out of file descriptors, giving sessions a
/// chance to close before accepting again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub max_line_bytes: usize,
    /// Upper bound on concurrently connected clients. `None` accepts without limit.
    pub max_connections: Option<NonZeroUsize>,
    /// How long shutdown waits for session tasks before aborting them.
    pub drain_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_connections: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Listener {
    listener: TcpListener,
    registry: Arc<TcpRegistry>,
    config: ListenerConfig,
}

impl Listener {
    /// Binds the listening socket. Failing to bind is fatal for the server.
    pub async fn bind(addr: SocketAddr, config: ListenerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ListenerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(TcpRegistry::new()),
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<TcpRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts clients until `shutdown` resolves, then stops every session
    /// and waits for them to drain.
    ///
    /// Returns an error only when the listening socket itself fails.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Listener {
            listener,
            registry,
            config,
        } = self;
        let limiter = config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit.get())));
        let cancel = CancellationToken::new();
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            while sessions.try_join_next().is_some() {}

            let permit = match &limiter {
                Some(limiter) => select! {
                    _ = &mut shutdown => break Ok(()),
                    permit = Arc::clone(limiter).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(err) => break Err(anyhow::Error::new(err).context("connection limiter closed")),
                    },
                },
                None => None,
            };

            select! {
                _ = &mut shutdown => break Ok(()),
                accept_result = listener.accept() => {
                    if let Err(err) = handle_accept_result(
                        accept_result,
                        permit,
                        &mut sessions,
                        &registry,
                        &config,
                        &cancel,
                    )
                    .await
                    {
                        break Err(err);
                    }
                }
            }
        };

        drop(listener);
        drain_sessions(&registry, &cancel, sessions, config.drain_timeout).await;
        outcome
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
    result: io::Result<(TcpStream, SocketAddr)>,
    permit: Option<OwnedSemaphorePermit>,
    sessions: &mut JoinSet<()>,
    registry: &Arc<TcpRegistry>,
    config: &ListenerConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    match result {
        Ok((stream, peer)) => {
            spawn_session(stream, peer, permit, sessions, registry, config, cancel);
            Ok(())
        }
        Err(err) => match classify_accept_error(&err) {
            AcceptFailure::Transient => {
                warn!(error = ?err, "failed to accept connection");
                Ok(())
            }
            AcceptFailure::ResourceExhausted => {
                warn!(error = ?err, "out of resources while accepting; backing off");
                sleep(ACCEPT_BACKOFF).await;
                Ok(())
            }
            AcceptFailure::Fatal => {
                error!(error = ?err, "listening socket failed");
                Err(anyhow::Error::new(err).context("listening socket is no longer usable"))
            }
        },
    }
}

/// Registration happens inside the spawned task so the accept loop never
/// waits on the registry lock.
fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    permit: Option<OwnedSemaphorePermit>,
    sessions: &mut JoinSet<()>,
    registry: &Arc<TcpRegistry>,
    config: &ListenerConfig,
    cancel: &CancellationToken,
) {
    let registry = Arc::clone(registry);
    let shutdown = cancel.clone();
    let max_line_bytes = config.max_line_bytes;

    sessions.spawn(async move {
        let _permit = permit;
        let (reader, writer) = stream.into_split();
        let session = Session::register(registry, reader, writer, max_line_bytes, Some(peer)).await;
        let id = session.id();
        info!(%peer, session = id, "client connected");

        match session.run_read_loop(shutdown).await {
            SessionEnd::PeerClosed => info!(%peer, session = id, "client disconnected"),
            SessionEnd::Failed(err) => {
                warn!(%peer, session = id, error = ?err, "client connection closed with error")
            }
            SessionEnd::Shutdown => debug!(%peer, session = id, "client closed for shutdown"),
        }
    });
}

async fn drain_sessions(
    registry: &TcpRegistry,
    cancel: &CancellationToken,
    mut sessions: JoinSet<()>,
    drain_timeout: Duration,
) {
    info!(sessions = sessions.len(), "server shutting down");
    cancel.cancel();

    let drained = timeout(drain_timeout, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = sessions.len(),
            "sessions did not finish in time; aborting"
        );
        sessions.shutdown().await;
    }

    let closed = registry.close_all().await;
    if closed > 0 {
        debug!(closed, "closed remaining members");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Only the connection being accepted is affected.
    Transient,
    /// The process is out of descriptors or memory; retrying later can succeed.
    ResourceExhausted,
    /// The listening socket itself is unusable.
    Fatal,
}

fn classify_accept_error(err: &io::Error) -> AcceptFailure {
    if is_descriptor_exhaustion(err) {
        return AcceptFailure::ResourceExhausted;
    }

    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::NetworkDown
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::HostUnreachable => AcceptFailure::Transient,
        io::ErrorKind::OutOfMemory => AcceptFailure::ResourceExhausted,
        _ => AcceptFailure::Fatal,
    }
}

#[cfg(unix)]
fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    // ENFILE and EMFILE share these values on Linux and the BSDs.
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(err.raw_os_error(), Some(ENFILE | EMFILE))
}

#[cfg(not(unix))]
fn is_descriptor_exhaustion(_err: &io::Error) -> bool {
    false
}

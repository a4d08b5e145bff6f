use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    runtime::Handle,
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    line::LineReader,
    registry::{Registry, SessionId, log_close_error},
};

/// Why a session's read loop stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// The peer closed its side of the stream.
    PeerClosed,
    /// Reading failed, including a line over the configured bound.
    Failed(io::Error),
    /// The server is shutting down.
    Shutdown,
}

/// One connected client: the read side of its stream plus its registry
/// membership. The write side lives in the registry.
pub struct Session<R, W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    peer: Option<SocketAddr>,
    reader: LineReader<BufReader<R>>,
    membership: Membership<W>,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps both halves of an already connected stream and adds the write
    /// half to the registry. The returned session is a member.
    pub async fn register(
        registry: Arc<Registry<W>>,
        reader: R,
        writer: W,
        max_line_bytes: usize,
        peer: Option<SocketAddr>,
    ) -> Self {
        let id = registry.add(writer).await;
        Self {
            peer,
            reader: LineReader::with_max_len(BufReader::new(reader), max_line_bytes),
            membership: Membership {
                id,
                registry,
                released: false,
            },
        }
    }

    pub fn id(&self) -> SessionId {
        self.membership.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Broadcasts every line read from the peer until the stream ends, a
    /// read fails, or `shutdown` is cancelled. Cleanup runs on every exit.
    pub async fn run_read_loop(mut self, shutdown: CancellationToken) -> SessionEnd {
        let end = loop {
            let next = select! {
                biased;
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                next = self.reader.next_line() => next,
            };

            match next {
                Ok(Some(line)) => {
                    let delivery = self.membership.registry.broadcast(&line).await;
                    trace!(session = self.id(), ?delivery, "relayed line");
                }
                Ok(None) => break SessionEnd::PeerClosed,
                Err(err) => {
                    if err.kind() == io::ErrorKind::InvalidData {
                        debug!(
                            session = self.id(),
                            max_line_bytes = self.reader.max_len(),
                            "peer sent an over-long line"
                        );
                    }
                    break SessionEnd::Failed(err);
                }
            }
        };

        self.cleanup().await;
        end
    }

    /// Leaves the registry, then closes the write half and drops the read
    /// half. Consuming `self` makes this run at most once.
    async fn cleanup(self) {
        let Session {
            peer,
            reader,
            mut membership,
        } = self;
        let id = membership.id;

        if let Some(mut writer) = membership.release().await {
            if let Err(err) = writer.shutdown().await {
                log_close_error(id, &err);
            }
        }
        drop(reader);

        debug!(session = id, ?peer, "session closed");
    }
}

/// Registry entry owned by a session.
///
/// If the session is dropped before [`Membership::release`] finishes, for
/// instance because its task was aborted, the removal is scheduled from
/// `Drop` instead.
struct Membership<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    id: SessionId,
    registry: Arc<Registry<W>>,
    released: bool,
}

impl<W> Membership<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn release(&mut self) -> Option<W> {
        let writer = self.registry.remove(self.id).await;
        self.released = true;
        writer
    }
}

impl<W> Drop for Membership<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let id = self.id;
        let registry = Arc::clone(&self.registry);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(mut writer) = registry.remove(id).await {
                        if let Err(err) = writer.shutdown().await {
                            log_close_error(id, &err);
                        }
                    }
                });
            }
            Err(_) => warn!(session = id, "no runtime to release session membership"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncBufReadExt, DuplexStream, ReadHalf, WriteHalf},
        time::timeout,
    };

    use super::*;

    type TestRegistry = Registry<WriteHalf<DuplexStream>>;
    type TestSession = Session<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    const WAIT: Duration = Duration::from_secs(1);

    /// Registers a session over an in-memory pipe and returns the client end.
    async fn connect(
        registry: &Arc<TestRegistry>,
        max_line_bytes: usize,
    ) -> (TestSession, BufReader<DuplexStream>) {
        let (server, client) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(server);
        let session =
            Session::register(Arc::clone(registry), read, write, max_line_bytes, None).await;
        (session, BufReader::new(client))
    }

    async fn read_one(client: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        timeout(WAIT, client.read_line(&mut line))
            .await
            .expect("line within timeout")
            .expect("read line");
        line
    }

    #[tokio::test]
    async fn register_makes_session_a_member() {
        let registry = Arc::new(TestRegistry::new());
        let (session, _client) = connect(&registry, 1024).await;

        assert!(registry.contains(session.id()).await);
        assert_eq!(session.peer(), None);
    }

    #[tokio::test]
    async fn read_loop_relays_lines_and_cleans_up_on_eof() {
        let registry = Arc::new(TestRegistry::new());
        let (session, mut client) = connect(&registry, 1024).await;
        let id = session.id();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(session.run_read_loop(shutdown));

        client.get_mut().write_all(b"hello\n").await.expect("write");
        assert_eq!(read_one(&mut client).await, "hello\n");

        client.get_mut().shutdown().await.expect("shutdown client");
        let end = timeout(WAIT, task).await.expect("loop ends").expect("join");

        assert!(matches!(end, SessionEnd::PeerClosed));
        assert!(!registry.contains(id).await);
        assert_eq!(read_one(&mut client).await, "");
    }

    #[tokio::test]
    async fn over_long_line_ends_only_that_session() {
        let registry = Arc::new(TestRegistry::new());
        let (noisy, mut noisy_client) = connect(&registry, 8).await;
        let (_quiet, mut quiet_client) = connect(&registry, 8).await;
        let noisy_id = noisy.id();
        let task = tokio::spawn(noisy.run_read_loop(CancellationToken::new()));

        noisy_client
            .get_mut()
            .write_all(b"this line is far too long\n")
            .await
            .expect("write");
        let end = timeout(WAIT, task).await.expect("loop ends").expect("join");

        match end {
            SessionEnd::Failed(err) => assert_eq!(err.kind(), io::ErrorKind::InvalidData),
            other => panic!("unexpected session end: {other:?}"),
        }
        assert!(!registry.contains(noisy_id).await);
        assert_eq!(registry.len().await, 1);

        registry.broadcast(b"ok").await;
        assert_eq!(read_one(&mut quiet_client).await, "ok\n");
    }

    #[tokio::test]
    async fn cancellation_stops_loop_and_closes_stream() {
        let registry = Arc::new(TestRegistry::new());
        let (session, mut client) = connect(&registry, 1024).await;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(session.run_read_loop(shutdown.clone()));

        shutdown.cancel();
        let end = timeout(WAIT, task).await.expect("loop ends").expect("join");

        assert!(matches!(end, SessionEnd::Shutdown));
        assert!(registry.is_empty().await);
        assert_eq!(read_one(&mut client).await, "");
    }

    #[tokio::test]
    async fn aborted_session_still_leaves_registry() {
        let registry = Arc::new(TestRegistry::new());
        let (session, _client) = connect(&registry, 1024).await;
        let task = tokio::spawn(session.run_read_loop(CancellationToken::new()));

        task.abort();
        let _ = task.await;

        timeout(WAIT, async {
            while !registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("membership released after abort");
    }
}

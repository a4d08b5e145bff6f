#![allow(dead_code)]

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use chat_relay::{
    line::{LineReader, write_line},
    listener::{Listener, ListenerConfig, TcpRegistry},
};
use tokio::{
    io::BufReader,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A relay server running on an ephemeral localhost port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<TcpRegistry>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(ListenerConfig::default()).await
    }

    pub async fn start_with(config: ListenerConfig) -> Result<Self> {
        let listener = Listener::bind("127.0.0.1:0".parse()?, config).await?;
        let addr = listener.local_addr()?;
        let registry = listener.registry();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            listener.run_until(shutdown).await
        });

        Ok(Self {
            addr,
            registry,
            shutdown_tx,
            task,
        })
    }

    pub async fn connect(&self) -> Result<TestClient> {
        TestClient::connect(self.addr).await
    }

    /// Waits until exactly `count` sessions are registered.
    pub async fn wait_for_members(&self, count: usize) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        eventually(READ_TIMEOUT, move || {
            let registry = Arc::clone(&registry);
            async move { registry.len().await == count }
        })
        .await
        .with_context(|| format!("waiting for {count} members"))
    }

    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        timeout(READ_TIMEOUT, self.task)
            .await
            .context("server did not stop in time")??
    }
}

/// Raw line client used to observe exactly what the server sends.
pub struct TestClient {
    reader: LineReader<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: LineReader::new(BufReader::new(reader)),
            writer,
        }
    }

    pub async fn send(&mut self, text: &str) -> Result<()> {
        write_line(&mut self.writer, text.as_bytes()).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<String> {
        match self.recv_or_eof().await? {
            Some(line) => Ok(line),
            None => Err(anyhow!("server closed the connection")),
        }
    }

    pub async fn recv_or_eof(&mut self) -> Result<Option<String>> {
        let line = timeout(READ_TIMEOUT, self.reader.next_line())
            .await
            .context("timed out waiting for line")??;
        Ok(line.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn recv_many(&mut self, count: usize) -> Result<Vec<String>> {
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(self.recv().await?);
        }
        Ok(lines)
    }

    /// Fails if any line arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<()> {
        match timeout(window, self.reader.next_line()).await {
            Err(_) => Ok(()),
            Ok(Ok(None)) => Err(anyhow!("connection closed while expecting silence")),
            Ok(Ok(Some(line))) => Err(anyhow!(
                "unexpected line: {}",
                String::from_utf8_lossy(&line)
            )),
            Ok(Err(err)) => Err(err.into()),
        }
    }
}

/// Polls `check` until it returns true or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(limit, async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("condition not met within {limit:?}"))
}

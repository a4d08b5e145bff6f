use std::{
    io::{self as std_io, Write},
    net::SocketAddr,
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveTime};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, ToSocketAddrs, tcp::OwnedWriteHalf},
    select,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    line::{LineReader, write_line},
};

/// Client side of one relay connection.
///
/// Received lines are handed to the callback given to [`Connection::connect`]
/// from a background task, one call per line, in arrival order.
pub struct Connection {
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    receiver: Option<JoinHandle<io::Result<()>>>,
}

impl Connection {
    pub async fn connect<A, F>(addr: A, on_line: F) -> Result<Self>
    where
        A: ToSocketAddrs,
        F: FnMut(String) + Send + 'static,
    {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to chat server")?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let reader = LineReader::new(BufReader::new(reader));
        let receiver = tokio::spawn(receive_lines(reader, on_line));

        Ok(Self {
            writer,
            peer,
            receiver: Some(receiver),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sends `text` as one line.
    pub async fn send(&mut self, text: &str) -> io::Result<()> {
        write_line(&mut self.writer, text.as_bytes()).await
    }

    /// Resolves once the server has closed the connection or reading failed.
    pub async fn disconnected(&mut self) -> io::Result<()> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(());
        };
        let result = receiver.await;
        self.receiver = None;
        result.map_err(io::Error::other)?
    }

    /// Shuts down the sending side and stops delivering received lines.
    ///
    /// A connection the server already tore down counts as closed.
    pub async fn close(mut self) -> Result<()> {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        match self.writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(error) if is_already_closed(&error) => {
                debug!(?error, "connection already closed by server");
                Ok(())
            }
            Err(error) => Err(error).context("failed to shut down connection"),
        }
    }
}

fn is_already_closed(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

async fn receive_lines<R, F>(mut reader: LineReader<R>, mut on_line: F) -> io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    F: FnMut(String),
{
    while let Some(line) = reader.next_line().await? {
        on_line(String::from_utf8_lossy(&line).into_owned());
    }
    Ok(())
}

/// Formats an outgoing chat line as `[HH:MM:SS] name: text`.
pub fn format_message(name: &str, text: &str, at: NaiveTime) -> String {
    format!("[{}] {name}: {text}", at.format("%H:%M:%S"))
}

pub fn departure_notice(name: &str) -> String {
    format!("{name} has left the chat.")
}

/// Runs the terminal chat client: stdin lines go out, received lines go to stdout.
pub async fn run(args: ClientArgs) -> Result<()> {
    let server = args.server_addr();
    let mut connection = Connection::connect(server.as_str(), print_line)
        .await
        .with_context(|| format!("could not reach {server}"))?;

    info!("connected to {}", connection.peer_addr());
    print_line(format!(
        "*** connected to {} as {}",
        connection.peer_addr(),
        args.name
    ));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut connection, &mut stdin, &mut input, &args.name).await?;
    if let Err(error) = connection.close().await {
        warn!(?error, "failed to shut down connection cleanly");
    }
    Ok(())
}

async fn run_client_loop(
    connection: &mut Connection,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    name: &str,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            closed = connection.disconnected() => {
                handle_disconnect(closed);
                break;
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, connection, name).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                announce_departure(connection, name).await;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    connection: &mut Connection,
    name: &str,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        announce_departure(connection, name).await;
        return Ok(false);
    }

    let text = input.trim_end();
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        print_line("*** leaving chat".to_string());
        announce_departure(connection, name).await;
        return Ok(false);
    }

    connection
        .send(&format_message(name, text, Local::now().time()))
        .await
        .context("failed to send message")?;
    Ok(true)
}

async fn announce_departure(connection: &mut Connection, name: &str) {
    if let Err(error) = connection.send(&departure_notice(name)).await {
        warn!(?error, "failed to announce departure");
    }
}

fn handle_disconnect(result: io::Result<()>) {
    match result {
        Ok(()) => print_line("*** server closed the connection".to_string()),
        Err(error) => {
            warn!(?error, "connection lost");
            print_line("*** connection lost".to_string());
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

fn print_line(line: String) {
    let mut stdout = std_io::stdout().lock();
    if let Err(error) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
        warn!(?error, "failed to write to stdout");
    }
}

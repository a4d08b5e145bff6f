//! Shared membership of live sessions and the broadcast fan-out.
//!
//! The registry owns the write half of every connected client. A single
//! Tokio mutex guards the membership map and stays held for the whole
//! fan-out of a broadcast, so every broadcast sees one consistent set of
//! members and all receivers observe broadcasts in the same order.

use std::{
    collections::HashMap,
    io,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, trace, warn};

use crate::line::{encode_line, write_frame};

pub type SessionId = u64;

/// Outcome of one broadcast across the membership it saw.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Registry<W> {
    members: Mutex<HashMap<SessionId, W>>,
    next_id: AtomicU64,
}

impl<W> Registry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers the write half of a fully initialized connection and returns
    /// the identity it is known by from now on.
    ///
    /// Identities come from a counter owned by the registry, so no two
    /// members can ever share one.
    pub async fn add(&self, writer: W) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut members = self.members.lock().await;
        members.insert(id, writer);
        debug!(session = id, members = members.len(), "session registered");
        id
    }

    /// Removes a member and hands back its write half so the caller can
    /// close it. Removing an absent member is a no-op.
    pub async fn remove(&self, id: SessionId) -> Option<W> {
        let mut members = self.members.lock().await;
        let writer = members.remove(&id);
        if writer.is_some() {
            debug!(session = id, members = members.len(), "session removed");
        }
        writer
    }

    /// Writes `line` to every current member.
    ///
    /// A member whose write fails is skipped; its own read loop notices the
    /// broken connection and removes it.
    pub async fn broadcast(&self, line: &[u8]) -> Delivery {
        let frame = encode_line(line);
        let mut delivery = Delivery::default();

        let mut members = self.members.lock().await;
        for (id, writer) in members.iter_mut() {
            match write_frame(writer, &frame).await {
                Ok(()) => delivery.delivered += 1,
                Err(err) => {
                    debug!(session = *id, error = ?err, "failed to deliver line to member");
                    delivery.failed += 1;
                }
            }
        }

        trace!(
            bytes = line.len(),
            delivered = delivery.delivered,
            failed = delivery.failed,
            "line broadcast"
        );
        delivery
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.members.lock().await.contains_key(&id)
    }

    /// Removes every member and shuts down its write half so peers see the
    /// end of the stream. Returns how many members were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(SessionId, W)> = self.members.lock().await.drain().collect();
        let closed = drained.len();

        for (id, mut writer) in drained {
            if let Err(err) = writer.shutdown().await {
                log_close_error(id, &err);
            }
        }

        closed
    }
}

impl<W> Default for Registry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Peers that vanished without a clean shutdown make closing fail routinely,
/// so those cases stay at debug level.
pub(crate) fn log_close_error(id: SessionId, err: &io::Error) {
    match err.kind() {
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
            debug!(session = id, error = ?err, "stream already closed by peer");
        }
        _ => warn!(session = id, error = ?err, "failed to close client stream"),
    }
}

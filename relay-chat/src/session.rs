//! Server-side lifecycle of one connected client.
//!
//! A session moves `Unregistered -> Active -> Closed`. While active, the
//! session task reads lines and hands them to the [`Registry`], and a
//! separate writer task drains the session's outbound queue into the
//! socket so a slow peer never blocks a broadcaster.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{DEFAULT_MAX_LINE_BYTES, read_line, write_line},
    registry::{Outbound, Registry, SessionId},
};

/// Per-connection limits and behaviour.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_line_bytes: usize,
    pub write_timeout: Duration,
    /// Treat the first inbound line as a display name instead of a message.
    pub handshake: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            write_timeout: Duration::from_secs(5),
            handshake: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unregistered,
    Active,
    Closed,
}

/// Why a session left the `Active` state.
#[derive(Debug)]
enum CloseReason {
    /// The peer closed its side of the connection.
    Eof,
    /// Reading failed, including over-long lines and invalid UTF-8.
    ReadFailed(io::Error),
    /// The writer task ended: a write failed or timed out, or the registry
    /// dropped this session's queue.
    WriterStopped(Option<io::Error>),
}

struct Session {
    peer: SocketAddr,
    id: Option<SessionId>,
    state: SessionState,
    name: Option<String>,
}

impl Session {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            id: None,
            state: SessionState::Unregistered,
            name: None,
        }
    }

    fn activate(&mut self, id: SessionId) {
        debug_assert_eq!(self.state, SessionState::Unregistered);
        self.id = Some(id);
        self.state = SessionState::Active;
    }
}

/// Runs one client connection to completion.
///
/// Returns `Ok(())` when the peer disconnects cleanly and the error that
/// closed the session otherwise. The session is unregistered and the
/// connection released on every path.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    registry: Arc<Registry>,
    config: SessionConfig,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut session = Session::new(peer);

    let (id, outbound) = registry.register().await;
    session.activate(id);
    info!(peer = %peer, session = id, "client connected");

    // Held in a JoinSet so the writer is aborted even if this task is.
    let mut writer_task = JoinSet::new();
    writer_task.spawn(drain_outbound(writer, outbound, config.write_timeout));
    let reason = run_active(&mut session, &mut reader, &mut writer_task, &registry, &config).await;

    close(&mut session, &registry, writer_task, &reason).await;
    drop(reader);

    match reason {
        CloseReason::Eof | CloseReason::WriterStopped(None) => Ok(()),
        CloseReason::ReadFailed(err) | CloseReason::WriterStopped(Some(err)) => Err(err),
    }
}

async fn run_active<R>(
    session: &mut Session,
    reader: &mut R,
    writer_task: &mut JoinSet<io::Result<()>>,
    registry: &Registry,
    config: &SessionConfig,
) -> CloseReason
where
    R: AsyncBufRead + Unpin,
{
    let mut awaiting_name = config.handshake;

    loop {
        select! {
            line = read_line(reader, config.max_line_bytes) => {
                match line {
                    Ok(Some(line)) if awaiting_name => {
                        awaiting_name = false;
                        info!(peer = %session.peer, session = ?session.id, name = %line, "client introduced itself");
                        session.name = Some(line);
                    }
                    Ok(Some(line)) => {
                        let delivered = registry.broadcast(&line).await;
                        debug!(session = ?session.id, delivered, "relayed line");
                    }
                    Ok(None) => return CloseReason::Eof,
                    Err(err) => return CloseReason::ReadFailed(err),
                }
            }
            Some(finished) = writer_task.join_next() => {
                return match finished {
                    Ok(Ok(())) => CloseReason::WriterStopped(None),
                    Ok(Err(err)) => CloseReason::WriterStopped(Some(err)),
                    Err(join_err) => CloseReason::WriterStopped(Some(io::Error::other(join_err))),
                };
            }
        }
    }
}

async fn close(
    session: &mut Session,
    registry: &Registry,
    mut writer_task: JoinSet<io::Result<()>>,
    reason: &CloseReason,
) {
    if let Some(id) = session.id {
        registry.unregister(id).await;
    }

    writer_task.shutdown().await;

    session.state = SessionState::Closed;
    match reason {
        CloseReason::Eof => info!(peer = %session.peer, session = ?session.id, name = ?session.name, "client disconnected"),
        CloseReason::ReadFailed(err) => warn!(peer = %session.peer, session = ?session.id, error = %err, "dropping client after read failure"),
        CloseReason::WriterStopped(None) => info!(peer = %session.peer, session = ?session.id, "client dropped from registry"),
        CloseReason::WriterStopped(Some(err)) => warn!(peer = %session.peer, session = ?session.id, error = %err, "dropping client after write failure"),
    }
}

async fn drain_outbound<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = outbound.recv().await {
        match timeout(write_timeout, write_line(&mut writer, &line)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("write stalled for {write_timeout:?}"),
                ));
            }
        }
    }

    // Queue closed: the registry no longer knows about this session.
    let _ = writer.shutdown().await;
    Ok(())
}

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::protocol::frame_message;

pub type SessionId = u64;

/// A framed line waiting in a session's outbound queue. Shared between all
/// recipients of one broadcast.
pub type Outbound = Arc<str>;

/// Membership set of active sessions, keyed by session id.
///
/// The map only holds the sending side of each session's outbound queue.
/// Mutation and the broadcast snapshot are serialized by one lock; delivery
/// happens after the lock is released.
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, mpsc::Sender<Outbound>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Registry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Adds a new session and hands back its id and the receiving end of
    /// its outbound queue.
    pub async fn register(&self) -> (SessionId, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_capacity);

        let mut sessions = self.sessions.lock().await;
        sessions.insert(id, sender);
        debug!(session = id, members = sessions.len(), "session registered");

        (id, receiver)
    }

    /// Removes a session. Removing an id that is not present is a no-op.
    pub async fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(&id).is_some();
        if removed {
            debug!(session = id, members = sessions.len(), "session unregistered");
        }
        removed
    }

    /// Queues `line`, framed, for every registered session including the
    /// sender. Returns how many sessions accepted it.
    ///
    /// Recipients whose queue is full or closed are removed from the
    /// registry; their sessions notice once the queue drains.
    pub async fn broadcast(&self, line: &str) -> usize {
        let framed: Outbound = Arc::from(frame_message(line));
        let recipients: Vec<(SessionId, mpsc::Sender<Outbound>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(id, sender)| (*id, sender.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut evicted = Vec::new();
        for (id, sender) in recipients {
            match sender.try_send(Arc::clone(&framed)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session = id, "outbound queue full, dropping slow session");
                    evicted.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session = id, "outbound queue closed");
                    evicted.push(id);
                }
            }
        }

        if !evicted.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for id in evicted {
                sessions.remove(&id);
            }
        }

        delivered
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::message::{Replies, Reply};
use crate::types::MessageId;

/// How long a timed-out row is kept for a reader that has not seen the
/// timeout yet.
pub const EXPIRED_ROW_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Row<C> {
    queue: VecDeque<C>,
    last_seen: bool,
    elapsed: bool,
    deadline: Instant,
}

impl<C> Row<C> {
    fn is_elapsed(&self, now: Instant) -> bool {
        self.elapsed || now >= self.deadline
    }
}

/// Replies collected by a publisher, per repliable message.
///
/// A row is opened when the message is published. It is closed when its
/// reader consumes the terminal marker or is told of the timeout. Replies
/// queued before the deadline are handed out before the timeout is.
pub struct ReplyTable<C> {
    rows: Mutex<HashMap<MessageId, Row<C>>>,
    arrived: Notify,
}

impl<C> Default for ReplyTable<C> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
        }
    }
}

impl<C> ReplyTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a row for `id`, answerable until `deadline`.
    pub fn expect(&self, id: MessageId, deadline: Instant) {
        self.rows.lock().insert(
            id,
            Row {
                queue: VecDeque::new(),
                last_seen: false,
                elapsed: false,
                deadline,
            },
        );
    }

    /// Store an incoming reply. Returns `false` if no row expects it.
    pub fn push(&self, reply: Reply<C>) -> bool {
        {
            let mut rows = self.rows.lock();
            let Some(row) = rows.get_mut(&reply.message_id) else {
                return false;
            };
            if row.is_elapsed(Instant::now()) {
                return false;
            }
            if let Some(payload) = reply.payload {
                row.queue.push_back(payload);
            }
            if reply.last {
                row.last_seen = true;
            }
        }
        self.arrived.notify_waiters();
        true
    }

    /// Wait for the next reply to `id`.
    ///
    /// Queued replies come first. Then `Ok(None)` if the terminal marker was
    /// seen, or `ReplyTimeout` if the deadline passed without it; either
    /// closes the row. `Ok(None)` also for an unknown or closed `id`.
    pub async fn next_reply(&self, id: MessageId) -> Result<Option<C>, BrokerError> {
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let deadline = {
                let mut rows = self.rows.lock();
                let Some(row) = rows.get_mut(&id) else {
                    return Ok(None);
                };
                if let Some(payload) = row.queue.pop_front() {
                    return Ok(Some(payload));
                }
                if row.last_seen {
                    rows.remove(&id);
                    return Ok(None);
                }
                if row.is_elapsed(Instant::now()) {
                    rows.remove(&id);
                    return Err(BrokerError::ReplyTimeout {
                        message_id: id.to_string(),
                    });
                }
                row.deadline
            };

            let _ = tokio::time::timeout_at(deadline, arrived).await;
        }
    }

    /// Whether [`next_reply`](Self::next_reply) may still yield something.
    pub fn has_more_replies(&self, id: &MessageId) -> bool {
        self.rows.lock().get(id).is_some_and(|row| {
            !row.queue.is_empty() || (!row.last_seen && !row.is_elapsed(Instant::now()))
        })
    }

    /// Drain every reply to `id`, waiting up to its deadline.
    pub async fn all_replies(&self, id: MessageId) -> Replies<C> {
        let mut replies = Vec::new();
        loop {
            match self.next_reply(id).await {
                Ok(Some(reply)) => replies.push(reply),
                Ok(None) => {
                    return Replies {
                        replies,
                        complete: true,
                    }
                }
                Err(_) => {
                    return Replies {
                        replies,
                        complete: false,
                    }
                }
            }
        }
    }

    /// Mark rows past their deadline as timed out, and discard those whose
    /// reader has not come back within [`EXPIRED_ROW_GRACE`]. Returns how
    /// many were discarded.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| {
            if now >= row.deadline {
                row.elapsed = true;
            }
            !row.elapsed || now < row.deadline + EXPIRED_ROW_GRACE
        });
        before - rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

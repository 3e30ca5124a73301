//! Broker-side reply correlation.
//!
//! For every repliable message forwarded by this broker, remembers the
//! neighbor it came from and how many neighbors it went to. Replies then
//! travel back hop by hop along these rows, and the "last" markers of the
//! downstream branches are folded into a single last marker upstream.
//!
//! Pure logic, no I/O. The router feeds events and sends what it is told.
mod table;

pub use table::ReplyTable;

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::descriptor::NodeDescriptor;
use crate::message::Reply;
use crate::types::{MessageId, NodeId};

/// Maximum number of open rows (DoS protection).
const MAX_PENDING: usize = 10_000;

/// What to do with an incoming reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyRoute<C> {
    /// Send `reply` to the neighbor `to`.
    Forward { to: NodeDescriptor, reply: Reply<C> },
    /// Absorbed here: an intermediate last marker.
    Consumed,
    /// No row and no usable destination hint.
    Dropped,
}

#[derive(Debug)]
struct Pending {
    source: NodeDescriptor,
    destination: Option<NodeId>,
    /// Number of neighbors the message was forwarded to, once known.
    expected: Option<usize>,
    lasts_seen: usize,
    deadline: Instant,
}

impl Pending {
    fn is_complete(&self) -> bool {
        self.expected.is_some_and(|e| self.lasts_seen >= e)
    }
}

pub struct ReplyManager {
    rows: Mutex<HashMap<MessageId, Pending>>,
    timeout: Duration,
}

impl ReplyManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Open a row for a repliable message received from `source`.
    ///
    /// Returns `false` if the table is full of live rows.
    pub fn record_repliable(
        &self,
        id: MessageId,
        source: &NodeDescriptor,
        destination: Option<NodeId>,
    ) -> bool {
        let mut rows = self.rows.lock();
        if rows.len() >= MAX_PENDING {
            let now = Instant::now();
            rows.retain(|_, row| row.deadline > now);
            if rows.len() >= MAX_PENDING {
                return false;
            }
        }
        rows.insert(
            id,
            Pending {
                source: source.clone(),
                destination,
                expected: None,
                lasts_seen: 0,
                deadline: Instant::now() + self.timeout,
            },
        );
        true
    }

    /// Record the fan-out of message `id`.
    ///
    /// If that completes the row (nobody matched, or every branch already
    /// answered), the row is closed and a terminal reply for the source is
    /// returned.
    pub fn set_expected<C>(&self, id: MessageId, expected: usize) -> Option<ReplyRoute<C>> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id)?;
        row.expected = Some(expected);
        if !row.is_complete() {
            return None;
        }
        let row = rows.remove(&id)?;
        Some(ReplyRoute::Forward {
            to: row.source,
            reply: Reply::terminal(id, row.destination),
        })
    }

    /// Decide where `reply` goes next.
    ///
    /// `neighbors` resolves the destination hint of replies whose row is
    /// unknown here.
    pub fn route<C>(&self, reply: Reply<C>, neighbors: &[NodeDescriptor]) -> ReplyRoute<C> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&reply.message_id) else {
            return Self::route_by_hint(reply, neighbors);
        };

        if reply.last {
            row.lasts_seen += 1;
        }
        if reply.last && row.is_complete() {
            let source = row.source.clone();
            rows.remove(&reply.message_id);
            return ReplyRoute::Forward {
                to: source,
                reply,
            };
        }
        if reply.payload.is_none() {
            return ReplyRoute::Consumed;
        }
        ReplyRoute::Forward {
            to: row.source.clone(),
            reply: Reply {
                last: false,
                ..reply
            },
        }
    }

    fn route_by_hint<C>(reply: Reply<C>, neighbors: &[NodeDescriptor]) -> ReplyRoute<C> {
        let target = reply
            .destination
            .and_then(|dest| neighbors.iter().find(|n| n.id() == dest).cloned());
        match target {
            Some(to) => ReplyRoute::Forward { to, reply },
            None => {
                debug!("reply for unknown message {} dropped", reply.message_id);
                ReplyRoute::Dropped
            }
        }
    }

    /// Drop rows whose deadline passed. Returns how many were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| row.deadline > now);
        before - rows.len()
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.rows.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

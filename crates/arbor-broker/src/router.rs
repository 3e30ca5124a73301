//! Content-based router of one broker.
//!
//! Decodes routing packets dispatched by the overlay and applies them to
//! the subscription table through the routing strategy, under a single
//! coarse lock ("the router lock"). Reconfigurators take the same lock via
//! [`Router::lock`] so their table edits never interleave with routing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::descriptor::NodeDescriptor;
use crate::filter::Filter;
use crate::message::{Message, Reply};
use crate::neighborhood::{send_packet, Neighborhood};
use crate::overlay::{Overlay, PacketListener};
use crate::reply::{ReplyManager, ReplyRoute};
use crate::strategy::{RoutingStrategy, SubscriptionForwarding};
use crate::subscription::SubscriptionTable;

// ── Subjects and traffic classes ───────────────────────────────────────

pub const PUBLISH: &str = "publish";
pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";
pub const UNSUBSCRIBE_ALL: &str = "unsubscribeAll";
pub const REPLY: &str = "reply";

/// Bulk data: publications and replies.
pub const MESSAGE_CLASS: &str = "MessageClass";
/// Subscription control. All of it shares one class to keep its order.
pub const FILTER_CLASS: &str = "FilterClass";

const MESSAGE_SUBJECTS: [&str; 2] = [PUBLISH, REPLY];
const FILTER_SUBJECTS: [&str; 3] = [SUBSCRIBE, UNSUBSCRIBE, UNSUBSCRIBE_ALL];

// ── Routing state ──────────────────────────────────────────────────────

/// Everything the router lock protects.
pub struct RoutingState<F: Filter> {
    table: SubscriptionTable<F>,
    strategy: Box<dyn RoutingStrategy<F>>,
    neighborhood: Arc<dyn Neighborhood>,
}

impl<F: Filter> RoutingState<F> {
    pub fn table(&self) -> &SubscriptionTable<F> {
        &self.table
    }

    /// Direct table access, bypassing propagation.
    pub fn table_mut(&mut self) -> &mut SubscriptionTable<F> {
        &mut self.table
    }

    pub fn neighborhood(&self) -> &dyn Neighborhood {
        self.neighborhood.as_ref()
    }

    pub fn subscribe(&mut self, neighbor: &NodeDescriptor, filter: &F) {
        self.strategy
            .subscribe(&mut self.table, self.neighborhood.as_ref(), neighbor, filter);
    }

    pub fn unsubscribe(&mut self, neighbor: &NodeDescriptor, filter: &F) {
        self.strategy
            .unsubscribe(&mut self.table, self.neighborhood.as_ref(), neighbor, filter);
    }

    pub fn unsubscribe_all(&mut self, neighbor: &NodeDescriptor) {
        self.strategy
            .unsubscribe_all(&mut self.table, self.neighborhood.as_ref(), neighbor);
    }

    pub fn publish(
        &self,
        source: Option<&NodeDescriptor>,
        message: &Message<F::Content>,
    ) -> usize {
        self.strategy
            .publish(&self.table, self.neighborhood.as_ref(), source, message)
    }
}

// ── Router ─────────────────────────────────────────────────────────────

pub struct Router<F: Filter> {
    inner: Arc<RouterInner<F>>,
}

impl<F: Filter> Clone for Router<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct RouterInner<F: Filter> {
    neighborhood: Arc<dyn Neighborhood>,
    state: Mutex<RoutingState<F>>,
    replies: ReplyManager,
}

impl<F: Filter> Router<F> {
    /// Router using subscription forwarding.
    pub fn new(neighborhood: Arc<dyn Neighborhood>, reply_timeout: Duration) -> Self {
        Self::with_strategy(neighborhood, Box::new(SubscriptionForwarding), reply_timeout)
    }

    pub fn with_strategy(
        neighborhood: Arc<dyn Neighborhood>,
        strategy: Box<dyn RoutingStrategy<F>>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                neighborhood: neighborhood.clone(),
                state: Mutex::new(RoutingState {
                    table: SubscriptionTable::new(),
                    strategy,
                    neighborhood,
                }),
                replies: ReplyManager::new(reply_timeout),
            }),
        }
    }

    /// Declare the routing traffic classes on `overlay` and listen for the
    /// routing subjects.
    pub fn register(&self, overlay: &Overlay) {
        for subject in MESSAGE_SUBJECTS {
            overlay.set_traffic_class(subject, MESSAGE_CLASS);
        }
        for subject in FILTER_SUBJECTS {
            overlay.set_traffic_class(subject, FILTER_CLASS);
        }
        let listener: Arc<dyn PacketListener> = Arc::new(self.clone());
        for subject in MESSAGE_SUBJECTS.iter().chain(FILTER_SUBJECTS.iter()) {
            overlay.add_packet_listener(subject, listener.clone());
        }
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        self.inner.neighborhood.local()
    }

    pub fn neighborhood(&self) -> &dyn Neighborhood {
        self.inner.neighborhood.as_ref()
    }

    /// Take the router lock.
    pub fn lock(&self) -> MutexGuard<'_, RoutingState<F>> {
        self.inner.state.lock()
    }

    pub fn subscribe(&self, neighbor: &NodeDescriptor, filter: &F) {
        self.lock().subscribe(neighbor, filter);
    }

    pub fn unsubscribe(&self, neighbor: &NodeDescriptor, filter: &F) {
        self.lock().unsubscribe(neighbor, filter);
    }

    pub fn unsubscribe_all(&self, neighbor: &NodeDescriptor) {
        self.lock().unsubscribe_all(neighbor);
    }

    /// Route `message` received from `source` (`None` when it originates
    /// here). Returns the number of neighbors it was forwarded to.
    ///
    /// For a repliable message from a neighbor, a reply row is opened first
    /// so that replies racing the fan-out find it.
    pub fn publish(
        &self,
        source: Option<&NodeDescriptor>,
        message: &Message<F::Content>,
    ) -> usize {
        let state = self.lock();
        let tracked = match source {
            Some(src) if message.is_repliable() => {
                self.inner
                    .replies
                    .record_repliable(message.id(), src, message.origin())
            }
            _ => false,
        };

        let sent = state.publish(source, message);
        debug!("{} forwarded {} to {sent} neighbor(s)", self.descriptor(), message.id());

        if tracked {
            if let Some(route) = self.inner.replies.set_expected(message.id(), sent) {
                self.send_reply(route);
            }
        }
        sent
    }

    /// Route `reply` one hop back toward the publisher.
    pub fn forward_reply(&self, reply: Reply<F::Content>) {
        let _state = self.lock();
        let neighbors = self.inner.neighborhood.neighbors();
        let route = self.inner.replies.route(reply, &neighbors);
        self.send_reply(route);
    }

    fn send_reply(&self, route: ReplyRoute<F::Content>) {
        if let ReplyRoute::Forward { to, reply } = route {
            if let Err(e) = send_packet(self.inner.neighborhood.as_ref(), REPLY, &reply, &to) {
                debug!("{REPLY} for {} to {to} skipped: {e}", reply.message_id);
            }
        }
    }

    /// Drop reply rows past their deadline.
    pub fn sweep_replies(&self) -> usize {
        self.inner.replies.sweep(Instant::now())
    }

    pub fn replies(&self) -> &ReplyManager {
        &self.inner.replies
    }

    // ── Inspection ─────────────────────────────────────────────────────

    pub fn is_subscribed(&self, neighbor: &NodeDescriptor, filter: &F) -> bool {
        self.lock().table().is_subscribed(neighbor, filter)
    }

    pub fn filters_of(&self, neighbor: &NodeDescriptor) -> Vec<F> {
        self.lock().table().filters_of(neighbor)
    }

    pub fn all_filters(&self) -> Vec<F> {
        self.lock().table().all_filters(false)
    }

    pub fn subscribed_neighbors(&self, filter: &F) -> Vec<NodeDescriptor> {
        self.lock().table().subscribed_neighbors(filter)
    }
}

fn decode<T: DeserializeOwned>(subject: &str, source: &NodeDescriptor, payload: &[u8]) -> Option<T> {
    match rmp_serde::from_slice(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("malformed {subject} from {source}: {e}");
            None
        }
    }
}

impl<F: Filter> PacketListener for Router<F> {
    fn packet_arrived(&self, subject: &str, source: &NodeDescriptor, payload: &[u8]) {
        match subject {
            PUBLISH => {
                if let Some(message) = decode::<Message<F::Content>>(subject, source, payload) {
                    self.publish(Some(source), &message);
                }
            }
            SUBSCRIBE => {
                if let Some(filter) = decode::<F>(subject, source, payload) {
                    self.subscribe(source, &filter);
                }
            }
            UNSUBSCRIBE => {
                if let Some(filter) = decode::<F>(subject, source, payload) {
                    self.unsubscribe(source, &filter);
                }
            }
            UNSUBSCRIBE_ALL => self.unsubscribe_all(source),
            REPLY => {
                if let Some(reply) = decode::<Reply<F::Content>>(subject, source, payload) {
                    self.forward_reply(reply);
                }
            }
            other => debug!("router ignores subject {other}"),
        }
    }
}

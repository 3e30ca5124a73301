//! Reconfiguration protocols: keep subscription state right across
//! topology changes.
//!
//! Both protocols follow Stable → (neighbor dead) → Deferred →
//! (FLUSH or timeout) → Stable. The dead neighbor's subscriptions leave the
//! local table at once; telling the rest of the overlay is deferred, so a
//! quick replacement link does not cause unsubscribe/resubscribe churn.

mod deferred;
mod informed;
mod oob;
mod task;

pub use deferred::{DeferredUnsubscription, DEFAULT_DEFER_TIMEOUT, DEFERRED_FLUSH};
pub use informed::{
    InformedLinkActivation, DEFAULT_SUBSCRIPTION_TIMEOUT, DEFAULT_UNSUBSCRIPTION_TIMEOUT,
    INFORMED_FLUSH,
};
pub use oob::{
    Activate, ActivateHandler, OobChannel, OobMessage, DEFAULT_ACK_TIMEOUT,
    DEFAULT_DEDUP_CAPACITY, DEFAULT_MAX_ATTEMPTS, MAX_DATAGRAM_SIZE,
};
pub use task::{Scheduler, TaskState};

use tracing::debug;

use crate::descriptor::NodeDescriptor;
use crate::filter::Filter;
use crate::neighborhood::{send_packet, Neighborhood};
use crate::router::{RoutingState, Router, SUBSCRIBE};
use crate::types::ReconfigurationId;

/// A running reconfiguration protocol.
pub trait Reconfigurator: Send + Sync {
    /// Deferred-unsubscription episodes still waiting for FLUSH or timeout.
    fn pending_episodes(&self) -> usize;

    /// Abort pending timers and background tasks.
    fn shutdown(&self);
}

// ── Deferred unsubscription task ───────────────────────────────────────

/// Propagates, once, the unsubscriptions of a dead neighbor.
#[derive(Debug)]
pub(crate) struct UnsubTask<F: Filter> {
    state: TaskState,
    neighbor: NodeDescriptor,
    filters: Vec<F>,
}

impl<F: Filter> UnsubTask<F> {
    pub fn new(neighbor: NodeDescriptor, filters: Vec<F>) -> Self {
        Self {
            state: TaskState::new(),
            neighbor,
            filters,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_scheduled()
    }

    /// Run unless already run. Returns whether this call ran it.
    ///
    /// Filters the neighbor subscribed again in the meantime are kept.
    /// Every other filter is put back for an instant and unsubscribed
    /// through the strategy, which decides what to propagate.
    pub fn run(&self, router: &Router<F>) -> bool {
        if !self.state.try_execute() {
            return false;
        }
        if self.filters.is_empty() {
            return true;
        }
        let mut state = router.lock();
        for filter in &self.filters {
            if state.table().is_subscribed(&self.neighbor, filter) {
                continue;
            }
            state.table_mut().add_subscription(&self.neighbor, filter);
            state.unsubscribe(&self.neighbor, filter);
        }
        debug!(
            "{} propagated {} deferred unsubscription(s) of {}",
            router.descriptor(),
            self.filters.len(),
            self.neighbor
        );
        true
    }
}

// ── Shared helpers ─────────────────────────────────────────────────────

/// Tell a new broker neighbor about every filter held on this side.
pub(crate) fn push_subscriptions<F: Filter>(state: &RoutingState<F>, neighbor: &NodeDescriptor) {
    for filter in state.table().all_filters_except(false, neighbor) {
        if let Err(e) = send_packet(state.neighborhood(), SUBSCRIBE, &filter, neighbor) {
            debug!("{SUBSCRIBE} {filter:?} to {neighbor} skipped: {e}");
        }
    }
}

pub(crate) fn send_flush(
    neighborhood: &dyn Neighborhood,
    subject: &str,
    id: ReconfigurationId,
    to: &NodeDescriptor,
) {
    if let Err(e) = send_packet(neighborhood, subject, &id, to) {
        debug!("{subject} ({id}) to {to} skipped: {e}");
    }
}

/// Pass a FLUSH for an episode unknown here to every other broker.
pub(crate) fn relay_flush(
    neighborhood: &dyn Neighborhood,
    subject: &str,
    id: ReconfigurationId,
    source: &NodeDescriptor,
) {
    for node in neighborhood.neighbors_except(source) {
        if node.is_broker() {
            send_flush(neighborhood, subject, id, &node);
        }
    }
}

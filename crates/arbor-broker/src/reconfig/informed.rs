use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    push_subscriptions, relay_flush, send_flush, Activate, ActivateHandler, OobChannel,
    Reconfigurator, Scheduler, UnsubTask,
};
use crate::descriptor::NodeDescriptor;
use crate::filter::Filter;
use crate::neighborhood::send_packet;
use crate::overlay::{Overlay, PacketListener};
use crate::router::{Router, FILTER_CLASS, SUBSCRIBE};
use crate::topology::NeighborhoodListener;
use crate::types::{ReconfigurationId, ReconfigurationInfo};

pub const INFORMED_FLUSH: &str = "__INFLINKACT_FLUSH";

pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_UNSUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Informed Link Activation.
///
/// When a broker neighbor dies and the topology layer knows which link
/// replaces it, the detecting broker keeps the dead neighbor's
/// unsubscriptions pending and tells the same-subtree endpoint of the new
/// link (by ACTIVATE over UDP) which filters must not cross the new link
/// yet. That endpoint pushes every other filter at once, defers the rest,
/// and sends a FLUSH over the new link that completes the pending
/// unsubscriptions wherever the episode is known.
pub struct InformedLinkActivation<F: Filter> {
    inner: Arc<InformedInner<F>>,
}

struct InformedInner<F: Filter> {
    me: Weak<InformedInner<F>>,
    router: Router<F>,
    oob: OobChannel<F>,
    sub_timeout: Mutex<Duration>,
    unsub_timeout: Mutex<Duration>,
    episode: Mutex<()>,
    deferred_unsubs: Mutex<HashMap<ReconfigurationId, Arc<UnsubTask<F>>>>,
    episodes: Mutex<Vec<Arc<UnsubTask<F>>>>,
    /// ACTIVATEs whose new neighbor has not connected yet, by that neighbor.
    parked: Mutex<HashMap<NodeDescriptor, Activate<F>>>,
    scheduler: Scheduler,
}

impl<F: Filter> InformedLinkActivation<F> {
    pub fn new(
        router: Router<F>,
        oob: OobChannel<F>,
        sub_timeout: Duration,
        unsub_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|me| InformedInner {
                me: me.clone(),
                router,
                oob,
                sub_timeout: Mutex::new(sub_timeout),
                unsub_timeout: Mutex::new(unsub_timeout),
                episode: Mutex::new(()),
                deferred_unsubs: Mutex::new(HashMap::new()),
                episodes: Mutex::new(Vec::new()),
                parked: Mutex::new(HashMap::new()),
                scheduler: Scheduler::new(),
            }),
        }
    }

    /// Listen on `overlay` and start receiving ACTIVATEs.
    pub fn register(&self, overlay: &Overlay) {
        overlay.set_traffic_class(INFORMED_FLUSH, FILTER_CLASS);
        overlay.add_packet_listener(INFORMED_FLUSH, self.inner.clone());
        overlay.add_neighborhood_listener(self.inner.clone());
        self.inner
            .oob
            .start(Arc::new(ActivationReceiver(Arc::downgrade(&self.inner))));
    }

    pub fn oob(&self) -> &OobChannel<F> {
        &self.inner.oob
    }

    pub fn subscription_timeout(&self) -> Duration {
        *self.inner.sub_timeout.lock()
    }

    /// Takes effect from the next episode.
    pub fn set_subscription_timeout(&self, timeout: Duration) {
        *self.inner.sub_timeout.lock() = timeout;
    }

    pub fn unsubscription_timeout(&self) -> Duration {
        *self.inner.unsub_timeout.lock()
    }

    /// Takes effect from the next episode.
    pub fn set_unsubscription_timeout(&self, timeout: Duration) {
        *self.inner.unsub_timeout.lock() = timeout;
    }

    /// ACTIVATEs waiting for their new neighbor to connect.
    pub fn parked_activations(&self) -> usize {
        self.inner.parked.lock().len()
    }
}

impl<F: Filter> Reconfigurator for InformedLinkActivation<F> {
    fn pending_episodes(&self) -> usize {
        let mut episodes = self.inner.episodes.lock();
        episodes.retain(|task| task.is_pending());
        episodes.len()
    }

    fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        self.inner.oob.shutdown();
        self.inner.deferred_unsubs.lock().clear();
        self.inner.episodes.lock().clear();
        self.inner.parked.lock().clear();
    }
}

impl<F: Filter> InformedInner<F> {
    fn finish_unsubscription(&self, task: &UnsubTask<F>, id: ReconfigurationId) {
        let _episode = self.episode.lock();
        task.run(&self.router);
        self.deferred_unsubs.lock().remove(&id);
    }

    /// Perform `activate` now if its new neighbor is connected, else park it
    /// until the neighbor shows up. Called with the episode lock held.
    fn accept_activate(&self, activate: Activate<F>) {
        if self.router.neighborhood().is_neighbor(&activate.new_neighbor) {
            self.perform_activate(activate);
            return;
        }

        let neighbor = activate.new_neighbor.clone();
        let id = activate.reconfiguration;
        debug!(
            "{} parks ACTIVATE ({id}) until {neighbor} connects",
            self.router.descriptor()
        );
        self.parked.lock().insert(neighbor.clone(), activate);

        let me = self.me.clone();
        let expiry = *self.sub_timeout.lock() + *self.unsub_timeout.lock();
        self.scheduler.schedule(expiry, move || {
            let Some(inner) = me.upgrade() else { return };
            let mut parked = inner.parked.lock();
            if parked.get(&neighbor).is_some_and(|a| a.reconfiguration == id) {
                parked.remove(&neighbor);
                warn!("ACTIVATE ({id}) dropped: {neighbor} never connected");
            }
        });
    }

    /// Push confirmed filters over the new link, defer unconfirmed ones,
    /// then FLUSH the episode across it.
    fn perform_activate(&self, activate: Activate<F>) {
        let Activate {
            reconfiguration,
            unconfirmed,
            new_neighbor,
        } = activate;

        let deferred = {
            let state = self.router.lock();
            let mut deferred = Vec::new();
            for filter in state.table().all_filters_except(false, &new_neighbor) {
                if unconfirmed.contains(&filter) {
                    deferred.push(filter);
                } else if let Err(e) =
                    send_packet(state.neighborhood(), SUBSCRIBE, &filter, &new_neighbor)
                {
                    debug!("{SUBSCRIBE} {filter:?} to {new_neighbor} skipped: {e}");
                }
            }
            send_flush(state.neighborhood(), INFORMED_FLUSH, reconfiguration, &new_neighbor);
            deferred
        };
        info!(
            "{} activated link to {new_neighbor} ({reconfiguration}), {} filter(s) deferred",
            self.router.descriptor(),
            deferred.len()
        );

        if deferred.is_empty() {
            return;
        }
        let me = self.me.clone();
        let timeout = *self.sub_timeout.lock();
        self.scheduler.schedule(timeout, move || {
            if let Some(inner) = me.upgrade() {
                inner.propagate_deferred(&new_neighbor, &deferred);
            }
        });
    }

    /// Subscribe `neighbor` to the deferred filters someone else still needs.
    fn propagate_deferred(&self, neighbor: &NodeDescriptor, filters: &[F]) {
        let _episode = self.episode.lock();
        let state = self.router.lock();
        for filter in filters {
            let subscribers = state.table().subscribed_neighbors(filter);
            let wanted = subscribers.len() > 1
                || (subscribers.len() == 1 && subscribers[0] != *neighbor);
            if !wanted {
                continue;
            }
            if let Err(e) = send_packet(state.neighborhood(), SUBSCRIBE, filter, neighbor) {
                debug!("deferred {SUBSCRIBE} {filter:?} to {neighbor} skipped: {e}");
            }
        }
    }
}

impl<F: Filter> NeighborhoodListener for InformedInner<F> {
    fn neighbor_added(&self, neighbor: &NodeDescriptor, _reconfiguration: Option<ReconfigurationId>) {
        if !neighbor.is_broker() {
            return;
        }
        let _episode = self.episode.lock();
        let parked = self.parked.lock().remove(neighbor);
        match parked {
            Some(activate) => self.perform_activate(activate),
            None => push_subscriptions(&self.router.lock(), neighbor),
        }
    }

    fn neighbor_removed(&self, neighbor: &NodeDescriptor) {
        let _episode = self.episode.lock();
        self.router.unsubscribe_all(neighbor);
    }

    fn neighbor_dead(&self, neighbor: &NodeDescriptor, reconfiguration: Option<&ReconfigurationInfo>) {
        let _episode = self.episode.lock();

        let substitution = reconfiguration.and_then(ReconfigurationInfo::substitution);
        let Some(substitution) = substitution.filter(|_| neighbor.is_broker()) else {
            // No replacement link known: nothing to optimize.
            self.router.unsubscribe_all(neighbor);
            return;
        };
        let id = substitution.id;

        let (dead_filters, dead_only) = {
            let mut state = self.router.lock();
            let dead_filters = state.table().filters_of(neighbor);
            let dead_only: Vec<F> = dead_filters
                .iter()
                .filter(|f| state.table().single_subscribed_broker(f).as_ref() == Some(neighbor))
                .cloned()
                .collect();
            state.table_mut().remove_all_subscriptions(neighbor);
            (dead_filters, dead_only)
        };

        // Kept even without filters: it tells whether a FLUSH is ours.
        let task = Arc::new(UnsubTask::new(neighbor.clone(), dead_filters));
        self.deferred_unsubs.lock().insert(id, task.clone());
        self.episodes.lock().push(task.clone());
        let me = self.me.clone();
        let timeout = *self.unsub_timeout.lock();
        self.scheduler.schedule(timeout, move || {
            if let Some(inner) = me.upgrade() {
                inner.finish_unsubscription(&task, id);
            }
        });

        let activate = Activate {
            reconfiguration: id,
            unconfirmed: dead_only,
            new_neighbor: substitution.other_subtree_broker.clone(),
        };
        let endpoint = &substitution.same_subtree_broker;
        if endpoint == self.router.descriptor() {
            self.accept_activate(activate);
        } else if let Err(e) = self.oob.send_activate(activate, endpoint) {
            warn!("cannot send ACTIVATE ({id}) to {endpoint}: {e}");
        }
    }
}

impl<F: Filter> PacketListener for InformedInner<F> {
    fn packet_arrived(&self, subject: &str, source: &NodeDescriptor, payload: &[u8]) {
        let id: ReconfigurationId = match rmp_serde::from_slice(payload) {
            Ok(id) => id,
            Err(e) => {
                warn!("malformed {subject} from {source}: {e}");
                return;
            }
        };

        let _episode = self.episode.lock();
        let task = self.deferred_unsubs.lock().remove(&id);
        match task {
            Some(task) => {
                debug!("{} completes {id}", self.router.descriptor());
                task.run(&self.router);
            }
            // Also reached once the timeout has run the task.
            None => relay_flush(self.router.neighborhood(), INFORMED_FLUSH, id, source),
        }
    }
}

struct ActivationReceiver<F: Filter>(Weak<InformedInner<F>>);

impl<F: Filter> ActivateHandler<F> for ActivationReceiver<F> {
    fn activate_arrived(&self, activate: Activate<F>) {
        if let Some(inner) = self.0.upgrade() {
            let _episode = inner.episode.lock();
            inner.accept_activate(activate);
        }
    }
}

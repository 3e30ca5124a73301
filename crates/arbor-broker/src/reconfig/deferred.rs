use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{push_subscriptions, relay_flush, send_flush, Reconfigurator, Scheduler, UnsubTask};
use crate::descriptor::NodeDescriptor;
use crate::filter::Filter;
use crate::overlay::{Overlay, PacketListener};
use crate::router::{Router, FILTER_CLASS};
use crate::topology::NeighborhoodListener;
use crate::types::{ReconfigurationId, ReconfigurationInfo};

pub const DEFERRED_FLUSH: &str = "__DEFUNSUB_FLUSH";

pub const DEFAULT_DEFER_TIMEOUT: Duration = Duration::from_secs(3);

/// Deferred Unsubscription.
///
/// In timed mode, the unsubscriptions of a dead broker neighbor propagate
/// once the defer timeout expires. In notified mode, a FLUSH carrying the
/// episode id (sent by whoever built the replacement link) propagates them
/// as soon as it reaches this broker; the timeout remains as a fallback.
pub struct DeferredUnsubscription<F: Filter> {
    inner: Arc<DeferredInner<F>>,
}

struct DeferredInner<F: Filter> {
    me: Weak<DeferredInner<F>>,
    router: Router<F>,
    notified: bool,
    defer_timeout: Mutex<Duration>,
    /// Serializes whole reconfiguration steps. Taken before the router lock.
    episode: Mutex<()>,
    pending: Mutex<HashMap<ReconfigurationId, Arc<UnsubTask<F>>>>,
    episodes: Mutex<Vec<Arc<UnsubTask<F>>>>,
    scheduler: Scheduler,
}

impl<F: Filter> DeferredUnsubscription<F> {
    pub fn new(router: Router<F>, notified: bool, defer_timeout: Duration) -> Self {
        Self {
            inner: Arc::new_cyclic(|me| DeferredInner {
                me: me.clone(),
                router,
                notified,
                defer_timeout: Mutex::new(defer_timeout),
                episode: Mutex::new(()),
                pending: Mutex::new(HashMap::new()),
                episodes: Mutex::new(Vec::new()),
                scheduler: Scheduler::new(),
            }),
        }
    }

    /// Listen for neighborhood changes on `overlay`, and for FLUSH packets
    /// in notified mode.
    pub fn register(&self, overlay: &Overlay) {
        if self.inner.notified {
            overlay.set_traffic_class(DEFERRED_FLUSH, FILTER_CLASS);
            overlay.add_packet_listener(DEFERRED_FLUSH, self.inner.clone());
        }
        overlay.add_neighborhood_listener(self.inner.clone());
    }

    pub fn is_notified(&self) -> bool {
        self.inner.notified
    }

    pub fn defer_timeout(&self) -> Duration {
        *self.inner.defer_timeout.lock()
    }

    /// Zero disables deferral: dead neighbors are unsubscribed at once.
    pub fn set_defer_timeout(&self, timeout: Duration) {
        *self.inner.defer_timeout.lock() = timeout;
    }
}

impl<F: Filter> Reconfigurator for DeferredUnsubscription<F> {
    fn pending_episodes(&self) -> usize {
        let mut episodes = self.inner.episodes.lock();
        episodes.retain(|task| task.is_pending());
        episodes.len()
    }

    fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        self.inner.pending.lock().clear();
        self.inner.episodes.lock().clear();
    }
}

impl<F: Filter> DeferredInner<F> {
    fn finish(&self, task: &UnsubTask<F>, id: Option<ReconfigurationId>) {
        let _episode = self.episode.lock();
        task.run(&self.router);
        if let Some(id) = id {
            self.pending.lock().remove(&id);
        }
    }
}

impl<F: Filter> NeighborhoodListener for DeferredInner<F> {
    fn neighbor_added(&self, neighbor: &NodeDescriptor, reconfiguration: Option<ReconfigurationId>) {
        if !neighbor.is_broker() {
            return;
        }
        let _episode = self.episode.lock();
        let state = self.router.lock();
        push_subscriptions(&state, neighbor);
        if self.notified {
            if let Some(id) = reconfiguration {
                debug!("{} flushing {id} toward {neighbor}", self.router.descriptor());
                send_flush(state.neighborhood(), DEFERRED_FLUSH, id, neighbor);
            }
        }
    }

    fn neighbor_removed(&self, neighbor: &NodeDescriptor) {
        let _episode = self.episode.lock();
        self.router.unsubscribe_all(neighbor);
    }

    fn neighbor_dead(&self, neighbor: &NodeDescriptor, reconfiguration: Option<&ReconfigurationInfo>) {
        let timeout = *self.defer_timeout.lock();
        let _episode = self.episode.lock();

        if neighbor.is_client() || timeout.is_zero() {
            self.router.unsubscribe_all(neighbor);
            return;
        }

        let id = if self.notified {
            reconfiguration.map(ReconfigurationInfo::id)
        } else {
            None
        };

        let filters = {
            let mut state = self.router.lock();
            if state.neighborhood().number_of_brokers() == 0 {
                // Nobody left to tell.
                state.table_mut().remove_all_subscriptions(neighbor);
                return;
            }
            let filters = state.table().filters_of(neighbor);
            if filters.is_empty() && id.is_none() {
                return;
            }
            state.table_mut().remove_all_subscriptions(neighbor);
            filters
        };

        info!(
            "{} deferring {} unsubscription(s) of {neighbor} for {timeout:?}",
            self.router.descriptor(),
            filters.len()
        );
        let task = Arc::new(UnsubTask::new(neighbor.clone(), filters));
        if let Some(id) = id {
            self.pending.lock().insert(id, task.clone());
        }
        self.episodes.lock().push(task.clone());

        let me = self.me.clone();
        self.scheduler.schedule(timeout, move || {
            if let Some(inner) = me.upgrade() {
                inner.finish(&task, id);
            }
        });
    }
}

impl<F: Filter> PacketListener for DeferredInner<F> {
    fn packet_arrived(&self, subject: &str, source: &NodeDescriptor, payload: &[u8]) {
        let id: ReconfigurationId = match rmp_serde::from_slice(payload) {
            Ok(id) => id,
            Err(e) => {
                warn!("malformed {subject} from {source}: {e}");
                return;
            }
        };

        let _episode = self.episode.lock();
        let task = self.pending.lock().remove(&id);
        match task {
            Some(task) => {
                debug!("{} is the addressee of {id}", self.router.descriptor());
                task.run(&self.router);
            }
            None => relay_flush(self.router.neighborhood(), DEFERRED_FLUSH, id, source),
        }
    }
}

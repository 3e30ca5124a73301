//! Subscription forwarding over an acyclic overlay.
//!
//! A filter travels toward the rest of the tree only when it first appears
//! in the local table, or when exactly one other broker holds it (then only
//! that broker needs to learn about the new interest). Publications follow
//! the reverse paths laid by these subscriptions.
//!
//! The overlay is assumed to be a tree. Nothing here detects a cycle; on a
//! cyclic overlay publications would loop.

use tracing::{debug, trace, warn, Level};

use crate::descriptor::NodeDescriptor;
use crate::error::BrokerError;
use crate::filter::Filter;
use crate::message::Message;
use crate::neighborhood::{send_packet, Neighborhood};
use crate::router::{PUBLISH, SUBSCRIBE, UNSUBSCRIBE};
use crate::subscription::SubscriptionTable;

/// How subscriptions and publications propagate.
///
/// Callers hold the router lock for the duration of every call, so
/// implementations own `table` exclusively.
pub trait RoutingStrategy<F: Filter>: Send + Sync {
    fn subscribe(
        &self,
        table: &mut SubscriptionTable<F>,
        neighborhood: &dyn Neighborhood,
        neighbor: &NodeDescriptor,
        filter: &F,
    );

    fn unsubscribe(
        &self,
        table: &mut SubscriptionTable<F>,
        neighborhood: &dyn Neighborhood,
        neighbor: &NodeDescriptor,
        filter: &F,
    );

    fn unsubscribe_all(
        &self,
        table: &mut SubscriptionTable<F>,
        neighborhood: &dyn Neighborhood,
        neighbor: &NodeDescriptor,
    ) {
        for filter in table.filters_of(neighbor) {
            self.unsubscribe(table, neighborhood, neighbor, &filter);
        }
    }

    /// Forward `message` to every matching neighbor except `source`.
    /// Returns how many neighbors it was actually sent to.
    fn publish(
        &self,
        table: &SubscriptionTable<F>,
        neighborhood: &dyn Neighborhood,
        source: Option<&NodeDescriptor>,
        message: &Message<F::Content>,
    ) -> usize;
}

/// Level of a failed forward: a neighbor that just left is routine.
fn failure_level(e: &BrokerError) -> Level {
    match e {
        BrokerError::NotConnected { .. } => Level::DEBUG,
        _ => Level::WARN,
    }
}

fn report_failure(subject: &str, node: &NodeDescriptor, e: &BrokerError) {
    if failure_level(e) == Level::WARN {
        warn!("{subject} to {node} failed: {e}");
    } else {
        debug!("{subject} to {node} skipped: {e}");
    }
}

/// The stock tree-forwarding strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubscriptionForwarding;

impl SubscriptionForwarding {
    fn forward<F: Filter>(
        &self,
        neighborhood: &dyn Neighborhood,
        subject: &str,
        filter: &F,
        to: &[NodeDescriptor],
    ) {
        for node in to {
            if let Err(e) = send_packet(neighborhood, subject, filter, node) {
                report_failure(subject, node, &e);
            }
        }
    }

    fn other_brokers(
        neighborhood: &dyn Neighborhood,
        excluded: &NodeDescriptor,
    ) -> Vec<NodeDescriptor> {
        neighborhood
            .neighbors_except(excluded)
            .into_iter()
            .filter(|n| n.is_broker())
            .collect()
    }
}

impl<F: Filter> RoutingStrategy<F> for SubscriptionForwarding {
    fn subscribe(
        &self,
        table: &mut SubscriptionTable<F>,
        neighborhood: &dyn Neighborhood,
        neighbor: &NodeDescriptor,
        filter: &F,
    ) {
        if !neighborhood.is_neighbor(neighbor) {
            debug!("ignoring {SUBSCRIBE} from non-neighbor {neighbor}");
            return;
        }
        if table.is_subscribed(neighbor, filter) {
            trace!("{neighbor} already holds {filter:?}");
            return;
        }

        if !table.is_filter_in_table(filter) {
            let targets = Self::other_brokers(neighborhood, neighbor);
            self.forward(neighborhood, SUBSCRIBE, filter, &targets);
        } else if let Some(single) = table.single_subscribed_broker(filter) {
            if &single != neighbor {
                self.forward(neighborhood, SUBSCRIBE, filter, &[single]);
            }
        }

        table.add_subscription(neighbor, filter);
    }

    fn unsubscribe(
        &self,
        table: &mut SubscriptionTable<F>,
        neighborhood: &dyn Neighborhood,
        neighbor: &NodeDescriptor,
        filter: &F,
    ) {
        if !table.remove_subscription(neighbor, filter) {
            return;
        }

        if !table.is_filter_in_table(filter) {
            let targets = Self::other_brokers(neighborhood, neighbor);
            self.forward(neighborhood, UNSUBSCRIBE, filter, &targets);
        } else if let Some(single) = table.single_subscribed_broker(filter) {
            if &single != neighbor {
                self.forward(neighborhood, UNSUBSCRIBE, filter, &[single]);
            }
        }
    }

    fn publish(
        &self,
        table: &SubscriptionTable<F>,
        neighborhood: &dyn Neighborhood,
        source: Option<&NodeDescriptor>,
        message: &Message<F::Content>,
    ) -> usize {
        let mut sent = 0;
        for node in table.matches(message, source) {
            match send_packet(neighborhood, PUBLISH, message, &node) {
                Ok(()) => sent += 1,
                Err(e) => report_failure(PUBLISH, &node, &e),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AttributeFilter, Attributes};
    use crate::neighborhood::mock::MockNeighborhood;

    fn temp() -> AttributeFilter {
        AttributeFilter::new().equals("type", "temp")
    }

    struct Fixture {
        nb: MockNeighborhood,
        table: SubscriptionTable<AttributeFilter>,
        a: NodeDescriptor,
        b: NodeDescriptor,
        c: NodeDescriptor,
        client: NodeDescriptor,
    }

    fn fixture() -> Fixture {
        let nb = MockNeighborhood::new(NodeDescriptor::broker());
        let (a, b, c) = (
            NodeDescriptor::broker(),
            NodeDescriptor::broker(),
            NodeDescriptor::broker(),
        );
        let client = NodeDescriptor::client();
        nb.set_neighbors(vec![a.clone(), b.clone(), c.clone(), client.clone()]);
        Fixture {
            nb,
            table: SubscriptionTable::new(),
            a,
            b,
            c,
            client,
        }
    }

    fn sorted(mut v: Vec<NodeDescriptor>) -> Vec<NodeDescriptor> {
        v.sort();
        v
    }

    #[test]
    fn first_subscription_reaches_every_other_broker() {
        let mut fx = fixture();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.client, &temp());
        assert_eq!(
            sorted(fx.nb.recipients(SUBSCRIBE)),
            sorted(vec![fx.a.clone(), fx.b.clone(), fx.c.clone()])
        );
        assert!(fx.table.is_subscribed(&fx.client, &temp()));
    }

    #[test]
    fn first_subscription_skips_subscriber() {
        let mut fx = fixture();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.b, &temp());
        assert_eq!(
            sorted(fx.nb.recipients(SUBSCRIBE)),
            sorted(vec![fx.a.clone(), fx.c.clone()])
        );
    }

    #[test]
    fn second_holder_only_notifies_the_single_broker() {
        let mut fx = fixture();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.a, &temp());
        fx.nb.clear_sent();

        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.b, &temp());
        assert_eq!(fx.nb.recipients(SUBSCRIBE), vec![fx.a.clone()]);

        // Two brokers now hold it: a third holder is absorbed silently.
        fx.nb.clear_sent();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.c, &temp());
        assert!(fx.nb.recipients(SUBSCRIBE).is_empty());
    }

    #[test]
    fn repeated_subscribe_is_a_noop() {
        let mut fx = fixture();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.a, &temp());
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.a, &temp());
        assert_eq!(fx.nb.recipients(SUBSCRIBE).len(), 2);
        assert_eq!(fx.table.len(), 1);
    }

    #[test]
    fn subscribe_from_stranger_is_ignored() {
        let mut fx = fixture();
        let stranger = NodeDescriptor::broker();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &stranger, &temp());
        assert!(fx.table.is_empty());
        assert!(fx.nb.sent().is_empty());
    }

    #[test]
    fn last_unsubscribe_reaches_every_other_broker() {
        let mut fx = fixture();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.client, &temp());
        fx.nb.clear_sent();

        SubscriptionForwarding.unsubscribe(&mut fx.table, &fx.nb, &fx.client, &temp());
        assert_eq!(fx.nb.recipients(UNSUBSCRIBE).len(), 3);
        assert!(!fx.table.is_filter_in_table(&temp()));
    }

    #[test]
    fn unsubscribe_leaving_one_broker_tells_only_that_broker() {
        let mut fx = fixture();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.a, &temp());
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.b, &temp());
        fx.nb.clear_sent();

        SubscriptionForwarding.unsubscribe(&mut fx.table, &fx.nb, &fx.b, &temp());
        assert_eq!(fx.nb.recipients(UNSUBSCRIBE), vec![fx.a.clone()]);
    }

    #[test]
    fn unsubscribe_of_unknown_pair_sends_nothing() {
        let mut fx = fixture();
        SubscriptionForwarding.unsubscribe(&mut fx.table, &fx.nb, &fx.a, &temp());
        assert!(fx.nb.sent().is_empty());
    }

    #[test]
    fn unsubscribe_all_drops_every_filter() {
        let mut fx = fixture();
        let humidity = AttributeFilter::new().equals("type", "humidity");
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.client, &temp());
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.client, &humidity);
        fx.nb.clear_sent();

        SubscriptionForwarding.unsubscribe_all(&mut fx.table, &fx.nb, &fx.client);
        assert!(fx.table.is_empty());
        assert_eq!(fx.nb.recipients(UNSUBSCRIBE).len(), 6);
    }

    #[test]
    fn publish_counts_successful_sends_and_skips_source() {
        let mut fx = fixture();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.a, &temp());
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.client, &temp());
        let msg = Message::new(Attributes::new().with("type", "temp"));

        let n = SubscriptionForwarding.publish(&fx.table, &fx.nb, Some(&fx.a), &msg);
        assert_eq!(n, 1);
        assert_eq!(fx.nb.recipients(PUBLISH), vec![fx.client.clone()]);

        fx.nb.remove_neighbor(&fx.client);
        let n = SubscriptionForwarding.publish(&fx.table, &fx.nb, None, &msg);
        assert_eq!(n, 1);
    }

    #[test]
    fn publish_without_match_sends_nothing() {
        let mut fx = fixture();
        SubscriptionForwarding.subscribe(&mut fx.table, &fx.nb, &fx.a, &temp());
        let msg = Message::new(Attributes::new().with("type", "wind"));
        assert_eq!(
            SubscriptionForwarding.publish(&fx.table, &fx.nb, None, &msg),
            0
        );
    }

    #[test]
    fn only_departed_neighbors_are_quiet_failures() {
        let gone = BrokerError::NotConnected {
            neighbor: "Broker:x".into(),
        };
        assert_eq!(failure_level(&gone), Level::DEBUG);

        let broken = BrokerError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(failure_level(&broken), Level::WARN);
        let too_large = BrokerError::MessageTooLarge { size: 2, max: 1 };
        assert_eq!(failure_level(&too_large), Level::WARN);
    }
}

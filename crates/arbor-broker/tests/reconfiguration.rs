//! Integration tests: repairing the overlay after a broker link fails.

use std::time::Duration;

use arbor_broker::reconfig::DEFERRED_FLUSH;
use arbor_broker::router::FILTER_CLASS;
use arbor_broker::{
    AttributeFilter, Attributes, Broker, BrokerConfig, BrokerError, Client, ClientConfig,
    LinkSubstitution, Reconfiguration, ReconfigurationConfig, ReconfigurationId,
    ReconfigurationInfo, TcpTransportConfig,
};

fn temp() -> AttributeFilter {
    AttributeFilter::new().equals("type", "temp")
}

fn humidity() -> AttributeFilter {
    AttributeFilter::new().equals("type", "humidity")
}

async fn eventually(what: &str, within: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + within;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn broker(reconfiguration: ReconfigurationConfig) -> Broker {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
    Broker::start(BrokerConfig::new().reconfiguration(reconfiguration))
        .await
        .unwrap()
}

async fn client_of(broker: &Broker) -> Client {
    let client = Client::start(ClientConfig::new()).await.unwrap();
    client.connect(&broker.url().unwrap()).await.unwrap();
    client
}

fn deferred(notified: bool, defer_timeout: Duration) -> ReconfigurationConfig {
    ReconfigurationConfig::DeferredUnsubscription {
        notified,
        defer_timeout,
    }
}

const SHORT: Duration = Duration::from_secs(5);

// ── Deferred unsubscription ────────────────────────────────────────────

/// subscriber ── A ── B ── C, with C learning `temp` through B.
struct Line {
    a: Broker,
    b: Broker,
    c: Broker,
    subscriber: Client,
}

async fn line(config: ReconfigurationConfig) -> Line {
    let a = broker(config.clone()).await;
    let b = broker(config.clone()).await;
    let c = broker(config).await;
    b.add_neighbor(&a.url().unwrap()).await.unwrap();
    b.add_neighbor(&c.url().unwrap()).await.unwrap();

    let subscriber = client_of(&a).await;
    subscriber.subscribe(&temp()).unwrap();
    eventually("C to learn temp", SHORT, || {
        c.router().is_subscribed(b.descriptor(), &temp())
    })
    .await;
    Line { a, b, c, subscriber }
}

#[tokio::test]
async fn timed_deferral_unsubscribes_after_timeout() {
    let net = line(deferred(false, Duration::from_millis(500))).await;

    net.b.sever_link(net.a.descriptor());
    eventually("B to forget A's filters", SHORT, || {
        net.b.router().filters_of(net.a.descriptor()).is_empty()
    })
    .await;
    // Still routed through B until the deferral ends.
    assert!(net.c.router().is_subscribed(net.b.descriptor(), &temp()));

    eventually("C to drop temp", SHORT, || {
        !net.c.router().is_subscribed(net.b.descriptor(), &temp())
    })
    .await;
    assert_eq!(net.b.reconfigurator().pending_episodes(), 0);
}

#[tokio::test]
async fn quick_reconnection_avoids_unsubscription() {
    let net = line(deferred(false, Duration::from_secs(1))).await;

    net.b.sever_link(net.a.descriptor());
    eventually("B to open an episode", SHORT, || {
        net.b.reconfigurator().pending_episodes() == 1
    })
    .await;
    net.a.add_neighbor(&net.b.url().unwrap()).await.unwrap();
    eventually("A to subscribe B again", SHORT, || {
        net.b.router().is_subscribed(net.a.descriptor(), &temp())
    })
    .await;

    eventually("the episode to end", SHORT, || {
        net.b.reconfigurator().pending_episodes() == 0
    })
    .await;
    assert!(net.c.router().is_subscribed(net.b.descriptor(), &temp()));

    let publisher = client_of(&net.c).await;
    publisher
        .publish(Attributes::new().with("type", "temp").with("value", 18i64))
        .unwrap();
    assert!(net
        .subscriber
        .next_message_timeout(SHORT)
        .await
        .is_some());
}

#[tokio::test]
async fn flush_ends_a_notified_episode_early() {
    let net = line(deferred(true, Duration::from_secs(60))).await;

    let id = ReconfigurationId::random();
    net.b
        .set_reconfiguration_hint(net.a.descriptor(), ReconfigurationInfo::Flush(id));
    net.b.sever_link(net.a.descriptor());
    eventually("B to open an episode", SHORT, || {
        net.b.reconfigurator().pending_episodes() == 1
    })
    .await;

    net.a
        .add_neighbor_with_reconfiguration(&net.b.url().unwrap(), id)
        .await
        .unwrap();
    eventually("FLUSH to end the episode", SHORT, || {
        net.b.reconfigurator().pending_episodes() == 0
    })
    .await;
    assert!(net.b.router().is_subscribed(net.a.descriptor(), &temp()));
    assert!(net.c.router().is_subscribed(net.b.descriptor(), &temp()));
}

// ── Informed link activation ───────────────────────────────────────────

fn informed(subscription_timeout: Duration, unsubscription_timeout: Duration) -> ReconfigurationConfig {
    ReconfigurationConfig::InformedLinkActivation {
        subscription_timeout,
        unsubscription_timeout,
        ack_timeout: Duration::from_millis(500),
        max_attempts: 5,
        dedup_capacity: 100,
    }
}

fn parked(broker: &Broker) -> usize {
    match broker.reconfiguration() {
        Reconfiguration::Informed(ila) => ila.parked_activations(),
        Reconfiguration::Deferred(_) => 0,
    }
}

/// ```text
///   cS ── S ── X ── D ── O ── cO
///              ╰─ replaced by S ── O when D dies ─╯
/// ```
#[tokio::test]
async fn replacement_link_is_activated_out_of_band() {
    let config = informed(Duration::from_millis(500), Duration::from_secs(60));
    let s = broker(config.clone()).await;
    let x = broker(config.clone()).await;
    let d = broker(config.clone()).await;
    let o = broker(config).await;
    x.add_neighbor(&s.url().unwrap()).await.unwrap();
    x.add_neighbor(&d.url().unwrap()).await.unwrap();
    o.add_neighbor(&d.url().unwrap()).await.unwrap();

    let c_s = client_of(&s).await;
    let c_o = client_of(&o).await;
    c_s.subscribe(&temp()).unwrap();
    c_o.subscribe(&humidity()).unwrap();
    eventually("subscriptions to cross the overlay", SHORT, || {
        o.router().is_subscribed(d.descriptor(), &temp())
            && s.router().is_subscribed(x.descriptor(), &humidity())
    })
    .await;

    let id = ReconfigurationId::random();
    x.set_reconfiguration_hint(
        d.descriptor(),
        ReconfigurationInfo::Substitution(LinkSubstitution {
            same_subtree_broker: s.descriptor().clone(),
            other_subtree_broker: o.descriptor().clone(),
            id,
        }),
    );
    o.set_reconfiguration_hint(
        d.descriptor(),
        ReconfigurationInfo::Substitution(LinkSubstitution {
            same_subtree_broker: o.descriptor().clone(),
            other_subtree_broker: s.descriptor().clone(),
            id,
        }),
    );
    d.kill().await;

    eventually("both endpoints to hold an ACTIVATE", SHORT, || {
        parked(&s) == 1 && parked(&o) == 1
    })
    .await;
    assert_eq!(x.reconfigurator().pending_episodes(), 1);
    assert_eq!(o.reconfigurator().pending_episodes(), 1);

    s.add_neighbor(&o.url().unwrap()).await.unwrap();

    // FLUSH from the far end reaches X through S, long before its timeout.
    eventually("every episode to end", SHORT, || {
        x.reconfigurator().pending_episodes() == 0 && o.reconfigurator().pending_episodes() == 0
    })
    .await;
    assert_eq!(parked(&s), 0);
    assert_eq!(parked(&o), 0);
    eventually("the new link to carry both filters", SHORT, || {
        o.router().is_subscribed(s.descriptor(), &temp())
            && s.router().is_subscribed(o.descriptor(), &humidity())
    })
    .await;

    c_o.publish(Attributes::new().with("type", "temp").with("value", 7i64))
        .unwrap();
    assert!(c_s.next_message_timeout(SHORT).await.is_some());
    c_s.publish(Attributes::new().with("type", "humidity").with("value", 60i64))
        .unwrap();
    assert!(c_o.next_message_timeout(SHORT).await.is_some());
}

#[tokio::test]
async fn failure_without_substitution_unsubscribes_at_once() {
    let config = informed(Duration::from_millis(500), Duration::from_secs(60));
    let net = line(config).await;

    net.b.sever_link(net.a.descriptor());
    eventually("C to drop temp", SHORT, || {
        !net.c.router().is_subscribed(net.b.descriptor(), &temp())
    })
    .await;
    assert_eq!(net.b.reconfigurator().pending_episodes(), 0);
}

#[tokio::test]
async fn only_notified_mode_listens_for_flush() {
    let timed = broker(deferred(false, Duration::from_secs(3))).await;
    let notified = broker(deferred(true, Duration::from_secs(3))).await;

    assert_eq!(timed.overlay().traffic_class_of(DEFERRED_FLUSH), None);
    assert_eq!(
        notified.overlay().traffic_class_of(DEFERRED_FLUSH).as_deref(),
        Some(FILTER_CLASS)
    );
}

#[tokio::test]
async fn datagram_channel_shares_the_listening_port() {
    let b = broker(informed(Duration::from_secs(5), Duration::from_secs(3))).await;
    let Reconfiguration::Informed(ila) = b.reconfiguration() else {
        panic!("informed broker expected");
    };
    let url = b.url().unwrap();
    let port = url.rsplit(':').next().unwrap();
    assert_eq!(ila.oob().local_addr().port().to_string(), port);
    assert!(b.overlay().is_running());
}

#[tokio::test]
async fn informed_mode_needs_a_listening_transport() {
    let config = BrokerConfig::new()
        .transport(TcpTransportConfig::outbound_only())
        .reconfiguration(informed(Duration::from_secs(5), Duration::from_secs(3)));
    let result = Broker::<AttributeFilter>::start(config).await;
    assert!(matches!(result, Err(BrokerError::Config(_))));
}

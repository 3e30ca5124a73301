use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use arbor_broker::{Attributes, Client, ClientConfig};

use crate::common::{parse_attributes, parse_filter, setup_ctrlc};
use crate::events::{attributes_json, emit, now_ms, EventMessage, EventStarted, EventStopped, EventSubscribed};

pub struct SubscribeConfig {
    pub broker: String,
    pub filter: Vec<String>,
    /// Stop after this many messages.
    pub count: Option<u64>,
    /// Answer repliable messages with these attributes.
    pub reply: Option<Vec<String>>,
}

pub async fn run(config: SubscribeConfig, start: Instant) -> anyhow::Result<()> {
    let filter = parse_filter(&config.filter)?;
    let answer: Option<Attributes> = config.reply.as_deref().map(parse_attributes).transpose()?;

    let client: Client = Client::start(ClientConfig::new()).await?;
    let id = client.descriptor().id().to_string();
    emit(&EventStarted::new(&id, "subscribe", None));

    let broker = client.connect(&config.broker).await?;
    client.subscribe(&filter)?;
    emit(&EventSubscribed {
        event: "subscribed",
        broker: broker.to_string(),
        filter: filter.to_string(),
    });

    let running = setup_ctrlc();
    let mut received: u64 = 0;
    while running.load(Ordering::Relaxed) && client.is_connected() {
        // Short timeout so the running flag is checked
        let Some(message) = client.next_message_timeout(Duration::from_millis(500)).await else {
            continue;
        };
        received += 1;
        emit(&EventMessage {
            event: "message",
            id: message.id().to_string(),
            origin: message.origin().map(|o| o.to_string()),
            repliable: message.is_repliable(),
            content: attributes_json(message.content()),
            ts: now_ms(),
        });

        if let (true, Some(answer)) = (message.is_repliable(), &answer) {
            if let Err(e) = client.reply(answer.clone(), &message) {
                eprintln!("reply to {} failed: {e}", message.id());
            }
        }
        if config.count.is_some_and(|n| received >= n) {
            break;
        }
    }

    if !client.is_connected() {
        eprintln!("broker connection lost");
    }
    client.shutdown().await;
    emit(&EventStopped {
        event: "stopped",
        id,
        elapsed_s: start.elapsed().as_secs_f64(),
    });
    Ok(())
}

use std::time::{Duration, Instant};

use arbor_broker::{Client, ClientConfig};

use crate::common::parse_attributes;
use crate::events::{attributes_json, emit, now_ms, EventPublished, EventReplies, EventStarted};

pub struct PublishConfig {
    pub broker: String,
    pub content: Vec<String>,
    pub repliable: bool,
    pub reply_timeout: Duration,
}

pub async fn run(config: PublishConfig) -> anyhow::Result<()> {
    let content = parse_attributes(&config.content)?;

    let client: Client =
        Client::start(ClientConfig::new().reply_timeout(config.reply_timeout)).await?;
    emit(&EventStarted::new(
        &client.descriptor().id().to_string(),
        "publish",
        None,
    ));
    client.connect(&config.broker).await?;

    let sent_at = Instant::now();
    let id = if config.repliable {
        client.publish_repliable(content.clone())?
    } else {
        client.publish(content.clone())?
    };
    emit(&EventPublished {
        event: "published",
        id: id.to_string(),
        repliable: config.repliable,
        content: attributes_json(&content),
        ts: now_ms(),
    });

    if config.repliable {
        let replies = client.all_replies(id).await;
        emit(&EventReplies {
            event: "replies",
            id: id.to_string(),
            complete: replies.complete,
            replies: replies.replies.iter().map(attributes_json).collect(),
            elapsed_ms: sent_at.elapsed().as_secs_f64() * 1000.0,
        });
    } else {
        // Let the broker drain the link before it closes.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    client.shutdown().await;
    Ok(())
}

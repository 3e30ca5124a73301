mod broker;
mod common;
mod events;
mod publish;
mod subscribe;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use arbor_broker::ReconfigurationConfig;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "arbor-node", about = "Run an Arbor broker, subscriber or publisher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Reconfiguration {
    /// Timed deferred unsubscription.
    Deferred,
    /// Deferred unsubscription ended early by FLUSH.
    Notified,
    /// Informed link activation over UDP.
    Informed,
}

impl From<Reconfiguration> for ReconfigurationConfig {
    fn from(mode: Reconfiguration) -> Self {
        match mode {
            Reconfiguration::Deferred => ReconfigurationConfig::deferred(),
            Reconfiguration::Notified => ReconfigurationConfig::notified(),
            Reconfiguration::Informed => ReconfigurationConfig::informed(),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run a broker until Ctrl+C.
    Broker {
        /// Address to accept neighbors and clients on.
        #[arg(long, default_value = "127.0.0.1:0")]
        listen: SocketAddr,
        /// Neighbor broker URL (repeatable), e.g. arbor-tcp:127.0.0.1:1911.
        #[arg(long)]
        connect: Vec<String>,
        /// Protocol repairing subscriptions after a link failure.
        #[arg(long, value_enum, default_value = "deferred")]
        reconfiguration: Reconfiguration,
    },

    /// Subscribe through a broker and print matching messages.
    Subscribe {
        /// Broker URL.
        #[arg(long)]
        broker: String,
        /// Filter constraint key=value (repeatable).
        #[arg(long = "where", required = true)]
        filter: Vec<String>,
        /// Exit after this many messages.
        #[arg(long)]
        count: Option<u64>,
        /// Answer repliable messages with these key=value attributes.
        #[arg(long, value_delimiter = ',')]
        reply: Option<Vec<String>>,
    },

    /// Publish one message through a broker.
    Publish {
        /// Broker URL.
        #[arg(long)]
        broker: String,
        /// Message attribute key=value (repeatable).
        #[arg(long = "set", required = true)]
        content: Vec<String>,
        /// Wait for replies from subscribers.
        #[arg(long)]
        repliable: bool,
        /// How long to wait for replies, in ms.
        #[arg(long, default_value = "30000")]
        reply_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();
    eprintln!("arbor-node v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Broker {
            listen,
            connect,
            reconfiguration,
        } => {
            broker::run(
                broker::BrokerArgs {
                    listen,
                    connect,
                    reconfiguration: reconfiguration.into(),
                },
                start,
            )
            .await?;
        }

        Command::Subscribe {
            broker,
            filter,
            count,
            reply,
        } => {
            subscribe::run(
                subscribe::SubscribeConfig {
                    broker,
                    filter,
                    count,
                    reply,
                },
                start,
            )
            .await?;
        }

        Command::Publish {
            broker,
            content,
            repliable,
            reply_timeout,
        } => {
            publish::run(
                publish::PublishConfig {
                    broker,
                    content,
                    repliable,
                    reply_timeout: Duration::from_millis(reply_timeout),
                },
            )
            .await?;
        }
    }

    Ok(())
}

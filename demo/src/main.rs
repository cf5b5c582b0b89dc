//! ActiveWire failover demo
//!
//! Streams messages through a transport built from a URI. With the default
//! `mock://` brokers and `--kill-primary-after`, the primary goes down
//! part-way through and the log shows the failover transport moving to the
//! secondary and replaying the session state.
//!
//! ```text
//! activewire-demo --count 20 --kill-primary-after 5 -v
//! activewire-demo --uri 'failover:(tcp://localhost:61616,tcp://localhost:61617)?maxReconnectAttempts=10'
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use activewire_failover::{FailoverTransport, FailoverTransportFactory};
use activewire_mock::{MockNetwork, MockTransportFactory};
use activewire_tcp::TcpTransportFactory;
use activewire_transport_traits::{
    Command, CommandIdGenerator, CommandKind, Transport, TransportError, TransportListener,
    TransportRegistry,
};

const DEFAULT_URI: &str =
    "failover:(mock://primary,mock://secondary)?startupSync=true&initialReconnectDelay=50";

#[derive(Parser, Debug)]
#[command(
    name = "activewire-demo",
    version,
    about = "Send commands through an ActiveWire transport and watch it fail over"
)]
struct Cli {
    /// Transport URI (failover:, tcp:// or mock://)
    #[arg(long, env = "ACTIVEWIRE_URI", default_value = DEFAULT_URI)]
    uri: String,

    /// Number of messages to send
    #[arg(long, short = 'n', default_value_t = 10)]
    count: u32,

    /// Pause between messages, in milliseconds
    #[arg(long, default_value_t = 200)]
    interval_ms: u64,

    /// Send each message as a request and wait for its response
    #[arg(long)]
    request: bool,

    /// Break the mock broker `primary` after this many messages
    #[arg(long)]
    kill_primary_after: Option<u32>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn init_tracing(&self) {
        let default = match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

        if self.json {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }
}

struct LoggingListener;

impl TransportListener for LoggingListener {
    fn on_command(&self, command: Command) {
        info!("<- {}", command);
    }

    fn on_exception(&self, error: TransportError) {
        warn!("transport failed: {}", error);
    }

    fn transport_interrupted(&self) {
        warn!("connection interrupted, reconnecting");
    }

    fn transport_resumed(&self) {
        info!("connection resumed");
    }
}

fn build_registry(network: &Arc<MockNetwork>) -> TransportRegistry {
    let children = Arc::new(
        TransportRegistry::new()
            .with_factory(Arc::new(MockTransportFactory::new(Arc::clone(network))))
            .with_factory(Arc::new(TcpTransportFactory::new())),
    );
    TransportRegistry::new()
        .with_factory(Arc::new(MockTransportFactory::new(Arc::clone(network))))
        .with_factory(Arc::new(TcpTransportFactory::new()))
        .with_factory(Arc::new(FailoverTransportFactory::new(children)))
}

fn session_commands(ids: &CommandIdGenerator) -> Vec<Command> {
    vec![
        Command::new(
            ids.next_id(),
            CommandKind::ConnectionInfo {
                connection_id: "demo-connection".into(),
            },
        )
        .with_response_required(),
        Command::new(
            ids.next_id(),
            CommandKind::SessionInfo {
                session_id: "demo-session".into(),
            },
        ),
        Command::new(
            ids.next_id(),
            CommandKind::ProducerInfo {
                producer_id: "demo-producer".into(),
                session_id: "demo-session".into(),
                destination: Some("queue://demo".into()),
            },
        ),
    ]
}

async fn run(
    cli: &Cli,
    transport: Arc<dyn Transport>,
    network: &MockNetwork,
) -> Result<(), TransportError> {
    let ids = CommandIdGenerator::new();
    for command in session_commands(&ids) {
        info!("-> {}", command);
        transport.oneway(command).await?;
    }

    for n in 1..=cli.count {
        if cli.kill_primary_after == Some(n - 1) {
            warn!("taking mock broker 'primary' down");
            network.set_available("primary", false);
            network.fail_connections("primary");
        }

        let command = Command::new(
            ids.next_id(),
            CommandKind::Message {
                producer_id: "demo-producer".into(),
                destination: "queue://demo".into(),
                message_id: format!("demo-{n}"),
            },
        )
        .with_payload(format!("message {n} of {}", cli.count));

        info!("-> {}", command);
        if cli.request {
            let response = transport
                .request(command, Some(Duration::from_secs(10)))
                .await?;
            info!("<- {}", response);
        } else {
            transport.oneway(command).await?;
        }
        tokio::time::sleep(Duration::from_millis(cli.interval_ms)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    cli.init_tracing();

    let network = MockNetwork::new();
    let registry = build_registry(&network);
    let uri = Url::parse(&cli.uri)?;
    let transport = registry.create(&uri)?;
    transport.set_listener(Arc::new(LoggingListener));

    info!("Starting transport for {}", uri);
    transport.start().await?;

    tokio::select! {
        result = run(&cli, Arc::clone(&transport), &network) => {
            if let Err(e) = result {
                warn!("demo stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    match transport.as_any().downcast_ref::<FailoverTransport>() {
        Some(failover) => {
            let metrics = failover.failover_metrics();
            info!("failover metrics: {}", serde_json::to_string(&metrics)?);
        }
        None => info!("metrics: {}", serde_json::to_string(&transport.metrics())?),
    }
    if let Some(child) = transport.inner_transport() {
        info!("last child transport: {:?}", child);
    }

    transport.stop().await?;
    Ok(())
}

use std::{path::PathBuf, process::ExitCode, time::Duration};

use cerebrum::{Config, ConnectorCluster, EventType};
use clap::Parser;
use tokio::runtime::Handle;
use tracing::{debug, error, info, Level};

#[derive(Parser, Debug)]
#[command(name = "cerebrum", about = "Runs a cerebrum or synapse node")]
struct Args {
    /// Node configuration (yaml).
    #[arg(short, long)]
    config: PathBuf,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,

    /// Event types to subscribe to on every connector.
    #[arg(short, long, value_delimiter = ',')]
    subscribe: Vec<EventType>,

    /// Seconds between status reports.
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let config = match Config::load_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if args.print_config {
        return match config.to_yaml() {
            Ok(yaml) => {
                print!("{}", yaml);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("failed to render config: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let cluster = match ConnectorCluster::new(&config, Handle::current()) {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("failed to build connectors: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = cluster.start().await {
        error!("failed to start: {}", e);
        cluster.shutdown().await;
        return ExitCode::FAILURE;
    }
    info!(node = config.node.id, role = ?config.node.role, "node started");

    for connector in cluster.connectors() {
        for event_type in &args.subscribe {
            if let Err(e) = connector.subscribe(*event_type) {
                error!(port = connector.port(), "failed to subscribe to {}: {}", event_type, e);
            }
        }
        if let Some(mut events) = connector.events() {
            let port = connector.port();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    info!(port, uid = %event.uid, event_type = event.event_type, bytes = event.payload.len(), "event delivered");
                }
            });
        }
    }

    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = status.tick() => {
                for s in cluster.status() {
                    debug!(
                        port = s.port,
                        connections = s.connections.len(),
                        in_flight = s.in_flight,
                        held = s.held,
                        readers_queued = s.readers.queued,
                        writers_queued = s.writers.queued,
                        "status"
                    );
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("failed to listen for ctrl-c: {}", e);
                }
                break;
            }
        }
    }

    info!("shutting down");
    cluster.shutdown().await;
    ExitCode::SUCCESS
}

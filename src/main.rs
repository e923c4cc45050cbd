use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use kinesis_forwarder::client::{StdoutClient, StreamClient};
use kinesis_forwarder::config::{ClientConfig, load_config};
use kinesis_forwarder::emitter::emit_events;
use kinesis_forwarder::sink;
use kinesis_forwarder::writer::BatchingWriter;

#[derive(Debug, Parser)]
#[command(about = "Batch synthetic server events into a stream")]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override how long producers run, in seconds (0 runs forever)
    #[arg(short, long)]
    duration: Option<u64>,
}

fn build_client(cfg: &ClientConfig) -> Arc<dyn StreamClient> {
    match cfg {
        ClientConfig::Stdout {} => Arc::new(StdoutClient),
        #[cfg(feature = "kinesis")]
        ClientConfig::Kinesis(kinesis_cfg) => {
            use kinesis_forwarder::client::kinesis::KinesisClient;
            let client = KinesisClient::from_config(kinesis_cfg.to_owned())
                .expect("Failed to create Kinesis client");
            info!("Kinesis client configured for endpoint '{}'", kinesis_cfg.endpoint);
            Arc::new(client)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(&args.config).expect("Invalid config");
    let run_duration_secs = args.duration.unwrap_or(config.run_duration_secs);
    let duration = Duration::from_secs(run_duration_secs);

    let client = build_client(&config.client);
    let mut writer = match BatchingWriter::new(config.writer.clone(), client) {
        Ok(writer) => writer,
        Err(e) => {
            error!("Invalid writer config: {e}");
            std::process::exit(2);
        }
    };

    info!(
        "Starting forwarder: {} services, stream '{}', threshold={}, {}s duration",
        config.services.len(),
        writer.settings().stream_name,
        writer.settings().threshold,
        run_duration_secs,
    );

    let (tx, rx) = mpsc::channel(config.channel_capacity);
    for service in &config.services {
        let tx = tx.clone();
        let service = service.clone();
        tokio::spawn(async move {
            emit_events(service, tx, duration).await;
        });
    }
    drop(tx);

    sink::run(&mut writer, rx).await;
    writer
        .settle(Duration::from_millis(config.shutdown_grace_ms))
        .await;

    let stats = writer.stats().await;
    info!(
        accepted = stats.records_accepted,
        flushes = stats.flushes,
        failed = stats.failed_flushes,
        retries = stats.retries,
        discarded = stats.records_discarded,
        "Done."
    );
}

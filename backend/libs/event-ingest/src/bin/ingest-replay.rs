use std::env;
use std::sync::Arc;

use event_ingest::{
    init_tracing, Delivery, Event, EventProcessor, IngestConfig, IngestDispatcher, LogFormat,
    NoopEffect, PartitionKey,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Parse `<partition>\t<payload>`, or a bare `<payload>` for the global partition
fn parse_line(line: &str) -> Option<Delivery> {
    if line.trim().is_empty() {
        return None;
    }

    let delivery = match line.split_once('\t') {
        Some((partition, payload)) if !partition.trim().is_empty() => {
            Delivery::new(PartitionKey::new(partition.trim()), Event::new(payload))
        }
        Some((_, payload)) => Delivery::global(Event::new(payload)),
        None => Delivery::global(Event::new(line)),
    };
    Some(delivery)
}

async fn read_deliveries<R>(reader: R) -> std::io::Result<Vec<Delivery>>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut deliveries = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if let Some(delivery) = parse_line(&line) {
            deliveries.push(delivery);
        }
    }
    Ok(deliveries)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        eprintln!("Usage:");
        eprintln!("  ingest-replay [deliveries_file]");
        eprintln!();
        eprintln!("Reads one delivery per line as <partition>\\t<payload> (or <payload>),");
        eprintln!("from the file or stdin. Configuration comes from INGEST_* variables.");
        std::process::exit(1);
    }

    let log_format = match env::var("INGEST_LOG_FORMAT") {
        Ok(value) => value.parse::<LogFormat>()?,
        Err(_) => LogFormat::Pretty,
    };
    init_tracing(log_format)?;

    let config = IngestConfig::from_env()?;

    let deliveries = match args.get(1) {
        Some(path) => read_deliveries(tokio::fs::File::open(path).await?).await?,
        None => read_deliveries(tokio::io::stdin()).await?,
    };

    let labels: Vec<(String, String)> = deliveries
        .iter()
        .map(|d| (d.partition.to_string(), d.event.payload().to_text_lossy()))
        .collect();

    let cleanup_interval = config.cleanup_interval;
    let processor = Arc::new(EventProcessor::new(config, NoopEffect)?);
    let cleanup = processor.spawn_ledger_cleanup(cleanup_interval);
    let dispatcher = IngestDispatcher::new(Arc::clone(&processor));

    let outcomes = dispatcher.run(futures::stream::iter(deliveries)).await?;
    dispatcher.shutdown().await;
    cleanup.abort();

    for ((partition, payload), outcome) in labels.into_iter().zip(outcomes) {
        println!(
            "{}",
            json!({ "partition": partition, "payload": payload, "result": outcome })
        );
    }

    let snapshot = processor.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    Ok(())
}

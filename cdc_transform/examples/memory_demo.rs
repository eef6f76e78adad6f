use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cdc_transform::pipeline::checkpoints::memory::MemoryCheckpointStore;
use cdc_transform::pipeline::dead_letter::MemoryDeadLetter;
use cdc_transform::pipeline::sinks::memory::MemorySink;
use cdc_transform::pipeline::sinks::ndjson;
use cdc_transform::pipeline::sources::MemoryTransport;
use cdc_transform::{DataPipeline, PipelineConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "memory_demo", version, about = "Run the pipeline against in-memory adapters")]
struct AppArgs {
    /// Optional YAML config file; defaults apply when omitted
    #[arg(long)]
    config: Option<String>,

    /// Number of change records to seed per partition
    #[arg(long, default_value_t = 25)]
    records: u64,

    /// Transport partitions to create
    #[arg(long, default_value = "shard-0,shard-1")]
    partitions: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if let Err(e) = main_impl().await {
        error!("{e}");
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memory_demo=info,cdc_transform=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn envelope(seq: u64, id: u64) -> String {
    format!(
        r#"{{"data": {{"id": {id}, "city": "Pune", "updated_at": "2026-02-07 10:00:00"}}, "key": {{"id": {id}}}, "metadata": {{"record-type": "data", "operation": "insert", "timestamp": "2026-02-07T10:00:00Z", "schema-name": "hr", "table-name": "employees", "sequence": {seq}}}}}"#
    )
}

async fn main_impl() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let args = AppArgs::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig {
            max_batch_window_seconds: 2,
            max_batch_event_count: 10,
            ..Default::default()
        },
    };

    let partitions: Vec<&str> = args.partitions.split(',').collect();
    let transport = Arc::new(MemoryTransport::new(&partitions));
    for partition in &partitions {
        for seq in 1..=args.records {
            transport.push(partition, seq, envelope(seq, seq));
        }
    }

    let sink = Arc::new(MemorySink::new());
    let dead_letter = MemoryDeadLetter::new();
    let store = MemoryCheckpointStore::new();

    let mut pipeline = DataPipeline::new(
        transport.clone(),
        sink.clone(),
        dead_letter,
        store,
        config,
    )?;

    let cancel = pipeline.shutdown_token();
    let metrics = pipeline.metrics();
    let running = tokio::spawn(async move { pipeline.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(5)) => info!("demo window elapsed"),
    }

    cancel.cancel();
    running.await??;

    for (key, body) in sink.objects() {
        let rows = ndjson::decode_rows(&body)?;
        info!(key = %key, rows = rows.len(), bytes = body.len(), "wrote object");
    }
    info!(snapshot = ?metrics.snapshot(), "final counters");

    Ok(())
}

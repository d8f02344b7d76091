use anyhow::{Context, Result};
use futures::future::join_all;
use offload::prelude::*;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "offload=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SchedulerConfig::from_env();
    tracing::info!(?config, "offload starting...");

    let scheduler = analytics::register(Scheduler::builder(config), PoolConfig::new()).start();

    let workout = json!({
        "segments": [
            {"duration": 600, "power_start": 0.5, "power_end": 0.65},
            {"duration": 1200, "power_start": 0.9},
            {"duration": 300, "power_start": 0.5},
            {"duration": 1200, "power_start": 0.95},
            {"duration": 600, "power_start": 0.6, "power_end": 0.4}
        ],
        "ftp": 250
    });

    let batch = vec![
        (
            analytics::OP_CALCULATE_TSS,
            workout,
            TaskOptions::new().on_progress(|progress| {
                tracing::debug!(%progress, "TSS progress");
            }),
        ),
        (
            analytics::OP_POWER_ZONES,
            json!({"ftp": 250}),
            TaskOptions::new().with_priority(Priority::High),
        ),
        (
            analytics::OP_SUMMARIZE,
            json!({"values": [182.0, 240.5, 251.0, 199.5, 310.0]}),
            TaskOptions::new().with_priority(Priority::Low),
        ),
    ];

    let handles: Vec<_> = batch
        .into_iter()
        .map(|(operation, payload, options)| {
            let handle = scheduler.submit(analytics::TASK_TYPE, operation, payload, options);
            (operation, handle)
        })
        .collect();

    let operations: Vec<&str> = handles.iter().map(|(op, _)| *op).collect();
    let outcomes = join_all(handles.into_iter().map(|(_, handle)| handle)).await;

    for (operation, outcome) in operations.into_iter().zip(outcomes) {
        let line = match outcome {
            Ok(result) => json!({"operation": operation, "result": result}),
            Err(err) => json!({"operation": operation, "error": err.to_string()}),
        };
        println!("{}", serde_json::to_string(&line).context("encode result")?);
    }

    let statistics = json!({
        "pools": scheduler.pool_statistics().await,
        "units": scheduler.unit_statistics().await,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&statistics).context("encode statistics")?
    );

    scheduler.shutdown().await;
    tracing::info!("offload shutdown complete");
    Ok(())
}

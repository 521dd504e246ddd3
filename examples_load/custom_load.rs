use std::time::Instant;
use tokio::time::Duration;

use tracing_log_dispatch::noop_adapter::NoopAdapter;
use tracing_log_dispatch::{AdapterRegistry, DispatchConfig, Level, LogDispatch, OverloadPolicy};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = AdapterRegistry::builder().register("noop", NoopAdapter).build()?;

    let config = DispatchConfig::default()
        .with_capacity(50_000)
        .with_policy(OverloadPolicy::Block)
        .with_block_timeout(Duration::from_millis(200))
        .with_flush_deadline(Duration::from_secs(2))
        .with_root_level(Level::Info);

    let dispatch = LogDispatch::start(config, registry).await?;
    let logger = dispatch.logger("load::custom");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        logger
            .at(Level::Error)
            .message("custom load test error {}")
            .arg(i)
            .emit_async()
            .await?;
    }

    let elapsed = start.elapsed();
    println!("custom config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    let report = dispatch.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

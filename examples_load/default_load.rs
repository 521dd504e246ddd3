use std::time::Instant;
use tracing::error;

use tracing_log_dispatch::init::init;
use tracing_log_dispatch::noop_adapter::NoopAdapter;
use tracing_log_dispatch::{AdapterRegistry, DispatchConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = AdapterRegistry::builder().register("noop", NoopAdapter).build()?;
    let dispatch = init(DispatchConfig::default(), registry, false).await?;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!("default config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    let report = dispatch.shutdown().await;
    println!(
        "enqueued {}, dropped {}, dispatched {}, discarded {}",
        report.stats.queue.enqueued, report.stats.queue.dropped, report.stats.dispatch.dispatched, report.discarded
    );
    Ok(())
}

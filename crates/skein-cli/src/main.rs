use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skein_core::app::{DomainStatus, RunSummary, connect_state_store};
use skein_core::domain::{PartitionKey, TaskFailure, TaskPayload};
use skein_core::impls::InMemoryBacklog;
use skein_core::ports::{Clock, SystemClock, TaskBody};
use skein_core::{EngineConfig, SchedulerBuilder};

const DEMO_TARGETS: &[&str] = &[
    "https://shop.example/products/1",
    "https://shop.example/products/2",
    "https://shop.example/products/3",
    "https://slow.example/item?id=10",
    "https://slow.example/item?id=11",
    "https://market.example:8443/p/a",
    "https://market.example:8443/p/b",
];

/// Run the scheduler against a simulated task body.
#[derive(Debug, Parser)]
#[command(name = "skein", version, about)]
struct Args {
    /// Config file (json / toml / yaml). `SKEIN__*` env vars override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Targets to enqueue. A built-in demo set is used when empty.
    targets: Vec<String>,

    /// Read additional targets from a file, one per line.
    #[arg(long)]
    targets_file: Option<PathBuf>,

    /// Override `max_concurrency`.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Probability that a simulated attempt fails.
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,

    /// Simulated latency per attempt.
    #[arg(long, default_value_t = 200)]
    latency_ms: u64,

    /// Print the final report as JSON.
    #[arg(long)]
    json: bool,
}

/// Stand-in for the browser layer: sleeps, then succeeds or fails at random.
struct SimulatedBody {
    failure_rate: f64,
    latency: Duration,
}

#[async_trait]
impl TaskBody for SimulatedBody {
    async fn execute(&self, target: &str) -> Result<TaskPayload, TaskFailure> {
        // thread_rng is !Send; roll before the first await
        let (roll, status, price) = {
            let mut rng = rand::thread_rng();
            let status = [503_u16, 429, 403, 404, 500][rng.gen_range(0..5)];
            (rng.gen_bool(self.failure_rate), status, rng.gen_range(100..10_000))
        };

        tokio::time::sleep(self.latency).await;

        if roll {
            return Err(TaskFailure::from_status(status, format!("simulated {status}")));
        }
        Ok(serde_json::json!({ "target": target, "price": price }))
    }
}

#[derive(Serialize)]
struct Report {
    summary: RunSummary,
    domains: Vec<DomainStatus>,
}

async fn read_targets(args: &Args) -> anyhow::Result<Vec<String>> {
    let mut targets = args.targets.clone();
    if let Some(path) = &args.targets_file {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        targets.extend(
            raw.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    if targets.is_empty() {
        targets = DEMO_TARGETS.iter().map(|t| t.to_string()).collect();
    }
    Ok(targets)
}

async fn wait_until_settled(backlog: &InMemoryBacklog) {
    while !backlog.is_settled().await {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.failure_rate),
        "--failure-rate must be within 0..=1"
    );

    let mut cfg = EngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(n) = args.concurrency {
        cfg.max_concurrency = n;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backlog = Arc::new(InMemoryBacklog::new(Arc::clone(&clock)));
    let targets = read_targets(&args).await?;
    for target in &targets {
        backlog.add(target.as_str(), 5).await;
    }
    info!(tasks = targets.len(), "backlog seeded");

    let store = connect_state_store(&cfg.store, Arc::clone(&clock)).await?;
    let body = SimulatedBody {
        failure_rate: args.failure_rate,
        latency: Duration::from_millis(args.latency_ms),
    };
    let scheduler = Arc::new(
        SchedulerBuilder::new(cfg)
            .backlog(backlog.clone())
            .task_body(Arc::new(body))
            .state_store(store)
            .clock(clock)
            .build()?,
    );

    let handle = Arc::clone(&scheduler).spawn();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for ctrl-c")?;
            info!("ctrl-c received, shutting down");
        }
        _ = wait_until_settled(&backlog) => info!("backlog settled"),
    }
    let summary = handle.shutdown_and_join().await?;

    let keys: BTreeSet<PartitionKey> = targets.iter().map(|t| PartitionKey::from_target(t)).collect();
    let mut domains = Vec::with_capacity(keys.len());
    for key in &keys {
        domains.push(scheduler.domain_status(key).await?);
    }

    if args.json {
        let report = Report { summary, domains };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "admitted={} succeeded={} failed={} rejected={} aborted={}",
        summary.admitted, summary.succeeded, summary.failed, summary.rejected, summary.aborted
    );
    for d in &domains {
        let avg = d
            .throttle
            .avg_response_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{ms:.0}ms"));
        println!(
            "{:<28} circuit={:<9} failures={:<3} delay={:.1}s streak={} avg={}",
            d.key.as_str(),
            d.circuit.state.as_str(),
            d.circuit.failures,
            d.throttle.delay_secs,
            d.throttle.success_streak,
            avg,
        );
    }
    Ok(())
}

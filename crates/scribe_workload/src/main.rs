//! Workload generator for exercising the scatter-gather dispatcher.
//!
//! This binary fans ping commands out to a simulated cluster of flaky
//! shards, drives many dispatchers concurrently, and prints a JSON summary
//! of per-round latencies, retries, and failure codes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::time;

use scribe_scatter::scatter::{
    Document, ErrorCode, HostAndPort, NetworkLink, OperationContext, ReadMode, ReadPreference,
    RemoteCommandRequest, ReplicaSetTargeter, Request, Response, RetryPolicy, ScatterGather,
    Shard, ShardId, ShardRegistry, ShardTargeter, Status, TaskExecutor, TokioExecutor,
};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "scribe-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of simulated shards.
    #[arg(long, default_value_t = 4)]
    shards: usize,

    /// Secondaries per simulated shard.
    #[arg(long, default_value_t = 2)]
    secondaries: usize,

    /// Concurrent drivers, each fanning out to every shard per round.
    #[arg(long, default_value_t = 8)]
    drivers: usize,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Percent of commands that fail with a transient network error.
    #[arg(long, default_value_t = 10)]
    network_error_pct: u8,

    /// Percent of commands answered with an embedded not-primary error.
    #[arg(long, default_value_t = 2)]
    not_primary_pct: u8,

    /// Mean simulated round-trip per command.
    #[arg(long, default_value = "2ms")]
    latency: humantime::Duration,

    /// Per-command timeout enforced by the executor.
    #[arg(long, default_value = "1s")]
    command_timeout: humantime::Duration,

    /// Interval at which the simulated topology monitor restores each
    /// shard's member view (re-promoting demoted primaries).
    #[arg(long, default_value = "250ms")]
    topology_refresh: humantime::Duration,

    /// Read preference mode for the fan-outs.
    #[arg(long, value_enum, default_value = "primary")]
    read_mode: ReadModeArg,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ReadModeArg {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl From<ReadModeArg> for ReadMode {
    fn from(mode: ReadModeArg) -> Self {
        match mode {
            ReadModeArg::Primary => ReadMode::Primary,
            ReadModeArg::PrimaryPreferred => ReadMode::PrimaryPreferred,
            ReadModeArg::Secondary => ReadMode::Secondary,
            ReadModeArg::SecondaryPreferred => ReadMode::SecondaryPreferred,
            ReadModeArg::Nearest => ReadMode::Nearest,
        }
    }
}

/// Simulated cluster link with seeded failure injection.
struct SimLink {
    rng: Mutex<SmallRng>,
    latency: Duration,
    network_error_pct: u8,
    not_primary_pct: u8,
    commands: AtomicU64,
}

#[async_trait]
impl NetworkLink for SimLink {
    async fn run_command(&self, request: RemoteCommandRequest) -> Result<Document, Status> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        let (delay, roll) = {
            let mut rng = self.rng.lock().unwrap();
            let jitter = rng.gen_range(0.5..1.5);
            (self.latency.mul_f64(jitter), rng.gen_range(0u8..100))
        };
        time::sleep(delay).await;

        if roll < self.network_error_pct {
            return Err(Status::new(
                ErrorCode::HostUnreachable,
                format!("{} dropped the connection", request.host),
            ));
        }
        if roll < self.network_error_pct.saturating_add(self.not_primary_pct) {
            return Ok(json!({
                "ok": 0,
                "codeName": "NotWritablePrimary",
                "errmsg": "node is not a writable primary",
            }));
        }
        Ok(json!({"ok": 1, "host": request.host.to_string()}))
    }
}

/// Per-driver tallies merged into the final summary.
#[derive(Default)]
struct DriverStats {
    rounds: u64,
    successes: u64,
    failures_by_code: BTreeMap<String, u64>,
    round_us: Vec<u64>,
}

/// Machine-readable workload summary.
#[derive(serde::Serialize, Debug)]
struct Summary {
    shards: usize,
    drivers: usize,
    duration_ms: u64,
    seed: u64,
    rounds: u64,
    responses: u64,
    successes: u64,
    failures_by_code: BTreeMap<String, u64>,
    commands_sent: u64,
    round_latency_us: LatencySummary,
}

#[derive(serde::Serialize, Debug)]
struct LatencySummary {
    min: u64,
    mean: u64,
    max: u64,
}

#[tokio::main]
/// Parse CLI args and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        // Run the workload generator.
        Command::Run(args) => run(args).await,
    }
}

/// Run the workload and print a JSON summary.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.shards > 0, "--shards must be > 0");
    anyhow::ensure!(args.drivers > 0, "--drivers must be > 0");
    anyhow::ensure!(
        args.network_error_pct.saturating_add(args.not_primary_pct) <= 100,
        "failure percentages must not exceed 100"
    );

    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let link = Arc::new(SimLink {
        rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        latency: args.latency.into(),
        network_error_pct: args.network_error_pct,
        not_primary_pct: args.not_primary_pct,
        commands: AtomicU64::new(0),
    });
    let executor = Arc::new(
        TokioExecutor::new(Arc::clone(&link) as Arc<dyn NetworkLink>)
            .with_default_timeout(args.command_timeout.into()),
    );

    let registry = Arc::new(ShardRegistry::new());
    let mut topology = Vec::with_capacity(args.shards);
    for index in 0..args.shards {
        let primary = HostAndPort::new(format!("rs{index}-0.scribe.local"), 27017);
        let secondaries: Vec<_> = (1..=args.secondaries)
            .map(|member| HostAndPort::new(format!("rs{index}-{member}.scribe.local"), 27017))
            .collect();
        let targeter = Arc::new(ReplicaSetTargeter::new(primary.clone(), secondaries.clone()));
        registry.register(Arc::new(Shard::new(
            ShardId::new(format!("rs{index}")),
            Arc::clone(&targeter) as Arc<dyn ShardTargeter>,
        )));
        topology.push((targeter, primary, secondaries));
    }

    // Simulated topology monitor: periodically restore the full member view
    // so demoted primaries come back, the way a real monitor rediscovers.
    let refresh: Duration = args.topology_refresh.into();
    tokio::spawn(async move {
        loop {
            time::sleep(refresh).await;
            for (targeter, primary, secondaries) in &topology {
                targeter.install_view(Some(primary.clone()), secondaries.clone());
            }
        }
    });

    let read_pref = ReadPreference::new(args.read_mode.into());
    let duration: Duration = args.duration.into();
    let deadline = time::Instant::now() + duration;

    tracing::info!(
        shards = args.shards,
        drivers = args.drivers,
        seed = seed,
        "starting workload"
    );

    let mut tasks = Vec::with_capacity(args.drivers);
    for driver_id in 0..args.drivers {
        let executor = Arc::clone(&executor);
        let registry = Arc::clone(&registry);
        let read_pref = read_pref.clone();
        tasks.push(tokio::spawn(async move {
            run_driver(driver_id, deadline, executor, registry, read_pref).await
        }));
    }

    let mut merged = DriverStats::default();
    for task in tasks {
        let stats = task.await.context("driver task panicked")?;
        merged.rounds += stats.rounds;
        merged.successes += stats.successes;
        for (code, count) in stats.failures_by_code {
            *merged.failures_by_code.entry(code).or_default() += count;
        }
        merged.round_us.extend(stats.round_us);
    }

    let failures: u64 = merged.failures_by_code.values().sum();
    let latency = if merged.round_us.is_empty() {
        LatencySummary {
            min: 0,
            mean: 0,
            max: 0,
        }
    } else {
        let sum: u64 = merged.round_us.iter().sum();
        LatencySummary {
            min: *merged.round_us.iter().min().unwrap(),
            mean: sum / merged.round_us.len() as u64,
            max: *merged.round_us.iter().max().unwrap(),
        }
    };

    let summary = Summary {
        shards: args.shards,
        drivers: args.drivers,
        duration_ms: duration.as_millis() as u64,
        seed,
        rounds: merged.rounds,
        responses: merged.successes + failures,
        successes: merged.successes,
        failures_by_code: merged.failures_by_code,
        commands_sent: link.commands.load(Ordering::Relaxed),
        round_latency_us: latency,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serialize summary")?
    );
    Ok(())
}

/// Drive repeated full-cluster fan-outs until the deadline.
async fn run_driver(
    driver_id: usize,
    deadline: time::Instant,
    executor: Arc<TokioExecutor>,
    registry: Arc<ShardRegistry>,
    read_pref: ReadPreference,
) -> DriverStats {
    let mut stats = DriverStats::default();

    while time::Instant::now() < deadline {
        let requests: Vec<_> = registry
            .shard_ids()
            .into_iter()
            .map(|shard_id| {
                Request::new(shard_id, json!({"ping": 1, "driver": driver_id}))
            })
            .collect();

        let round_start = time::Instant::now();
        let mut sender = ScatterGather::new(
            OperationContext::new(),
            Arc::clone(&executor) as Arc<dyn TaskExecutor>,
            Arc::clone(&registry),
            "app",
            requests,
            read_pref.clone(),
            RetryPolicy::Idempotent,
        )
        .await;

        while !sender.done() {
            match sender.next().await {
                Response::Success { .. } => stats.successes += 1,
                Response::Failure { shard_id, status, .. } => {
                    tracing::debug!(
                        driver = driver_id,
                        shard_id = %shard_id,
                        error = %status,
                        "remote failed"
                    );
                    *stats
                        .failures_by_code
                        .entry(status.code.name().to_string())
                        .or_default() += 1;
                }
            }
        }

        stats.rounds += 1;
        stats
            .round_us
            .push(round_start.elapsed().as_micros().min(u128::from(u64::MAX)) as u64);
    }

    stats
}

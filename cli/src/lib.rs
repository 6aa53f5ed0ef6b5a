//! vinfra CLI - trace-fed autoscaling simulation driver.

pub mod output;
pub mod trace;

use std::path::PathBuf;

use clap::Parser;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use vinfra_core::config::SimConfig;
use vinfra_core::event::{EventEmitter, EventPayload, SimEvent};
use vinfra_runtime::policy::PolicyKind;
use vinfra_runtime::{Harness, RunReport};

/// Drive a workload trace through the autoscaling simulator.
#[derive(Debug, Parser)]
#[command(name = "vinfra", version, about)]
pub struct Cli {
    /// Workload trace: .json, or whitespace columns `id kind submit_s exec_s`
    pub trace: PathBuf,

    /// Cores per physical machine (minimum 4)
    pub cores: u32,

    /// Number of physical machines
    pub machines: u32,

    /// Autoscaling policy: threshold, creation-priority or pooling
    pub policy: String,

    /// Scenario YAML overriding the default configuration
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seed for the randomized eviction policy
    #[arg(long)]
    pub seed: Option<u64>,

    /// Stream simulation events into the log
    #[arg(long)]
    pub events: bool,

    /// Print the final report as JSON instead of tables
    #[arg(long)]
    pub json: bool,
}

/// Run the scenario described by the CLI arguments and print the report.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => SimConfig::from_yaml_file(path)?,
        None => SimConfig::default(),
    };
    config.machines.cores = cli.cores;
    config.machines.count = cli.machines;
    if let Some(seed) = cli.seed {
        config.scaling.seed = seed;
    }
    config.validate()?;
    let policy_kind: PolicyKind = cli.policy.parse()?;

    let run_id = uuid::Uuid::new_v4();
    tracing::info!(
        run_id = %run_id,
        trace = %cli.trace.display(),
        policy = %cli.policy,
        machines = config.machines.count,
        cores = config.machines.cores,
        "simulation starting"
    );

    let emitter = EventEmitter::new(4096);
    let event_log = cli
        .events
        .then(|| tokio::spawn(stream_events(emitter.subscribe())));

    // The simulation world is single-threaded by construction; it lives
    // entirely inside this blocking task and reports back by value.
    let trace_path = cli.trace.clone();
    let report: RunReport = tokio::task::spawn_blocking(move || {
        let jobs = trace::load_trace(&trace_path)?;
        let policy = policy_kind.build(&config.scaling);
        let harness = Harness::build(config, policy, jobs, emitter)?;
        harness.run()
    })
    .await??;

    if let Some(handle) = event_log {
        let _ = handle.await;
    }

    tracing::info!(
        run_id = %run_id,
        jobs_done = report.jobs_done,
        finished_at_ms = report.finished_at_ms,
        "simulation finished"
    );

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", output::render_report(&report));
    }
    Ok(())
}

async fn stream_events(receiver: tokio::sync::broadcast::Receiver<SimEvent>) {
    let mut stream = BroadcastStream::new(receiver);
    while let Some(event) = stream.next().await {
        let Ok(event) = event else { continue };
        match &event.payload {
            EventPayload::String(detail) => {
                tracing::info!(at_ms = event.at_ms, key = %event.key, detail = %detail, "event");
            }
            _ => {
                tracing::info!(at_ms = event.at_ms, key = %event.key, "event");
            }
        }
    }
}

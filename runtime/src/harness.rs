//! Wiring of the full control plane over one simulation.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Serialize;
use vinfra_cloud::Cloud;
use vinfra_core::config::SimConfig;
use vinfra_core::error::Result;
use vinfra_core::event::EventEmitter;
use vinfra_core::job::JobRef;
use vinfra_core::time::SimTime;
use vinfra_sim::Simulation;

use crate::arrival::ArrivalHandler;
use crate::infra::VirtualInfra;
use crate::launcher::JobLauncher;
use crate::policy::ScalingPolicy;
use crate::progress::Progress;
use crate::queue::QueueManager;

/// Final statistics of one simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub jobs_total: usize,
    pub jobs_dispatched: usize,
    pub jobs_done: usize,
    pub average_queue_ms: f64,
    pub finished_at_ms: SimTime,
    pub vms_created: u64,
    pub vms_live: usize,
    pub pool_sizes: BTreeMap<String, usize>,
    pub park_core_utilization: f64,
}

/// One fully wired simulation: cloud, infrastructure, dispatch chain and
/// progress accounting, with the drain hook tearing the VI down.
pub struct Harness {
    pub sim: Rc<Simulation>,
    pub cloud: Rc<Cloud>,
    pub infra: Rc<VirtualInfra>,
    pub launcher: Rc<JobLauncher>,
    pub queue: Rc<QueueManager>,
    pub arrival: Rc<ArrivalHandler>,
    pub progress: Rc<Progress>,
}

impl Harness {
    pub fn build(
        config: SimConfig,
        policy: Box<dyn ScalingPolicy>,
        jobs: Vec<JobRef>,
        emitter: EventEmitter,
    ) -> Result<Self> {
        config.validate()?;

        let sim = Rc::new(Simulation::new());
        let cloud = Cloud::new(Rc::clone(&sim), &config);
        let infra = VirtualInfra::new(
            Rc::clone(&sim),
            Rc::clone(&cloud),
            emitter.clone(),
            config,
            policy,
        );
        let progress = Progress::new(Rc::clone(&sim), emitter.clone());
        let launcher = JobLauncher::new(
            Rc::clone(&sim),
            Rc::clone(&infra),
            Rc::clone(&progress),
            emitter.clone(),
        );
        let queue = QueueManager::new(
            Rc::clone(&sim),
            Rc::clone(&launcher),
            emitter.clone(),
            infra.config().queue.retry_period_ms,
        );
        let arrival = ArrivalHandler::new(
            Rc::clone(&sim),
            Rc::clone(&launcher),
            Rc::clone(&queue),
            &progress,
            jobs,
        )?;

        let drain_target = Rc::clone(&infra);
        progress.on_all_finished(move || drain_target.terminate());

        Ok(Self {
            sim,
            cloud,
            infra,
            launcher,
            queue,
            arrival,
            progress,
        })
    }

    /// Arm the periodic components without advancing the clock.
    pub fn start(&self) {
        self.infra.start_autoscaling();
        self.arrival.start();
    }

    /// Run the scenario to completion and report.
    pub fn run(&self) -> Result<RunReport> {
        if self.progress.total() == Some(0) {
            tracing::warn!("empty trace; nothing to simulate");
            return Ok(self.report());
        }
        self.start();
        self.sim.simulate_until_last_event()?;
        Ok(self.report())
    }

    /// Snapshot the statistics at the current virtual time.
    pub fn report(&self) -> RunReport {
        RunReport {
            jobs_total: self.progress.total().unwrap_or(0),
            jobs_dispatched: self.progress.dispatched_count(),
            jobs_done: self.progress.done_count(),
            average_queue_ms: self.arrival.average_queue_time_ms(),
            finished_at_ms: self.sim.now(),
            vms_created: self.cloud.vms_created(),
            vms_live: self.cloud.vms_live(),
            pool_sizes: self.infra.pool_sizes(),
            park_core_utilization: self.cloud.park().core_utilization(),
        }
    }
}

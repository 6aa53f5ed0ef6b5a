//! First-fit job dispatch.

use std::rc::Rc;

use vinfra_cloud::{Parallelism, TaskId, TaskListener, TaskOutcome, Vm, VmState};
use vinfra_core::error::Result;
use vinfra_core::event::{events, EventEmitter, SimEvent};
use vinfra_core::job::JobRef;
use vinfra_sim::Simulation;

use crate::infra::VirtualInfra;
use crate::progress::Progress;

/// Stateless dispatcher: the first running idle VM of the job's kind
/// receives the work; otherwise the caller is told to queue the job.
pub struct JobLauncher {
    sim: Rc<Simulation>,
    infra: Rc<VirtualInfra>,
    progress: Rc<Progress>,
    emitter: EventEmitter,
    completion: Rc<CompletionHook>,
}

/// Task listener shared by every dispatched job.
struct CompletionHook {
    progress: Rc<Progress>,
}

impl TaskListener for CompletionHook {
    fn task_done(&self, vm: &Vm, _task: TaskId, outcome: TaskOutcome) -> Result<()> {
        match outcome {
            TaskOutcome::Completed => self.progress.register_completion(),
            TaskOutcome::Cancelled => {
                // The harness never cancels; shutdown races are benign.
                tracing::debug!(vm = %vm.id(), "dispatched task cancelled");
                Ok(())
            }
        }
    }
}

impl JobLauncher {
    pub fn new(
        sim: Rc<Simulation>,
        infra: Rc<VirtualInfra>,
        progress: Rc<Progress>,
        emitter: EventEmitter,
    ) -> Rc<Self> {
        let completion = Rc::new(CompletionHook {
            progress: Rc::clone(&progress),
        });
        Rc::new(Self {
            sim,
            infra,
            progress,
            emitter,
            completion,
        })
    }

    /// Try to place the job now. Returns `true` when the job must be
    /// queued: either the kind is brand new (it gets registered here) or
    /// no running idle VM exists yet.
    pub fn launch(&self, job: &JobRef) -> Result<bool> {
        let kind = job.kind();
        if !self.infra.has_kind(kind) {
            self.infra.register_kind(kind);
            return Ok(true);
        }

        for vm in self.infra.pool(kind) {
            if vm.state() != VmState::Running || !vm.is_idle() {
                continue;
            }
            let work = job.exec_ms() as f64 * vm.per_tick_processing_power();
            vm.new_compute_task(
                work,
                Parallelism::Unlimited,
                Rc::clone(&self.completion) as Rc<dyn TaskListener>,
            )?;

            let now = self.sim.now();
            job.mark_started(now);
            self.progress.register_dispatch();

            tracing::debug!(
                job = job.id(),
                kind,
                vm = %vm.id(),
                queue_ms = job.queue_time_ms().unwrap_or(0),
                "job dispatched"
            );
            self.emitter.emit(SimEvent::with_string(
                events::JOB_DISPATCHED,
                now,
                format!("{} on {}", job.id(), vm.id()),
            ));
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::VirtualInfra;
    use crate::policy::ScalingPolicy;
    use vinfra_cloud::Cloud;
    use vinfra_core::config::SimConfig;
    use vinfra_core::job::Job;
    use vinfra_core::time::SimTime;

    struct InertPolicy;

    impl ScalingPolicy for InertPolicy {
        fn name(&self) -> &'static str {
            "inert"
        }
        fn tick(&mut self, _infra: &VirtualInfra, _now: SimTime) -> Result<()> {
            Ok(())
        }
    }

    struct World {
        sim: Rc<Simulation>,
        infra: Rc<VirtualInfra>,
        progress: Rc<Progress>,
        launcher: Rc<JobLauncher>,
    }

    fn test_world() -> World {
        let sim = Rc::new(Simulation::new());
        let emitter = EventEmitter::new(256);
        let cloud = Cloud::new(Rc::clone(&sim), &SimConfig::default());
        let infra = VirtualInfra::new(
            Rc::clone(&sim),
            cloud,
            emitter.clone(),
            SimConfig::default(),
            Box::new(InertPolicy),
        );
        let progress = Progress::new(Rc::clone(&sim), emitter.clone());
        let launcher = JobLauncher::new(
            Rc::clone(&sim),
            Rc::clone(&infra),
            Rc::clone(&progress),
            emitter,
        );
        World {
            sim,
            infra,
            progress,
            launcher,
        }
    }

    fn job(kind: &str, exec_ms: SimTime) -> JobRef {
        Rc::new(Job::new("j-0", kind, 0, exec_ms))
    }

    #[test]
    fn test_unknown_kind_registers_and_queues() {
        let world = test_world();
        let job = job("a", 1_000);

        assert!(world.launcher.launch(&job).unwrap());
        assert!(world.infra.has_kind("a"));
        assert_eq!(world.progress.dispatched_count(), 0);
    }

    #[test]
    fn test_no_running_idle_vm_queues() {
        let world = test_world();
        world.infra.register_kind("a");
        world.infra.request_vm("a").unwrap();

        // VM exists but is still in transfer.
        assert!(world.launcher.launch(&job("a", 1_000)).unwrap());
    }

    #[test]
    fn test_dispatch_to_running_idle_vm() {
        let world = test_world();
        world.progress.set_total(1).unwrap();
        world.infra.register_kind("a");
        world.infra.request_vm("a").unwrap();
        world.sim.simulate_until(world.sim.now() + 60_000).unwrap();

        let job = job("a", 1_000);
        assert!(!world.launcher.launch(&job).unwrap());
        assert_eq!(world.progress.dispatched_count(), 1);
        assert!(job.queue_time_ms().is_some());

        let vm = world.infra.pool("a")[0].clone();
        assert!(!vm.is_idle());

        // exec_ms of work at the VM's own rate: done in exactly exec_ms.
        let dispatched_at = world.sim.now();
        world
            .sim
            .simulate_until(dispatched_at + 1_000)
            .unwrap();
        assert!(vm.is_idle());
        assert_eq!(world.progress.done_count(), 1);
    }

    #[test]
    fn test_first_fit_takes_pool_order() {
        let world = test_world();
        world.progress.set_total(2).unwrap();
        world.infra.register_kind("a");
        world.infra.request_vm("a").unwrap();
        world.sim.simulate_until(world.sim.now() + 60_000).unwrap();
        world.infra.request_vm("a").unwrap();
        world.sim.simulate_until(world.sim.now() + 60_000).unwrap();

        let pool = world.infra.pool("a");
        assert_eq!(pool.len(), 2);

        world.launcher.launch(&job("a", 60_000)).unwrap();
        assert!(!pool[0].is_idle());
        assert!(pool[1].is_idle());

        world.launcher.launch(&job("a", 60_000)).unwrap();
        assert!(!pool[1].is_idle());
    }

    #[test]
    fn test_busy_pool_queues_further_jobs() {
        let world = test_world();
        world.progress.set_total(1).unwrap();
        world.infra.register_kind("a");
        world.infra.request_vm("a").unwrap();
        world.sim.simulate_until(world.sim.now() + 60_000).unwrap();

        assert!(!world.launcher.launch(&job("a", 60_000)).unwrap());
        assert!(world.launcher.launch(&job("a", 60_000)).unwrap());
    }
}

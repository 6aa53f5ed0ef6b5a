//! Per-kind retry queue for rejected jobs.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};

use vinfra_core::error::Result;
use vinfra_core::event::{events, EventEmitter, SimEvent};
use vinfra_core::job::JobRef;
use vinfra_core::time::SimTime;
use vinfra_sim::{Simulation, Subscriber, SubscriberId};

use crate::launcher::JobLauncher;

/// FIFO retry queues, one per kind, drained on a short periodic retry.
///
/// Jobs enter at the tail and leave from the head, preserving per-kind
/// submission order. A kind whose head cannot be placed stops for this
/// tick without starving the other kinds. The subscription exists only
/// while at least one queue is non-empty.
pub struct QueueManager {
    sim: Rc<Simulation>,
    launcher: Rc<JobLauncher>,
    emitter: EventEmitter,
    retry_period_ms: SimTime,
    queues: RefCell<BTreeMap<String, VecDeque<JobRef>>>,
    sub: Cell<Option<SubscriberId>>,
    weak_self: RefCell<Weak<QueueManager>>,
}

impl QueueManager {
    pub fn new(
        sim: Rc<Simulation>,
        launcher: Rc<JobLauncher>,
        emitter: EventEmitter,
        retry_period_ms: SimTime,
    ) -> Rc<Self> {
        let manager = Rc::new(Self {
            sim,
            launcher,
            emitter,
            retry_period_ms,
            queues: RefCell::new(BTreeMap::new()),
            sub: Cell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *manager.weak_self.borrow_mut() = Rc::downgrade(&manager);
        manager
    }

    /// Queue a rejected job and make sure the retry loop is running.
    pub fn add(&self, job: JobRef) {
        let kind = job.kind().to_string();
        self.queues
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push_back(Rc::clone(&job));

        tracing::debug!(job = job.id(), kind = job.kind(), "job queued for retry");
        self.emitter.emit(SimEvent::with_string(
            events::JOB_QUEUED,
            self.sim.now(),
            job.id(),
        ));

        if self.sub.get().is_none() {
            let weak = self.weak_self.borrow().clone() as Weak<dyn Subscriber>;
            self.sub
                .set(Some(self.sim.subscribe(weak, self.retry_period_ms)));
        }
    }

    /// Jobs waiting across every kind.
    pub fn total_len(&self) -> usize {
        self.queues.borrow().values().map(VecDeque::len).sum()
    }

    pub fn len_for(&self, kind: &str) -> usize {
        self.queues
            .borrow()
            .get(kind)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self) -> bool {
        self.sub.get().is_some()
    }
}

impl Subscriber for QueueManager {
    fn on_tick(&self, _now: SimTime) -> Result<()> {
        let kinds: Vec<String> = self.queues.borrow().keys().cloned().collect();
        for kind in kinds {
            loop {
                let head = self
                    .queues
                    .borrow()
                    .get(&kind)
                    .and_then(|queue| queue.front().cloned());
                let Some(job) = head else { break };
                if self.launcher.launch(&job)? {
                    // Head blocked: stop this kind only.
                    break;
                }
                if let Some(queue) = self.queues.borrow_mut().get_mut(&kind) {
                    queue.pop_front();
                }
            }
        }

        let mut queues = self.queues.borrow_mut();
        queues.retain(|_, queue| !queue.is_empty());
        if queues.is_empty() {
            drop(queues);
            if let Some(sub) = self.sub.take() {
                self.sim.unsubscribe(sub);
            }
            tracing::debug!("retry queue drained");
            self.emitter
                .emit(SimEvent::empty(events::QUEUE_DRAINED, self.sim.now()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::VirtualInfra;
    use crate::policy::ScalingPolicy;
    use crate::progress::Progress;
    use vinfra_cloud::Cloud;
    use vinfra_core::config::SimConfig;
    use vinfra_core::job::Job;

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
        queue: Rc<QueueManager>,
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
            emitter.clone(),
        );
        let queue = QueueManager::new(Rc::clone(&sim), launcher, emitter, 10_000);
        World {
            sim,
            infra,
            progress,
            queue,
        }
    }

    fn job(id: &str, kind: &str) -> JobRef {
        Rc::new(Job::new(id, kind, 0, 1_000))
    }

    #[test]
    fn test_add_subscribes_once() {
        let world = test_world();
        world.infra.register_kind("a");
        assert!(!world.queue.is_subscribed());

        world.queue.add(job("j-1", "a"));
        world.queue.add(job("j-2", "a"));
        assert!(world.queue.is_subscribed());
        assert_eq!(world.queue.total_len(), 2);
        assert_eq!(world.queue.len_for("a"), 2);
    }

    #[test]
    fn test_retry_preserves_fifo_order_per_kind() {
        let world = test_world();
        world.progress.set_total(2).unwrap();
        world.infra.register_kind("a");
        world.infra.request_vm("a").unwrap();

        let first = job("j-1", "a");
        let second = job("j-2", "a");
        world.queue.add(Rc::clone(&first));
        world.queue.add(Rc::clone(&second));

        // One VM, running from ~26 s. The head dispatches on the 30 s
        // retry tick; the second job stays queued behind it.
        world.sim.simulate_until(35_000).unwrap();
        assert!(first.queue_time_ms().is_some());
        assert!(second.queue_time_ms().is_none());
        assert_eq!(world.queue.len_for("a"), 1);

        // The first job (1 s of work) finishes; the 40 s retry places the
        // second, draining the queue and dropping the subscription.
        world.sim.simulate_until(60_000).unwrap();
        assert!(second.queue_time_ms().is_some());
        assert_eq!(world.queue.total_len(), 0);
        assert!(!world.queue.is_subscribed());
    }

    #[test]
    fn test_blocked_kind_does_not_starve_others() {
        let world = test_world();
        world.progress.set_total(1).unwrap();
        // "a" has no VM; "b" has one.
        world.infra.register_kind("a");
        world.infra.register_kind("b");
        world.infra.request_vm("b").unwrap();
        world.sim.simulate_until(world.sim.now() + 60_000).unwrap();

        let stuck = job("j-a", "a");
        let served = job("j-b", "b");
        world.queue.add(Rc::clone(&stuck));
        world.queue.add(Rc::clone(&served));

        world.sim.simulate_until(world.sim.now() + 11_000).unwrap();
        assert!(stuck.queue_time_ms().is_none());
        assert!(served.queue_time_ms().is_some());
        assert_eq!(world.queue.len_for("a"), 1);
        assert_eq!(world.queue.len_for("b"), 0);
        assert!(world.queue.is_subscribed());
    }

    #[test]
    fn test_queue_for_dropped_kind_reregisters_it() {
        let world = test_world();
        world.queue.add(job("j-1", "fresh"));

        world.sim.simulate_until(world.sim.now() + 11_000).unwrap();
        // The launcher saw an unknown kind and registered it; the job
        // stays queued until the scaler provides capacity.
        assert!(world.infra.has_kind("fresh"));
        assert_eq!(world.queue.len_for("fresh"), 1);
    }
}

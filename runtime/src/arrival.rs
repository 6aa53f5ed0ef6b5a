//! Trace-driven job arrivals.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use vinfra_core::error::Result;
use vinfra_core::job::JobRef;
use vinfra_core::time::{ceil_to_seconds, SimTime};
use vinfra_sim::{Simulation, Subscriber, SubscriberId};

use crate::launcher::JobLauncher;
use crate::progress::Progress;
use crate::queue::QueueManager;

/// Replays a sorted trace against the launcher, queueing rejected jobs.
///
/// The subscription fires exactly at submit instants: after launching
/// every job due now, it retargets at the next future submit time and
/// unsubscribes at end of trace.
pub struct ArrivalHandler {
    sim: Rc<Simulation>,
    launcher: Rc<JobLauncher>,
    queue: Rc<QueueManager>,
    jobs: Vec<JobRef>,
    cursor: Cell<usize>,
    sub: Cell<Option<SubscriberId>>,
    weak_self: RefCell<Weak<ArrivalHandler>>,
}

impl ArrivalHandler {
    /// Sort the trace, shift it forward when loaded late (deficit rounded
    /// up to whole seconds), advance the clock to the first submit time,
    /// and register the job count with progress.
    pub fn new(
        sim: Rc<Simulation>,
        launcher: Rc<JobLauncher>,
        queue: Rc<QueueManager>,
        progress: &Progress,
        mut jobs: Vec<JobRef>,
    ) -> Result<Rc<Self>> {
        jobs.sort_by_key(|job| job.submit_ms());

        if let Some(first) = jobs.first() {
            let now = sim.now();
            if now > first.submit_ms() {
                let deficit = ceil_to_seconds(now - first.submit_ms());
                tracing::debug!(deficit_ms = deficit, "trace loaded late; shifting submits");
                for job in &jobs {
                    job.shift_submit(deficit);
                }
            }
            sim.skip_until(jobs[0].submit_ms());
        }

        progress.set_total(jobs.len())?;
        tracing::info!(jobs = jobs.len(), "trace loaded");

        let handler = Rc::new(Self {
            sim,
            launcher,
            queue,
            jobs,
            cursor: Cell::new(0),
            sub: Cell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *handler.weak_self.borrow_mut() = Rc::downgrade(&handler);
        Ok(handler)
    }

    /// Arm the subscription at the first submit time.
    pub fn start(&self) {
        let Some(first) = self.jobs.first() else {
            return;
        };
        if self.sub.get().is_none() {
            let weak = self.weak_self.borrow().clone() as Weak<dyn Subscriber>;
            let delay = first.submit_ms().saturating_sub(self.sim.now());
            self.sub.set(Some(self.sim.subscribe(weak, delay)));
        }
    }

    /// Jobs not yet handed to the launcher.
    pub fn remaining(&self) -> usize {
        self.jobs.len() - self.cursor.get()
    }

    /// Mean recorded queue time over the trace; meaningful after drain.
    pub fn average_queue_time_ms(&self) -> f64 {
        let times: Vec<SimTime> = self
            .jobs
            .iter()
            .filter_map(|job| job.queue_time_ms())
            .collect();
        if times.is_empty() {
            return 0.0;
        }
        times.iter().sum::<SimTime>() as f64 / times.len() as f64
    }

    pub fn jobs(&self) -> &[JobRef] {
        &self.jobs
    }
}

impl Subscriber for ArrivalHandler {
    fn on_tick(&self, now: SimTime) -> Result<()> {
        let mut cursor = self.cursor.get();
        while cursor < self.jobs.len() && self.jobs[cursor].submit_ms() <= now {
            let job = &self.jobs[cursor];
            if self.launcher.launch(job)? {
                self.queue.add(Rc::clone(job));
            }
            cursor += 1;
        }
        self.cursor.set(cursor);

        if cursor < self.jobs.len() {
            if let Some(sub) = self.sub.get() {
                let next = self.jobs[cursor].submit_ms();
                self.sim.update_frequency(sub, next - now);
            }
        } else if let Some(sub) = self.sub.take() {
            self.sim.unsubscribe(sub);
        }
        Ok(())
    }
}

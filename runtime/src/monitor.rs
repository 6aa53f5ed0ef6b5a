//! Per-VM sliding-window utilization estimation.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use vinfra_cloud::{ListenerId, StateChangeListener, Vm, VmState};
use vinfra_core::config::MonitorConfig;
use vinfra_core::error::{Result, SimError};
use vinfra_core::time::{SimTime, HOUR};
use vinfra_sim::{Simulation, Subscriber, SubscriberId};

/// Sliding-window estimator of one VM's hourly utilization.
///
/// Samples the VM's cumulative processed-work counter on a fixed cadence
/// into a circular window; the reported value is the window-spanning work
/// delta over the most work the VM could have done in an hour. That
/// maximum is unknown until the VM first reaches Running (the divisor is
/// `+∞` before the latch), so a VM still in transfer or boot reads as
/// ~zero utilization and is never mistaken for an idle one worth killing.
pub struct UtilizationMonitor {
    sim: Rc<Simulation>,
    vm: Vm,
    period_ms: SimTime,
    samples: RefCell<Vec<f64>>,
    index: Cell<usize>,
    max_hourly_work: Cell<f64>,
    active: Cell<bool>,
    finished: Cell<bool>,
    sub: Cell<Option<SubscriberId>>,
    state_listener: Cell<Option<ListenerId>>,
    weak_self: RefCell<Weak<UtilizationMonitor>>,
}

impl UtilizationMonitor {
    pub fn new(sim: Rc<Simulation>, vm: Vm, config: &MonitorConfig) -> Rc<Self> {
        let monitor = Rc::new(Self {
            sim,
            vm,
            period_ms: config.sample_period_ms,
            samples: RefCell::new(vec![0.0; config.window]),
            index: Cell::new(0),
            max_hourly_work: Cell::new(f64::INFINITY),
            active: Cell::new(false),
            finished: Cell::new(false),
            sub: Cell::new(None),
            state_listener: Cell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *monitor.weak_self.borrow_mut() = Rc::downgrade(&monitor);
        monitor
    }

    /// Begin sampling: seed the whole window with the current counter,
    /// reset the write index, and wait for the Running transition to
    /// latch the hourly maximum.
    pub fn start(&self) {
        let seed = self.vm.total_processed();
        self.samples.borrow_mut().fill(seed);
        self.index.set(0);
        self.finished.set(false);
        self.active.set(true);

        if self.sub.get().is_none() {
            let weak = self.weak_self.borrow().clone() as Weak<dyn Subscriber>;
            self.sub.set(Some(self.sim.subscribe(weak, self.period_ms)));
        }
        if self.vm.state() == VmState::Running {
            self.latch_max();
        } else if self.state_listener.get().is_none() {
            let weak = self.weak_self.borrow().clone() as Weak<dyn StateChangeListener>;
            self.state_listener
                .set(Some(self.vm.subscribe_state_change(weak)));
        }
    }

    /// End sampling. Idempotent; the scheduler subscription is dropped on
    /// the next fire.
    pub fn stop(&self) {
        self.finished.set(true);
        self.active.set(false);
        if let Some(id) = self.state_listener.take() {
            self.vm.unsubscribe_state_change(id);
        }
    }

    /// Fraction of the maximum hourly work done over the sampled window.
    pub fn hourly_utilization(&self) -> Result<f64> {
        if !self.active.get() {
            return Err(SimError::MonitorInactive);
        }
        let index = self.index.get();
        if index == 0 {
            return Ok(0.0);
        }
        let samples = self.samples.borrow();
        let window = samples.len();
        let newest = samples[(index - 1) % window];
        let oldest = samples[index % window];
        // Divides to ~0 until the Running latch.
        Ok((newest - oldest) / self.max_hourly_work.get())
    }

    /// The VM this monitor samples.
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    fn latch_max(&self) {
        if self.max_hourly_work.get().is_infinite() {
            self.max_hourly_work
                .set(self.vm.per_tick_processing_power() * HOUR as f64);
        }
    }
}

impl Subscriber for UtilizationMonitor {
    fn on_tick(&self, _now: SimTime) -> Result<()> {
        if self.finished.get() {
            if let Some(sub) = self.sub.take() {
                self.sim.unsubscribe(sub);
            }
            return Ok(());
        }
        let index = self.index.get();
        let window = self.samples.borrow().len();
        self.samples.borrow_mut()[index % window] = self.vm.total_processed();
        self.index.set(index + 1);
        Ok(())
    }
}

impl StateChangeListener for UtilizationMonitor {
    fn state_changed(&self, vm: &Vm, _old: VmState, new: VmState) {
        if new == VmState::Running {
            self.latch_max();
            if let Some(id) = self.state_listener.take() {
                vm.unsubscribe_state_change(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vinfra_cloud::{Cloud, Parallelism, TaskId, TaskListener, TaskOutcome, VirtualAppliance, VmAllocation};
    use vinfra_core::config::SimConfig;
    use vinfra_core::time::MINUTE;

    struct NullTaskListener;

    impl TaskListener for NullTaskListener {
        fn task_done(&self, _vm: &Vm, _task: TaskId, _outcome: TaskOutcome) -> Result<()> {
            Ok(())
        }
    }

    fn running_vm() -> (Rc<Simulation>, Vm) {
        let sim = Rc::new(Simulation::new());
        let cloud = Cloud::new(Rc::clone(&sim), &SimConfig::default());
        let va = VirtualAppliance {
            id: "k".to_string(),
            boot_cost_ms: 1_000,
            size_bytes: 0,
        };
        let spec = cloud.machine_spec();
        let alloc = VmAllocation {
            cores: 1,
            memory_mb: 1_024,
            per_core_perf: spec.per_core_perf,
        };
        let vm = cloud.request_vm(&va, alloc, 1).unwrap().remove(0);
        sim.simulate_until_last_event().unwrap();
        assert_eq!(vm.state(), VmState::Running);
        (sim, vm)
    }

    fn monitor_config() -> MonitorConfig {
        MonitorConfig {
            sample_period_ms: 5 * MINUTE,
            window: 12,
        }
    }

    #[test]
    fn test_reports_zero_before_first_sample() {
        let (sim, vm) = running_vm();
        let monitor = UtilizationMonitor::new(Rc::clone(&sim), vm, &monitor_config());
        monitor.start();
        assert_eq!(monitor.hourly_utilization().unwrap(), 0.0);
    }

    #[test]
    fn test_query_after_stop_fails() {
        let (sim, vm) = running_vm();
        let monitor = UtilizationMonitor::new(Rc::clone(&sim), vm, &monitor_config());
        monitor.start();
        monitor.stop();
        monitor.stop();
        assert!(matches!(
            monitor.hourly_utilization(),
            Err(SimError::MonitorInactive)
        ));
    }

    #[test]
    fn test_stop_unsubscribes_on_next_fire() {
        let (sim, vm) = running_vm();
        let monitor = UtilizationMonitor::new(Rc::clone(&sim), vm, &monitor_config());
        monitor.start();
        monitor.stop();

        sim.simulate_until_last_event().unwrap();
        assert!(monitor.sub.get().is_none());
    }

    #[test]
    fn test_busy_vm_reads_full_utilization() {
        let (sim, vm) = running_vm();
        let monitor = UtilizationMonitor::new(Rc::clone(&sim), vm.clone(), &monitor_config());
        monitor.start();

        // One core at 1 unit/ms, saturated for an hour.
        vm.new_compute_task(
            HOUR as f64 * vm.per_tick_processing_power(),
            Parallelism::Unlimited,
            Rc::new(NullTaskListener),
        )
        .unwrap();

        let start = sim.now();
        sim.simulate_until(start + HOUR).unwrap();
        // The window delta spans (window - 1) sample periods, so a
        // saturated VM tops out at 11/12.
        let util = monitor.hourly_utilization().unwrap();
        assert!((util - 11.0 / 12.0).abs() < 1e-9, "expected 11/12, got {util}");
    }

    #[test]
    fn test_half_load_reads_half_utilization() {
        let (sim, vm) = running_vm();
        let monitor = UtilizationMonitor::new(Rc::clone(&sim), vm.clone(), &monitor_config());
        monitor.start();

        // Busy for 30 of the next 60 minutes.
        vm.new_compute_task(
            30.0 * MINUTE as f64 * vm.per_tick_processing_power(),
            Parallelism::Unlimited,
            Rc::new(NullTaskListener),
        )
        .unwrap();

        let start = sim.now();
        sim.simulate_until(start + HOUR).unwrap();
        // Oldest surviving sample sits 55 minutes back: the 30 busy
        // minutes minus the first sample period land in the delta.
        let util = monitor.hourly_utilization().unwrap();
        let expected = (30.0 - 5.0) * MINUTE as f64 / HOUR as f64;
        assert!((util - expected).abs() < 1e-9, "expected {expected}, got {util}");
    }

    #[test]
    fn test_pre_running_vm_reads_zero() {
        let sim = Rc::new(Simulation::new());
        let cloud = Cloud::new(Rc::clone(&sim), &SimConfig::default());
        let va = VirtualAppliance {
            id: "k".to_string(),
            boot_cost_ms: 10 * HOUR, // never boots within the test
            size_bytes: 0,
        };
        let spec = cloud.machine_spec();
        let alloc = VmAllocation {
            cores: 1,
            memory_mb: 1_024,
            per_core_perf: spec.per_core_perf,
        };
        let vm = cloud.request_vm(&va, alloc, 1).unwrap().remove(0);

        let monitor = UtilizationMonitor::new(Rc::clone(&sim), vm, &monitor_config());
        monitor.start();

        sim.simulate_until(2 * HOUR).unwrap();
        assert_eq!(monitor.hourly_utilization().unwrap(), 0.0);
    }

    #[test]
    fn test_window_delta_matches_ring_contents() {
        let (sim, vm) = running_vm();
        let monitor = UtilizationMonitor::new(Rc::clone(&sim), vm.clone(), &monitor_config());
        monitor.start();

        vm.new_compute_task(
            10.0 * MINUTE as f64 * vm.per_tick_processing_power(),
            Parallelism::Unlimited,
            Rc::new(NullTaskListener),
        )
        .unwrap();

        // Two samples: work spans exactly the 10 busy minutes.
        let start = sim.now();
        sim.simulate_until(start + 10 * MINUTE).unwrap();

        let samples = monitor.samples.borrow();
        let index = monitor.index.get();
        assert!(index >= 2);
        let window = samples.len();
        let expected =
            (samples[(index - 1) % window] - samples[index % window]) / (HOUR as f64);
        drop(samples);
        assert_eq!(monitor.hourly_utilization().unwrap(), expected);
    }
}

//! Virtual infrastructure: per-kind VM pools over the cloud.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::{Rc, Weak};

use vinfra_cloud::{
    Cloud, ListenerId, StateChangeListener, VirtualAppliance, Vm, VmAllocation, VmId, VmState,
};
use vinfra_core::config::SimConfig;
use vinfra_core::error::{Result, SimError};
use vinfra_core::event::{events, EventEmitter, SimEvent};
use vinfra_core::time::SimTime;
use vinfra_sim::{Simulation, Subscriber, SubscriberId};

use crate::monitor::UtilizationMonitor;
use crate::policy::ScalingPolicy;

/// Owner of the per-kind VM pools and of the periodic scaling loop.
///
/// The control law itself is the injected [`ScalingPolicy`]; this base
/// provides the pool bookkeeping the policies lean on: appliance storage
/// reuse with FIFO eviction, the at-most-one-in-flight request guard per
/// kind, monitor wiring, and the request/destroy primitives.
pub struct VirtualInfra {
    sim: Rc<Simulation>,
    cloud: Rc<Cloud>,
    emitter: EventEmitter,
    config: SimConfig,
    pools: RefCell<BTreeMap<String, Vec<Vm>>>,
    under_prep: RefCell<HashMap<String, Vm>>,
    obsolete: RefCell<VecDeque<String>>,
    monitors: RefCell<HashMap<VmId, Rc<UtilizationMonitor>>>,
    state_subs: RefCell<HashMap<VmId, ListenerId>>,
    policy: RefCell<Box<dyn ScalingPolicy>>,
    sub: Cell<Option<SubscriberId>>,
    weak_self: RefCell<Weak<VirtualInfra>>,
}

impl VirtualInfra {
    pub fn new(
        sim: Rc<Simulation>,
        cloud: Rc<Cloud>,
        emitter: EventEmitter,
        config: SimConfig,
        policy: Box<dyn ScalingPolicy>,
    ) -> Rc<Self> {
        let infra = Rc::new(Self {
            sim,
            cloud,
            emitter,
            config,
            pools: RefCell::new(BTreeMap::new()),
            under_prep: RefCell::new(HashMap::new()),
            obsolete: RefCell::new(VecDeque::new()),
            monitors: RefCell::new(HashMap::new()),
            state_subs: RefCell::new(HashMap::new()),
            policy: RefCell::new(policy),
            sub: Cell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *infra.weak_self.borrow_mut() = Rc::downgrade(&infra);
        infra
    }

    /// Activate a workload class. Idempotent.
    pub fn register_kind(&self, kind: &str) {
        let mut pools = self.pools.borrow_mut();
        if pools.contains_key(kind) {
            return;
        }
        pools.insert(kind.to_string(), Vec::new());
        drop(pools);
        tracing::info!(kind, "workload kind registered");
        self.emitter.emit(SimEvent::with_string(
            events::KIND_REGISTERED,
            self.sim.now(),
            kind,
        ));
    }

    /// Begin the periodic scaling loop.
    pub fn start_autoscaling(&self) {
        if self.sub.get().is_none() {
            let weak = self.weak_self.borrow().clone() as Weak<dyn Subscriber>;
            self.sub
                .set(Some(self.sim.subscribe(weak, self.config.scaling.cadence_ms)));
            tracing::info!(
                policy = self.policy.borrow().name(),
                cadence_ms = self.config.scaling.cadence_ms,
                "autoscaling started"
            );
        }
    }

    /// Destroy every pooled VM (tail-first) and stop the scaling loop.
    pub fn terminate(&self) -> Result<()> {
        let kinds: Vec<String> = self.pools.borrow().keys().cloned().collect();
        for kind in kinds {
            loop {
                let last = self
                    .pools
                    .borrow()
                    .get(&kind)
                    .and_then(|pool| pool.last().cloned());
                match last {
                    Some(vm) => self.destroy_vm(&vm)?,
                    None => break,
                }
            }
        }
        if let Some(sub) = self.sub.take() {
            self.sim.unsubscribe(sub);
        }
        tracing::info!("virtual infrastructure terminated");
        Ok(())
    }

    /// Ask the cloud for one more VM of this kind.
    ///
    /// A kind with a request already in flight is a no-op; appliance
    /// storage is reused, evicting obsolete appliances FIFO when full.
    pub fn request_vm(&self, kind: &str) -> Result<()> {
        if self.under_prep.borrow().contains_key(kind) {
            return Ok(());
        }

        let repo = self.cloud.repository();
        let va = match repo.lookup(kind) {
            Some(va) => va,
            None => {
                let va = VirtualAppliance {
                    id: kind.to_string(),
                    boot_cost_ms: self.config.storage.appliance_boot_ms,
                    size_bytes: self.config.storage.appliance_size_bytes,
                };
                while !repo.register_object(va.clone()) {
                    let evicted = self
                        .obsolete
                        .borrow_mut()
                        .pop_front()
                        .ok_or_else(|| SimError::StorageExhausted(kind.to_string()))?;
                    repo.deregister_object(&evicted);
                    tracing::debug!(kind = %evicted, "obsolete appliance evicted");
                    self.emitter.emit(SimEvent::with_string(
                        events::APPLIANCE_EVICTED,
                        self.sim.now(),
                        &evicted,
                    ));
                }
                va
            }
        };

        // Deterministic sizing per kind.
        let spec = self.cloud.machine_spec();
        let cores = (kind.len() % 4) as u32 + 1;
        let alloc = VmAllocation {
            cores,
            memory_mb: cores * spec.memory_mb / spec.cores,
            per_core_perf: spec.per_core_perf,
        };

        let vm = self.cloud.request_vm(&va, alloc, 1)?.remove(0);

        let monitor =
            UtilizationMonitor::new(Rc::clone(&self.sim), vm.clone(), &self.config.monitor);
        monitor.start();
        self.monitors.borrow_mut().insert(vm.id(), monitor);

        {
            let mut pools = self.pools.borrow_mut();
            let pool = pools.entry(kind.to_string()).or_default();
            let was_empty = pool.is_empty();
            pool.push(vm.clone());
            if was_empty {
                self.obsolete.borrow_mut().retain(|k| k != kind);
            }
        }

        self.under_prep
            .borrow_mut()
            .insert(kind.to_string(), vm.clone());
        let weak = self.weak_self.borrow().clone() as Weak<dyn StateChangeListener>;
        let listener = vm.subscribe_state_change(weak);
        self.state_subs.borrow_mut().insert(vm.id(), listener);

        tracing::debug!(kind, vm = %vm.id(), cores, "vm requested for pool");
        self.emitter.emit(SimEvent::with_string(
            events::VM_REQUESTED,
            self.sim.now(),
            format!("{} kind={}", vm.id(), kind),
        ));
        Ok(())
    }

    /// Take a VM out of its pool and out of the cloud.
    pub fn destroy_vm(&self, vm: &Vm) -> Result<()> {
        let kind = vm.appliance().id.clone();

        if let Some(monitor) = self.monitors.borrow_mut().remove(&vm.id()) {
            monitor.stop();
        }
        if let Some(listener) = self.state_subs.borrow_mut().remove(&vm.id()) {
            vm.unsubscribe_state_change(listener);
        }

        let mut now_empty = false;
        {
            let mut pools = self.pools.borrow_mut();
            if let Some(pool) = pools.get_mut(&kind) {
                pool.retain(|pooled| pooled.id() != vm.id());
                now_empty = pool.is_empty();
            }
        }
        {
            let mut under_prep = self.under_prep.borrow_mut();
            if under_prep.get(&kind).map(Vm::id) == Some(vm.id()) {
                under_prep.remove(&kind);
            }
        }

        if vm.state() == VmState::Destroyed {
            self.cloud.terminate_vm(vm, true)?;
        } else {
            vm.destroy(true)?;
        }

        if now_empty {
            let mut obsolete = self.obsolete.borrow_mut();
            if !obsolete.contains(&kind) {
                obsolete.push_back(kind.clone());
            }
        }

        tracing::debug!(kind = %kind, vm = %vm.id(), "vm destroyed");
        self.emitter.emit(SimEvent::with_string(
            events::VM_DESTROYED,
            self.sim.now(),
            vm.id().to_string(),
        ));
        Ok(())
    }

    /// Deactivate an emptied workload class.
    pub fn drop_kind(&self, kind: &str) {
        let mut pools = self.pools.borrow_mut();
        match pools.get(kind) {
            Some(pool) if pool.is_empty() => {
                pools.remove(kind);
                drop(pools);
                tracing::info!(kind, "workload kind dropped");
                self.emitter.emit(SimEvent::with_string(
                    events::POOL_DROPPED,
                    self.sim.now(),
                    kind,
                ));
            }
            Some(_) => {
                tracing::warn!(kind, "refusing to drop kind with pooled vms");
            }
            None => {}
        }
    }

    /// Hourly utilization of a pooled VM.
    pub fn hourly_util(&self, vm: &Vm) -> Result<f64> {
        let monitors = self.monitors.borrow();
        let monitor = monitors.get(&vm.id()).ok_or(SimError::MonitorInactive)?;
        monitor.hourly_utilization()
    }

    /// Active kinds, in deterministic order.
    pub fn kinds(&self) -> Vec<String> {
        self.pools.borrow().keys().cloned().collect()
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.pools.borrow().contains_key(kind)
    }

    /// Snapshot of one pool, in insertion order.
    pub fn pool(&self, kind: &str) -> Vec<Vm> {
        self.pools
            .borrow()
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn pool_sizes(&self) -> BTreeMap<String, usize> {
        self.pools
            .borrow()
            .iter()
            .map(|(kind, pool)| (kind.clone(), pool.len()))
            .collect()
    }

    /// Whether this VM is the kind's in-flight request.
    pub fn is_under_prep(&self, vm: &Vm) -> bool {
        self.under_prep
            .borrow()
            .get(&vm.appliance().id)
            .map(Vm::id)
            == Some(vm.id())
    }

    /// Whether the kind has a request in flight.
    pub fn kind_under_prep(&self, kind: &str) -> bool {
        self.under_prep.borrow().contains_key(kind)
    }

    /// Kinds currently queued as appliance eviction candidates.
    pub fn obsolete_kinds(&self) -> Vec<String> {
        self.obsolete.borrow().iter().cloned().collect()
    }

    pub fn cloud(&self) -> &Rc<Cloud> {
        &self.cloud
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }
}

impl Subscriber for VirtualInfra {
    fn on_tick(&self, now: SimTime) -> Result<()> {
        let mut policy = self.policy.borrow_mut();
        policy.tick(self, now)
    }
}

impl StateChangeListener for VirtualInfra {
    fn state_changed(&self, vm: &Vm, _old: VmState, new: VmState) {
        if !matches!(new, VmState::Running | VmState::Nonservable) {
            return;
        }
        let kind = &vm.appliance().id;
        {
            let mut under_prep = self.under_prep.borrow_mut();
            if under_prep.get(kind).map(Vm::id) == Some(vm.id()) {
                under_prep.remove(kind);
            }
        }
        if let Some(listener) = self.state_subs.borrow_mut().remove(&vm.id()) {
            vm.unsubscribe_state_change(listener);
        }
        if new == VmState::Running {
            self.emitter.emit(SimEvent::with_string(
                events::VM_RUNNING,
                self.sim.now(),
                vm.id().to_string(),
            ));
        } else {
            tracing::warn!(vm = %vm.id(), kind = %kind, "vm became nonservable during preparation");
        }
    }
}

//! VM lifecycle, compute tasks, and state-change notification.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use vinfra_core::error::{Result, SimError};
use vinfra_core::time::SimTime;
use vinfra_sim::{Simulation, Subscriber, SubscriberId};

use crate::appliance::VirtualAppliance;
use crate::machine::{MachinePark, VmAllocation};

/// VM state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Appliance image moving out of the repository
    InitialTransfer,

    /// Guest booting
    Startup,

    /// Serving; tasks start immediately
    Running,

    /// Parked; never entered by the autoscaling harness
    Suspended,

    /// Terminal failure; the VM will never serve
    Nonservable,

    /// Terminated, resources freed
    Destroyed,
}

impl VmState {
    /// Terminal states never transition again (except Nonservable, which
    /// may still be destroyed for cleanup).
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmState::Nonservable | VmState::Destroyed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmState::InitialTransfer => "initial-transfer",
            VmState::Startup => "startup",
            VmState::Running => "running",
            VmState::Suspended => "suspended",
            VmState::Nonservable => "nonservable",
            VmState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Sequential VM identity; deterministic across identical runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(pub u64);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm-{}", self.0)
    }
}

/// Identity of a state-change subscription on one VM.
pub type ListenerId = u64;

/// Identity of a compute task on one VM.
pub type TaskId = u64;

/// How a compute task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
}

/// Degree of parallelism a task may use on its VM.
#[derive(Debug, Clone, Copy)]
pub enum Parallelism {
    /// Spread over every core of the VM.
    Unlimited,

    /// Use at most this many cores.
    Limit(u32),
}

/// Observer of VM state transitions. Called after the new state is
/// committed.
pub trait StateChangeListener {
    fn state_changed(&self, vm: &Vm, old: VmState, new: VmState);
}

/// Observer of compute-task termination. Called exactly once per task.
pub trait TaskListener {
    fn task_done(&self, vm: &Vm, task: TaskId, outcome: TaskOutcome) -> Result<()>;
}

struct RunningTask {
    id: TaskId,
    work: f64,
    started_at: SimTime,
    duration_ms: SimTime,
    listener: Rc<dyn TaskListener>,
}

struct PendingTask {
    id: TaskId,
    work: f64,
    parallelism: Parallelism,
    listener: Rc<dyn TaskListener>,
}

/// Shared VM state. The public handle is [`Vm`].
///
/// Each VM drives its own timeline with a single scheduler subscription,
/// retargeted at the next interesting deadline (phase transition or
/// earliest task completion) and dropped while there is nothing to wait
/// for.
pub struct VmCore {
    sim: Rc<Simulation>,
    park: Rc<MachinePark>,
    id: VmId,
    va: VirtualAppliance,
    alloc: VmAllocation,
    machine_index: usize,
    boot_ms: SimTime,
    state: Cell<VmState>,
    running: RefCell<Vec<RunningTask>>,
    pending: RefCell<Vec<PendingTask>>,
    completed_work: Cell<f64>,
    allocation_released: Cell<bool>,
    next_task_id: Cell<u64>,
    next_listener_id: Cell<u64>,
    listeners: RefCell<Vec<(ListenerId, Weak<dyn StateChangeListener>)>>,
    sub: Cell<Option<SubscriberId>>,
    weak_self: RefCell<Weak<VmCore>>,
}

/// Cheap-clone handle to one VM.
#[derive(Clone)]
pub struct Vm {
    core: Rc<VmCore>,
}

impl PartialEq for Vm {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for Vm {}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.core.id)
            .field("kind", &self.core.va.id)
            .field("state", &self.core.state.get())
            .finish()
    }
}

impl Vm {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        sim: Rc<Simulation>,
        park: Rc<MachinePark>,
        id: VmId,
        va: VirtualAppliance,
        alloc: VmAllocation,
        machine_index: usize,
        transfer_ms: SimTime,
        boot_ms: SimTime,
    ) -> Vm {
        let core = Rc::new(VmCore {
            sim,
            park,
            id,
            va,
            alloc,
            machine_index,
            boot_ms,
            state: Cell::new(VmState::InitialTransfer),
            running: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
            completed_work: Cell::new(0.0),
            allocation_released: Cell::new(false),
            next_task_id: Cell::new(0),
            next_listener_id: Cell::new(0),
            listeners: RefCell::new(Vec::new()),
            sub: Cell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *core.weak_self.borrow_mut() = Rc::downgrade(&core);
        let sub = core
            .sim
            .subscribe(Rc::downgrade(&core) as Weak<dyn Subscriber>, transfer_ms);
        core.sub.set(Some(sub));
        Vm { core }
    }

    pub fn id(&self) -> VmId {
        self.core.id
    }

    /// The appliance this VM was instantiated from.
    pub fn appliance(&self) -> &VirtualAppliance {
        &self.core.va
    }

    pub fn state(&self) -> VmState {
        self.core.state.get()
    }

    pub fn allocation(&self) -> VmAllocation {
        self.core.alloc
    }

    /// Work units this VM processes per simulated millisecond.
    pub fn per_tick_processing_power(&self) -> f64 {
        self.core.per_tick_processing_power()
    }

    /// Cumulative work units since creation, including the elapsed share
    /// of in-flight tasks.
    pub fn total_processed(&self) -> f64 {
        let now = self.core.sim.now();
        let mut total = self.core.completed_work.get();
        for task in self.core.running.borrow().iter() {
            if task.duration_ms == 0 {
                continue;
            }
            let elapsed = now.saturating_sub(task.started_at).min(task.duration_ms);
            total += task.work * elapsed as f64 / task.duration_ms as f64;
        }
        total
    }

    pub fn running_task_count(&self) -> usize {
        self.core.running.borrow().len()
    }

    pub fn pending_task_count(&self) -> usize {
        self.core.pending.borrow().len()
    }

    /// Idle ⇔ both task sets are empty.
    pub fn is_idle(&self) -> bool {
        self.running_task_count() == 0 && self.pending_task_count() == 0
    }

    /// Enqueue a compute task. Starts immediately on a running VM, else
    /// parks in the pending set and starts on the Running transition.
    pub fn new_compute_task(
        &self,
        work_units: f64,
        parallelism: Parallelism,
        listener: Rc<dyn TaskListener>,
    ) -> Result<TaskId> {
        let core = &self.core;
        if core.state.get().is_terminal() {
            return Err(SimError::VmManagement(format!(
                "{} cannot accept tasks in state {}",
                core.id,
                core.state.get()
            )));
        }
        let id = core.next_task_id.get();
        core.next_task_id.set(id + 1);

        if core.state.get() == VmState::Running {
            let now = core.sim.now();
            core.start_task(id, work_units, parallelism, listener, now);
            core.retarget_or_idle();
        } else {
            core.pending.borrow_mut().push(PendingTask {
                id,
                work: work_units,
                parallelism,
                listener,
            });
        }
        Ok(id)
    }

    /// Observe state transitions. The listener is held weakly.
    pub fn subscribe_state_change(&self, listener: Weak<dyn StateChangeListener>) -> ListenerId {
        let core = &self.core;
        let id = core.next_listener_id.get();
        core.next_listener_id.set(id + 1);
        core.listeners.borrow_mut().push((id, listener));
        id
    }

    /// Idempotent; unknown ids are a no-op.
    pub fn unsubscribe_state_change(&self, id: ListenerId) {
        self.core
            .listeners
            .borrow_mut()
            .retain(|(lid, _)| *lid != id);
    }

    /// Tear the VM down. Live tasks are cancelled when `force` is set and
    /// refuse the destruction otherwise.
    pub fn destroy(&self, force: bool) -> Result<()> {
        let core = &self.core;
        if core.state.get() == VmState::Destroyed {
            return Err(SimError::VmManagement(format!(
                "{} already destroyed",
                core.id
            )));
        }
        if !force && !self.is_idle() {
            return Err(SimError::VmManagement(format!(
                "{} still has tasks; use force",
                core.id
            )));
        }
        core.cancel_all_tasks()?;
        core.release_allocation();
        core.unschedule();
        core.set_state(VmState::Destroyed);
        Ok(())
    }

    /// Fault injection: push the VM into the terminal Nonservable state.
    pub fn force_nonservable(&self) -> Result<()> {
        let core = &self.core;
        if core.state.get().is_terminal() {
            return Ok(());
        }
        core.cancel_all_tasks()?;
        core.release_allocation();
        core.unschedule();
        core.set_state(VmState::Nonservable);
        Ok(())
    }
}

impl VmCore {
    fn per_tick_processing_power(&self) -> f64 {
        self.alloc.cores as f64 * self.alloc.per_core_perf
    }

    fn handle(&self) -> Vm {
        let core = self
            .weak_self
            .borrow()
            .upgrade()
            .expect("VmCore outlives its handles");
        Vm { core }
    }

    fn set_state(&self, new: VmState) {
        let old = self.state.get();
        if old == new {
            return;
        }
        self.state.set(new);
        tracing::trace!(vm = %self.id, from = %old, to = %new, "vm state change");

        let snapshot: Vec<(ListenerId, Weak<dyn StateChangeListener>)> =
            self.listeners.borrow().clone();
        let handle = self.handle();
        let mut dead = Vec::new();
        for (id, weak) in snapshot {
            match weak.upgrade() {
                Some(listener) => listener.state_changed(&handle, old, new),
                None => dead.push(id),
            }
        }
        if !dead.is_empty() {
            self.listeners
                .borrow_mut()
                .retain(|(id, _)| !dead.contains(id));
        }
    }

    fn effective_cores(&self, parallelism: Parallelism) -> u32 {
        match parallelism {
            Parallelism::Unlimited => self.alloc.cores,
            Parallelism::Limit(n) => n.min(self.alloc.cores).max(1),
        }
    }

    fn start_task(
        &self,
        id: TaskId,
        work: f64,
        parallelism: Parallelism,
        listener: Rc<dyn TaskListener>,
        now: SimTime,
    ) {
        let rate = self.effective_cores(parallelism) as f64 * self.alloc.per_core_perf;
        let duration_ms = (work / rate).ceil().max(1.0) as SimTime;
        self.running.borrow_mut().push(RunningTask {
            id,
            work,
            started_at: now,
            duration_ms,
            listener,
        });
    }

    fn start_pending(&self, now: SimTime) {
        let pending: Vec<PendingTask> = self.pending.borrow_mut().drain(..).collect();
        for task in pending {
            self.start_task(task.id, task.work, task.parallelism, task.listener, now);
        }
    }

    /// Remove due tasks, bank their work, then notify. Listeners see the
    /// VM already idle of those tasks.
    fn complete_due(&self, now: SimTime) -> Result<()> {
        let due: Vec<RunningTask> = {
            let mut running = self.running.borrow_mut();
            let mut due = Vec::new();
            let mut index = 0;
            while index < running.len() {
                if running[index].started_at + running[index].duration_ms <= now {
                    due.push(running.remove(index));
                } else {
                    index += 1;
                }
            }
            due
        };
        for task in &due {
            self.completed_work
                .set(self.completed_work.get() + task.work);
        }
        let handle = self.handle();
        for task in due {
            task.listener
                .task_done(&handle, task.id, TaskOutcome::Completed)?;
        }
        Ok(())
    }

    fn cancel_all_tasks(&self) -> Result<()> {
        let now = self.sim.now();
        let pending: Vec<PendingTask> = self.pending.borrow_mut().drain(..).collect();
        let running: Vec<RunningTask> = self.running.borrow_mut().drain(..).collect();

        // Bank the elapsed share so total_processed stays monotonic.
        for task in &running {
            if task.duration_ms > 0 {
                let elapsed = now.saturating_sub(task.started_at).min(task.duration_ms);
                let share = task.work * elapsed as f64 / task.duration_ms as f64;
                self.completed_work.set(self.completed_work.get() + share);
            }
        }

        let handle = self.handle();
        for task in pending {
            task.listener
                .task_done(&handle, task.id, TaskOutcome::Cancelled)?;
        }
        for task in running {
            task.listener
                .task_done(&handle, task.id, TaskOutcome::Cancelled)?;
        }
        Ok(())
    }

    fn earliest_deadline(&self) -> Option<SimTime> {
        self.running
            .borrow()
            .iter()
            .map(|task| task.started_at + task.duration_ms)
            .min()
    }

    fn retarget(&self, deadline: SimTime) {
        if let Some(sub) = self.sub.get() {
            let delay = deadline.saturating_sub(self.sim.now());
            self.sim.update_frequency(sub, delay);
        }
    }

    /// Aim the subscription at the next task deadline, or park it.
    fn retarget_or_idle(&self) {
        match self.earliest_deadline() {
            Some(deadline) => match self.sub.get() {
                Some(sub) if self.sim.is_subscribed(sub) => self.retarget(deadline),
                _ => {
                    let weak = self.weak_self.borrow().clone() as Weak<dyn Subscriber>;
                    let delay = deadline.saturating_sub(self.sim.now());
                    self.sub.set(Some(self.sim.subscribe(weak, delay)));
                }
            },
            None => self.unschedule(),
        }
    }

    fn unschedule(&self) {
        if let Some(sub) = self.sub.take() {
            self.sim.unsubscribe(sub);
        }
    }

    fn release_allocation(&self) {
        if !self.allocation_released.replace(true) {
            self.park.release(self.machine_index, &self.alloc);
        }
    }
}

impl Subscriber for VmCore {
    fn on_tick(&self, now: SimTime) -> Result<()> {
        match self.state.get() {
            VmState::InitialTransfer => {
                self.set_state(VmState::Startup);
                self.retarget(now + self.boot_ms);
            }
            VmState::Startup => {
                self.set_state(VmState::Running);
                // A destroy from a state-change listener ends the story here.
                if self.state.get() != VmState::Running {
                    return Ok(());
                }
                self.start_pending(now);
                self.retarget_or_idle();
            }
            VmState::Running => {
                self.complete_due(now)?;
                // Completion listeners may have torn the VM down.
                if self.state.get() == VmState::Running {
                    self.retarget_or_idle();
                }
            }
            VmState::Suspended | VmState::Nonservable | VmState::Destroyed => {
                self.unschedule();
            }
        }
        Ok(())
    }
}

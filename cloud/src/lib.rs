//! vinfra simulated IaaS substrate.
//!
//! A deterministic, single-repository cloud: an appliance store, a
//! homogeneous machine park with first-fit placement, and VMs that drive
//! their own lifecycle (transfer → startup → running) on the virtual
//! clock. The autoscaling control plane talks to this crate exclusively
//! through the [`Cloud`] facade and the [`vm::Vm`] handles it returns.

pub mod appliance;
pub mod machine;
pub mod vm;

pub use appliance::{Repository, VirtualAppliance};
pub use machine::{MachinePark, MachineSpec, VmAllocation};
pub use vm::{
    ListenerId, Parallelism, StateChangeListener, TaskId, TaskListener, TaskOutcome, Vm, VmId,
    VmState,
};

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use vinfra_core::config::SimConfig;
use vinfra_core::error::{Result, SimError};
use vinfra_core::time::SimTime;
use vinfra_sim::Simulation;

/// The IaaS service facade.
pub struct Cloud {
    sim: Rc<Simulation>,
    park: Rc<MachinePark>,
    repo: Rc<Repository>,
    registry: RefCell<Vec<Vm>>,
    next_vm_id: Cell<u64>,
    vms_created: Cell<u64>,
    startup_override_ms: Cell<Option<SimTime>>,
}

impl Cloud {
    pub fn new(sim: Rc<Simulation>, config: &SimConfig) -> Rc<Self> {
        let park = Rc::new(MachinePark::new(&config.machines));
        let repo = Rc::new(Repository::new(
            config.storage.capacity_bytes,
            config.storage.transfer_bytes_per_ms,
        ));
        Rc::new(Self {
            sim,
            park,
            repo,
            registry: RefCell::new(Vec::new()),
            next_vm_id: Cell::new(0),
            vms_created: Cell::new(0),
            startup_override_ms: Cell::new(None),
        })
    }

    /// The cloud's single VMI repository.
    pub fn repository(&self) -> Rc<Repository> {
        Rc::clone(&self.repo)
    }

    /// Spec of the first physical machine (used for VM sizing).
    pub fn machine_spec(&self) -> MachineSpec {
        self.park.spec()
    }

    pub fn park(&self) -> Rc<MachinePark> {
        Rc::clone(&self.park)
    }

    /// Create `count` VMs from the given appliance. Each starts in
    /// InitialTransfer and works its way to Running on its own schedule.
    pub fn request_vm(
        &self,
        va: &VirtualAppliance,
        alloc: VmAllocation,
        count: usize,
    ) -> Result<Vec<Vm>> {
        let mut vms = Vec::with_capacity(count);
        for _ in 0..count {
            let machine_index = self.park.allocate(&alloc)?;
            let id = VmId(self.next_vm_id.get());
            self.next_vm_id.set(id.0 + 1);
            self.vms_created.set(self.vms_created.get() + 1);

            let transfer_ms = self.repo.transfer_ms(va.size_bytes);
            let boot_ms = self
                .startup_override_ms
                .get()
                .unwrap_or(va.boot_cost_ms);
            let vm = Vm::create(
                Rc::clone(&self.sim),
                Rc::clone(&self.park),
                id,
                va.clone(),
                alloc,
                machine_index,
                transfer_ms,
                boot_ms,
            );
            tracing::debug!(
                vm = %id,
                kind = %va.id,
                cores = alloc.cores,
                transfer_ms,
                boot_ms,
                "vm requested"
            );
            self.registry.borrow_mut().push(vm.clone());
            vms.push(vm);
        }
        Ok(vms)
    }

    /// Drop the cloud-side record of a destroyed VM. With `force`, a live
    /// VM is destroyed first; without it, a live VM is an error.
    pub fn terminate_vm(&self, vm: &Vm, force: bool) -> Result<()> {
        if vm.state() != VmState::Destroyed {
            if !force {
                return Err(SimError::VmManagement(format!(
                    "{} is still {}; use force",
                    vm.id(),
                    vm.state()
                )));
            }
            vm.destroy(true)?;
        }
        self.registry.borrow_mut().retain(|v| v.id() != vm.id());
        Ok(())
    }

    /// Total VMs ever created.
    pub fn vms_created(&self) -> u64 {
        self.vms_created.get()
    }

    /// VMs currently in a non-terminal state.
    pub fn vms_live(&self) -> usize {
        self.registry
            .borrow()
            .iter()
            .filter(|vm| !vm.state().is_terminal())
            .count()
    }

    /// Test hook: override the boot latency of every VM requested from
    /// now on.
    pub fn set_startup_latency(&self, boot_ms: SimTime) {
        self.startup_override_ms.set(Some(boot_ms));
    }
}

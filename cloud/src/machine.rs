//! Physical machine park with first-fit VM placement.

use std::cell::RefCell;

use vinfra_core::config::MachineConfig;
use vinfra_core::error::{Result, SimError};

/// Capabilities of one physical machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineSpec {
    pub cores: u32,

    /// Work units one core processes per simulated millisecond.
    pub per_core_perf: f64,

    pub memory_mb: u32,
}

/// Resources a VM occupies on its host machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VmAllocation {
    pub cores: u32,
    pub memory_mb: u32,

    /// Per-core performance, copied from the host at sizing time.
    pub per_core_perf: f64,
}

struct PmState {
    spec: MachineSpec,
    used_cores: u32,
    used_memory_mb: u32,
}

impl PmState {
    fn fits(&self, alloc: &VmAllocation) -> bool {
        self.used_cores + alloc.cores <= self.spec.cores
            && self.used_memory_mb + alloc.memory_mb <= self.spec.memory_mb
    }
}

/// The homogeneous machine park backing the cloud.
pub struct MachinePark {
    machines: RefCell<Vec<PmState>>,
}

impl MachinePark {
    pub fn new(config: &MachineConfig) -> Self {
        let spec = MachineSpec {
            cores: config.cores,
            per_core_perf: config.per_core_perf,
            memory_mb: config.memory_mb,
        };
        let machines = (0..config.count)
            .map(|_| PmState {
                spec,
                used_cores: 0,
                used_memory_mb: 0,
            })
            .collect();
        Self {
            machines: RefCell::new(machines),
        }
    }

    /// Spec of the first machine; VM sizing copies its per-core
    /// performance and memory ratio.
    pub fn spec(&self) -> MachineSpec {
        self.machines.borrow()[0].spec
    }

    /// First-fit placement. Returns the host machine index.
    pub fn allocate(&self, alloc: &VmAllocation) -> Result<usize> {
        let mut machines = self.machines.borrow_mut();
        for (index, pm) in machines.iter_mut().enumerate() {
            if pm.fits(alloc) {
                pm.used_cores += alloc.cores;
                pm.used_memory_mb += alloc.memory_mb;
                return Ok(index);
            }
        }
        Err(SimError::VmManagement(format!(
            "no machine fits {} cores / {} MB",
            alloc.cores, alloc.memory_mb
        )))
    }

    /// Return a VM's resources to its host machine.
    pub fn release(&self, machine_index: usize, alloc: &VmAllocation) {
        let mut machines = self.machines.borrow_mut();
        let pm = &mut machines[machine_index];
        pm.used_cores = pm.used_cores.saturating_sub(alloc.cores);
        pm.used_memory_mb = pm.used_memory_mb.saturating_sub(alloc.memory_mb);
    }

    pub fn machine_count(&self) -> usize {
        self.machines.borrow().len()
    }

    /// Fraction of park cores currently allocated.
    pub fn core_utilization(&self) -> f64 {
        let machines = self.machines.borrow();
        let total: u32 = machines.iter().map(|pm| pm.spec.cores).sum();
        if total == 0 {
            return 0.0;
        }
        let used: u32 = machines.iter().map(|pm| pm.used_cores).sum();
        used as f64 / total as f64
    }
}

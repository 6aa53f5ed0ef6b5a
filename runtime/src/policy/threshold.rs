//! Utilization-threshold scaling.

use std::collections::HashMap;

use vinfra_cloud::VmId;
use vinfra_core::config::ScalingConfig;
use vinfra_core::error::Result;
use vinfra_core::time::SimTime;

use super::{mean_util, ScalingPolicy};
use crate::infra::VirtualInfra;

/// Grow on high mean utilization, shed idle low-utilization VMs, and
/// retire a singleton pool after a full grace period of idleness.
///
/// Grace is counted per VM: consecutive ticks observing the pool's only
/// VM idle. Any activity resets the count.
pub struct ThresholdPolicy {
    min_util: f64,
    max_util: f64,
    idle_tick_limit: u32,
    hits: HashMap<VmId, u32>,
}

impl ThresholdPolicy {
    pub fn new(config: &ScalingConfig) -> Self {
        Self {
            min_util: config.min_util,
            max_util: config.max_util,
            idle_tick_limit: config.idle_tick_limit,
            hits: HashMap::new(),
        }
    }
}

impl ScalingPolicy for ThresholdPolicy {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn tick(&mut self, infra: &VirtualInfra, _now: SimTime) -> Result<()> {
        for kind in infra.kinds() {
            let pool = infra.pool(&kind);
            if pool.is_empty() {
                infra.request_vm(&kind)?;
                continue;
            }

            if pool.len() == 1 {
                let vm = &pool[0];
                if vm.is_idle() && !infra.is_under_prep(vm) {
                    let hits = self.hits.entry(vm.id()).or_insert(0);
                    *hits += 1;
                    if *hits >= self.idle_tick_limit {
                        self.hits.remove(&vm.id());
                        tracing::debug!(kind = %kind, vm = %vm.id(), "idle grace expired");
                        infra.destroy_vm(vm)?;
                        infra.drop_kind(&kind);
                    }
                    continue;
                }
                self.hits.remove(&vm.id());
                // Busy singleton falls through to the growth check.
            } else {
                let mut destroyed_any = false;
                for vm in &pool {
                    if vm.is_idle()
                        && !infra.is_under_prep(vm)
                        && infra.hourly_util(vm)? < self.min_util
                    {
                        self.hits.remove(&vm.id());
                        infra.destroy_vm(vm)?;
                        destroyed_any = true;
                    }
                }
                if destroyed_any {
                    continue;
                }
            }

            if mean_util(infra, &pool)? > self.max_util {
                infra.request_vm(&kind)?;
            }
        }
        Ok(())
    }
}

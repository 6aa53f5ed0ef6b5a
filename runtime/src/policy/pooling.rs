//! Fixed-headroom pooling.

use std::collections::HashMap;

use vinfra_cloud::Vm;
use vinfra_core::config::ScalingConfig;
use vinfra_core::error::Result;
use vinfra_core::time::SimTime;

use super::ScalingPolicy;
use crate::infra::VirtualInfra;

/// Keep a fixed number of idle VMs in every pool, independent of
/// measured utilization. A fully idle pool is retired after the grace
/// period; a pool with surplus idle capacity sheds its oldest unused VM.
/// Headroom is tracked per kind and never goes negative.
pub struct PoolingPolicy {
    headroom: usize,
    idle_tick_limit: u32,
    hits: HashMap<String, u32>,
}

impl PoolingPolicy {
    pub fn new(config: &ScalingConfig) -> Self {
        Self {
            headroom: config.headroom,
            idle_tick_limit: config.idle_tick_limit,
            hits: HashMap::new(),
        }
    }
}

impl ScalingPolicy for PoolingPolicy {
    fn name(&self) -> &'static str {
        "pooling"
    }

    fn tick(&mut self, infra: &VirtualInfra, _now: SimTime) -> Result<()> {
        for kind in infra.kinds() {
            let pool = infra.pool(&kind);
            if pool.len() < self.headroom {
                infra.request_vm(&kind)?;
                continue;
            }

            let unused: Vec<Vm> = pool.iter().filter(|vm| vm.is_idle()).cloned().collect();

            if unused.len() < self.headroom {
                self.hits.remove(&kind);
                infra.request_vm(&kind)?;
                continue;
            }

            if unused.len() == pool.len() {
                let hits = self.hits.entry(kind.clone()).or_insert(0);
                *hits += 1;
                if *hits >= self.idle_tick_limit {
                    self.hits.remove(&kind);
                    tracing::debug!(kind = %kind, pool = pool.len(), "fully idle pool retired");
                    for vm in pool.iter().rev() {
                        if infra.is_under_prep(vm) {
                            continue;
                        }
                        infra.destroy_vm(vm)?;
                    }
                    if infra.pool(&kind).is_empty() {
                        infra.drop_kind(&kind);
                    }
                }
                continue;
            }

            self.hits.remove(&kind);
            if unused.len() > self.headroom {
                if let Some(victim) = unused.iter().find(|vm| !infra.is_under_prep(vm)) {
                    infra.destroy_vm(victim)?;
                }
            }
        }
        Ok(())
    }
}

//! Growth-first scaling with randomized shrink.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vinfra_cloud::Vm;
use vinfra_core::config::ScalingConfig;
use vinfra_core::error::Result;
use vinfra_core::time::SimTime;

use super::{mean_util, ScalingPolicy};
use crate::infra::VirtualInfra;

/// Like the threshold policy, but growth wins ties with shrink, and the
/// shrink victim is drawn uniformly from the under-utilized idle set.
/// Randomized eviction avoids index-0 bias and decorrelates the victim
/// choice from arrival order; the RNG is seeded so runs reproduce.
pub struct CreationPriorityPolicy {
    min_util: f64,
    max_util: f64,
    idle_tick_limit: u32,
    hits: HashMap<String, u32>,
    rng: StdRng,
}

impl CreationPriorityPolicy {
    pub fn new(config: &ScalingConfig) -> Self {
        Self {
            min_util: config.min_util,
            max_util: config.max_util,
            idle_tick_limit: config.idle_tick_limit,
            hits: HashMap::new(),
            rng: StdRng::seed_from_u64(config.seed),
        }
    }
}

impl ScalingPolicy for CreationPriorityPolicy {
    fn name(&self) -> &'static str {
        "creation-priority"
    }

    fn tick(&mut self, infra: &VirtualInfra, _now: SimTime) -> Result<()> {
        for kind in infra.kinds() {
            let pool = infra.pool(&kind);
            if pool.is_empty() {
                infra.request_vm(&kind)?;
                continue;
            }

            let mean = mean_util(infra, &pool)?;
            let mut under_util: Vec<Vm> = Vec::new();
            for vm in &pool {
                if vm.is_idle()
                    && !infra.is_under_prep(vm)
                    && infra.hourly_util(vm)? < self.min_util
                {
                    under_util.push(vm.clone());
                }
            }

            if mean > self.max_util {
                self.hits.remove(&kind);
                infra.request_vm(&kind)?;
            } else if pool.len() == 1 {
                let vm = &pool[0];
                if vm.is_idle() && !infra.is_under_prep(vm) {
                    let hits = self.hits.entry(kind.clone()).or_insert(0);
                    *hits += 1;
                    if *hits >= self.idle_tick_limit {
                        self.hits.remove(&kind);
                        tracing::debug!(kind = %kind, vm = %vm.id(), "idle grace expired");
                        infra.destroy_vm(vm)?;
                        infra.drop_kind(&kind);
                    }
                } else {
                    self.hits.remove(&kind);
                }
            } else if !under_util.is_empty() {
                self.hits.remove(&kind);
                let victim = &under_util[self.rng.gen_range(0..under_util.len())];
                tracing::debug!(kind = %kind, vm = %victim.id(), "random under-utilized eviction");
                infra.destroy_vm(victim)?;
            } else {
                self.hits.remove(&kind);
            }
        }
        Ok(())
    }
}

//! Pluggable autoscaling control laws.
//!
//! A policy is invoked once per control-loop tick with a view of the
//! whole infrastructure and decides, kind by kind, whether to grow the
//! pool, shed idle capacity, or retire the workload class entirely. The
//! base infrastructure enforces the in-flight guard on requests; policies
//! are responsible for never destroying a VM that is still under
//! preparation.

mod creation_priority;
mod pooling;
mod threshold;

pub use creation_priority::CreationPriorityPolicy;
pub use pooling::PoolingPolicy;
pub use threshold::ThresholdPolicy;

use std::str::FromStr;

use vinfra_cloud::Vm;
use vinfra_core::config::ScalingConfig;
use vinfra_core::error::{Result, SimError};
use vinfra_core::time::SimTime;

use crate::infra::VirtualInfra;

/// One autoscaling control law.
pub trait ScalingPolicy {
    fn name(&self) -> &'static str;

    /// One pass of the control loop.
    fn tick(&mut self, infra: &VirtualInfra, now: SimTime) -> Result<()>;
}

/// Mean hourly utilization over a pool snapshot.
pub(crate) fn mean_util(infra: &VirtualInfra, pool: &[Vm]) -> Result<f64> {
    if pool.is_empty() {
        return Ok(0.0);
    }
    let mut sum = 0.0;
    for vm in pool {
        sum += infra.hourly_util(vm)?;
    }
    Ok(sum / pool.len() as f64)
}

/// Selectable policy implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Threshold,
    CreationPriority,
    Pooling,
}

impl PolicyKind {
    pub fn build(&self, config: &ScalingConfig) -> Box<dyn ScalingPolicy> {
        match self {
            PolicyKind::Threshold => Box::new(ThresholdPolicy::new(config)),
            PolicyKind::CreationPriority => Box::new(CreationPriorityPolicy::new(config)),
            PolicyKind::Pooling => Box::new(PoolingPolicy::new(config)),
        }
    }
}

impl FromStr for PolicyKind {
    type Err = SimError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "threshold" => Ok(PolicyKind::Threshold),
            "creation-priority" => Ok(PolicyKind::CreationPriority),
            "pooling" => Ok(PolicyKind::Pooling),
            other => Err(SimError::InvalidParameter(format!(
                "unknown policy '{other}' (expected threshold, creation-priority or pooling)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_kind_from_str() {
        assert_eq!(
            "threshold".parse::<PolicyKind>().unwrap(),
            PolicyKind::Threshold
        );
        assert_eq!(
            "creation-priority".parse::<PolicyKind>().unwrap(),
            PolicyKind::CreationPriority
        );
        assert_eq!("pooling".parse::<PolicyKind>().unwrap(), PolicyKind::Pooling);
        assert!(matches!(
            "other".parse::<PolicyKind>(),
            Err(SimError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_policy_kind_builds_named_policy() {
        let config = ScalingConfig::default();
        assert_eq!(PolicyKind::Threshold.build(&config).name(), "threshold");
        assert_eq!(
            PolicyKind::CreationPriority.build(&config).name(),
            "creation-priority"
        );
        assert_eq!(PolicyKind::Pooling.build(&config).name(), "pooling");
    }
}

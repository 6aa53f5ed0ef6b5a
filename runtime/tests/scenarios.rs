//! End-to-end autoscaling scenarios over the full harness.

use std::rc::Rc;

use vinfra_cloud::VmState;
use vinfra_core::config::{SimConfig, GIB};
use vinfra_core::event::{events, EventEmitter};
use vinfra_core::job::{Job, JobRef};
use vinfra_core::time::{SimTime, HOUR, MINUTE};
use vinfra_runtime::policy::PolicyKind;
use vinfra_runtime::Harness;

fn job(id: &str, kind: &str, submit_ms: SimTime, exec_ms: SimTime) -> JobRef {
    Rc::new(Job::new(id, kind, submit_ms, exec_ms))
}

fn burst(kind: &str, count: usize, exec_ms: SimTime) -> Vec<JobRef> {
    (0..count)
        .map(|index| job(&format!("{kind}-{index}"), kind, 0, exec_ms))
        .collect()
}

fn build(policy: PolicyKind, config: SimConfig, jobs: Vec<JobRef>) -> Harness {
    let policy = policy.build(&config.scaling);
    Harness::build(config, policy, jobs, EventEmitter::new(4096)).unwrap()
}

/// Pooling policy on a cold start: the pool grows one request per tick
/// until the headroom of idle VMs is restored on top of the busy ones.
#[test]
fn pooling_pure_growth_restores_headroom() {
    let harness = build(
        PolicyKind::Pooling,
        SimConfig::default(),
        burst("A", 10, HOUR),
    );
    harness.start();

    // Half an hour in, the pool holds the busy VMs plus real headroom.
    harness.sim.simulate_until(30 * MINUTE).unwrap();
    let pool = harness.infra.pool("A");
    assert!(pool.len() >= 8, "pool stuck at {}", pool.len());

    // Steady state before the jobs finish: every job on its own VM and
    // exactly the headroom idle.
    harness.sim.simulate_until(50 * MINUTE).unwrap();
    let pool = harness.infra.pool("A");
    let unused = pool.iter().filter(|vm| vm.is_idle()).count();
    assert_eq!(pool.len() - unused, 10);
    assert_eq!(unused, 4);

    let report = {
        harness.sim.simulate_until_last_event().unwrap();
        harness.report()
    };
    assert_eq!(report.jobs_done, 10);
    assert_eq!(report.vms_live, 0);
}

/// Threshold policy destroys a singleton pool exactly on the 30th
/// consecutive idle observation, then retires the kind.
#[test]
fn threshold_idle_singleton_drops_on_schedule() {
    let harness = build(PolicyKind::Threshold, SimConfig::default(), Vec::new());
    harness.infra.register_kind("a");
    harness.infra.start_autoscaling();

    // Tick 1 (t=120 s) requests the VM; it is running well before tick 2
    // (t=240 s), where the idle grace starts counting.
    harness.sim.simulate_until(2 * MINUTE).unwrap();
    assert_eq!(harness.infra.pool("a").len(), 1);
    let vm = harness.infra.pool("a")[0].clone();

    // One tick before expiry the VM is still alive.
    let expiry = 2 * MINUTE + 30 * (2 * MINUTE);
    harness.sim.simulate_until(expiry - 1).unwrap();
    assert!(harness.infra.has_kind("a"));
    assert_eq!(harness.infra.pool("a").len(), 1);
    assert_eq!(vm.state(), VmState::Running);

    // The 30th idle tick lands at first_tick + 30 × 120 s.
    harness.sim.simulate_until(expiry).unwrap();
    assert!(!harness.infra.has_kind("a"));
    assert_eq!(vm.state(), VmState::Destroyed);
    assert_eq!(harness.infra.obsolete_kinds(), vec!["a".to_string()]);
}

/// A burst beyond pool capacity backs up in the retry queue, which then
/// drains monotonically to zero.
#[test]
fn burst_backs_up_queue_then_drains() {
    let mut config = SimConfig::default();
    // Enough park capacity that the pool never hits the placement wall.
    config.machines.count = 6;
    let harness = build(PolicyKind::Pooling, config, burst("B", 100, MINUTE));
    harness.start();

    harness.sim.simulate_until(MINUTE).unwrap();
    let backlog = harness.queue.total_len();
    assert!(backlog > 0, "burst should overflow into the queue");

    // Sample the backlog while the run drains: never increasing.
    let mut last = backlog;
    let mut at = MINUTE;
    while harness.queue.total_len() > 0 {
        at += MINUTE;
        assert!(at < 3 * HOUR, "queue failed to drain");
        harness.sim.simulate_until(at).unwrap();
        let len = harness.queue.total_len();
        assert!(len <= last, "queue grew from {last} to {len}");
        last = len;
    }

    harness.sim.simulate_until_last_event().unwrap();
    let report = harness.report();
    assert_eq!(report.jobs_done, 100);
    assert!(report.average_queue_ms > 0.0);
}

/// Tight appliance storage: a third kind evicts the oldest obsolete
/// appliance (FIFO), and the store never exceeds its two-slot capacity.
#[test]
fn storage_eviction_follows_fifo_order() {
    let mut config = SimConfig::default();
    config.storage.capacity_bytes = 2 * GIB;

    // Pools drain (and their kinds retire) well before the next kind
    // arrives two hours later.
    let jobs = vec![
        job("a-0", "A", 0, MINUTE),
        job("b-0", "B", 2 * HOUR, MINUTE),
        job("c-0", "C", 4 * HOUR, MINUTE),
    ];
    let emitter = EventEmitter::new(4096);
    let mut evictions = emitter.subscribe();
    let policy = PolicyKind::Threshold.build(&config.scaling);
    let harness = Harness::build(config, policy, jobs, emitter).unwrap();
    harness.start();

    let mut at = 0;
    while harness.sim.next_fire_time().is_some() {
        at += 10 * MINUTE;
        assert!(at < 8 * HOUR, "run failed to finish");
        harness.sim.simulate_until(at).unwrap();
        assert!(
            harness.cloud.repository().contents().len() <= 2,
            "repository over capacity"
        );
    }

    let mut contents = harness.cloud.repository().contents();
    contents.sort();
    assert_eq!(contents, vec!["B".to_string(), "C".to_string()]);

    let mut evicted = Vec::new();
    while let Ok(event) = evictions.try_recv() {
        if event.key == events::APPLIANCE_EVICTED {
            if let vinfra_core::event::EventPayload::String(kind) = event.payload {
                evicted.push(kind);
            }
        }
    }
    assert_eq!(evicted, vec!["A".to_string()]);

    assert_eq!(harness.progress.done_count(), 3);
}

/// Two identical runs with the same seed make identical randomized
/// eviction decisions, tick for tick.
#[test]
fn creation_priority_runs_are_deterministic() {
    fn pool_series(seed: u64) -> Vec<usize> {
        let mut config = SimConfig::default();
        config.scaling.seed = seed;
        let harness = build(
            PolicyKind::CreationPriority,
            config,
            vec![
                job("j-0", "aa", 0, 90 * MINUTE),
                job("j-1", "aa", MINUTE, 90 * MINUTE),
                job("j-2", "aa", 2 * MINUTE, 90 * MINUTE),
                job("j-3", "aa", 3 * MINUTE, 90 * MINUTE),
            ],
        );
        harness.start();

        let mut series = Vec::new();
        for tick in 1..=200u64 {
            harness.sim.simulate_until(tick * 2 * MINUTE).unwrap();
            series.push(harness.infra.pool("aa").len());
        }
        series
    }

    let first = pool_series(1234);
    let second = pool_series(1234);
    assert_eq!(first, second);
}

/// While a VM request is in flight, no duplicate request is issued for
/// the kind and the in-flight VM is never destroyed.
#[test]
fn under_prep_guard_blocks_duplicates_and_destruction() {
    let harness = build(PolicyKind::Pooling, SimConfig::default(), Vec::new());
    // Boot takes 10 control-loop ticks.
    harness.cloud.set_startup_latency(10 * 2 * MINUTE);
    harness.infra.register_kind("a");
    harness.infra.start_autoscaling();

    // Tick 1 requests the VM; it stays under prep for the next 10 ticks.
    harness.sim.simulate_until(2 * MINUTE).unwrap();
    assert_eq!(harness.cloud.vms_created(), 1);
    let vm = harness.infra.pool("a")[0].clone();
    assert!(harness.infra.kind_under_prep("a"));

    for tick in 2..=10u64 {
        harness.sim.simulate_until(tick * 2 * MINUTE).unwrap();
        assert_eq!(harness.cloud.vms_created(), 1, "duplicate request issued");
        assert_ne!(vm.state(), VmState::Destroyed, "in-flight vm destroyed");
        assert_eq!(harness.infra.pool("a").len(), 1);
    }

    // The VM lands at ~22 min (transfer + 10-tick boot); the pooling
    // policy then resumes growing the pool.
    harness.sim.simulate_until(25 * MINUTE).unwrap();
    assert!(!harness.infra.is_under_prep(&vm));
    assert!(harness.cloud.vms_created() >= 2);
}

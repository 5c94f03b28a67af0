//! End-to-end pipeline scenarios on a single core.

mod common;

use cmpsim_core::stats::Stat;
use cmpsim_core::frontend::TraceBuilder;

use common::*;

#[test]
fn test_straight_line_trace_retires_everything() {
    // 100 ops, no control flow: everything retires, nothing recovers
    let (summary, sim) = run_trace(test_params(), vec![straight_line(0x1000, 100)]);

    assert_eq!(summary.inst_counts, vec![100]);
    assert_eq!(summary.uop_counts, vec![100]);
    let stats = &sim.cores[0].stats;
    assert_eq!(stats.get(Stat::Recoveries), 0);
    assert_eq!(stats.get(Stat::Redirects), 0);
    // every in-flight op was freed
    assert_eq!(sim.cores[0].pool.active_ops(), 0);
    assert!(summary.cycles > 0);
}

#[test]
fn test_straight_line_perfect_icache_is_faster() {
    let mut fast = test_params();
    fast.memory.perfect_icache = true;
    let (with_perfect, _) = run_trace(fast, vec![straight_line(0x1000, 200)]);
    let (with_misses, _) = run_trace(test_params(), vec![straight_line(0x1000, 200)]);
    assert!(with_perfect.cycles < with_misses.cycles);
}

#[test]
fn test_single_conditional_mispredict_recovers() {
    // ops 1..=4 straight line, op 5 a taken branch the cold predictor
    // gets wrong, then the trace resumes at the target
    let mut b = TraceBuilder::new();
    for i in 0..4 {
        b = b.plain(0x1000 + i * 4);
    }
    b = cbr(b, 0x1010, true, 0x5000);
    for i in 0..5 {
        b = b.plain(0x5000 + i * 4);
    }
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);

    assert_eq!(summary.inst_counts, vec![10]);
    let stats = &sim.cores[0].stats;
    assert_eq!(stats.get(Stat::BpMispred), 1);
    assert_eq!(stats.get(Stat::Recoveries), 1);
    assert_eq!(sim.cores[0].pool.active_ops(), 0);
}

#[test]
fn test_not_taken_branch_to_fall_through_is_clean() {
    // boundary: a branch whose target equals its fall-through can never
    // mispredict or misfetch, whatever the direction prediction
    let mut b = TraceBuilder::new();
    b = b.plain(0x1000);
    b = cbr(b, 0x1004, true, 0x1008);
    b = b.plain(0x1008);
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);

    assert_eq!(summary.inst_counts, vec![3]);
    let stats = &sim.cores[0].stats;
    assert_eq!(stats.get(Stat::BpMispred), 0);
    assert_eq!(stats.get(Stat::BpMisfetch), 0);
    assert_eq!(stats.get(Stat::Recoveries), 0);
}

#[test]
fn test_fetch_barrier_drains_and_resumes() {
    // a system call breaks the packet, waits for the machine to drain,
    // then fetch resumes at the committed next PC
    let mut b = TraceBuilder::new();
    for i in 0..11 {
        b = b.plain(0x1000 + i * 4);
    }
    b = syscall(b, 0x1000 + 11 * 4);
    for i in 12..16 {
        b = b.plain(0x1000 + i * 4);
    }
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);

    assert_eq!(summary.inst_counts, vec![16]);
    let stats = &sim.cores[0].stats;
    // the barrier must not look like a misprediction
    assert_eq!(stats.get(Stat::Recoveries), 0);
    assert_eq!(stats.get(Stat::Redirects), 0);
    assert_eq!(sim.cores[0].pool.active_ops(), 0);
}

#[test]
fn test_dependent_chain_retires_in_order() {
    // a chain of register-dependent ops: r5 <- r5 + ... repeatedly
    let mut b = TraceBuilder::new();
    for i in 0..20 {
        b = b.op(|r| {
            r.addr = 0x2000 + i * 4;
            r.npc = r.addr + 4;
            r.srcs = vec![5];
            r.dests = vec![5];
        });
    }
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);
    assert_eq!(summary.uop_counts, vec![20]);
    assert_eq!(sim.cores[0].pool.active_ops(), 0);
}

#[test]
fn test_tiny_window_makes_progress() {
    // boundary B4: a one-wide window with tiny RSes stalls but never
    // deadlocks or trips an invariant
    let mut params = test_params();
    params.core.node_table_size = 4;
    params.core.rs_sizes = "2,2,2,2".into();
    params.core.issue_width = 2;
    let (summary, sim) = run_trace(params, vec![straight_line(0x1000, 50)]);
    assert_eq!(summary.uop_counts, vec![50]);
    assert!(sim.cores[0].stats.get(Stat::FullWindowStalls) > 0);
}

#[test]
fn test_loads_and_stores_complete() {
    let mut b = TraceBuilder::new();
    b = store(b, 0x1000, 0x8000);
    b = load(b, 0x1004, 0x8000); // forwarded from the store
    b = load(b, 0x1008, 0x9000); // independent miss
    for i in 3..8 {
        b = b.plain(0x1000 + i * 4);
    }
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);
    assert_eq!(summary.uop_counts, vec![8]);
    let stats = &sim.cores[0].stats;
    assert!(stats.get(Stat::DcacheMiss) >= 1);
    assert_eq!(sim.cores[0].pool.active_ops(), 0);
}

#[test]
fn test_inst_limit_stops_the_run() {
    let mut params = test_params();
    params.general.inst_limit = "10".into();
    let (summary, _) = run_trace(params, vec![straight_line(0x1000, 100)]);
    assert!(summary.inst_counts[0] >= 10);
    assert!(summary.inst_counts[0] < 100);
}

#[test]
fn test_sim_limit_cycle_trigger_stops_the_run() {
    let mut params = test_params();
    params.general.sim_limit = "c:50".into();
    let (summary, _) = run_trace(params, vec![straight_line(0x1000, 10_000)]);
    assert_eq!(summary.cycles, 50);
}

#[test]
fn test_two_cores_run_independent_programs() {
    let mut params = test_params();
    params.general.num_cores = 2;
    // core 1 addresses carry the core tag in their top bits
    let tag = |a: u64| cmpsim_core::common::tag_addr(1, a);
    let mut b1 = TraceBuilder::new();
    for i in 0..30 {
        b1 = b1.plain(tag(0x4000 + i * 4));
    }
    let programs = vec![straight_line(0x1000, 60), b1.build()];
    let (summary, sim) = run_trace(params, programs);

    assert_eq!(summary.inst_counts, vec![60, 30]);
    assert_eq!(sim.cores[0].pool.active_ops(), 0);
    assert_eq!(sim.cores[1].pool.active_ops(), 0);
    // the short core finished first and reran in bogus mode with frozen
    // stats
    assert!(sim.cores[1].stats.is_frozen());
    assert!(sim.cores[1].inst_count >= 30);
}

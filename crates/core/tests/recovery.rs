//! Recovery, redirect and late-predictor scenarios.

mod common;

use cmpsim_core::frontend::TraceBuilder;
use cmpsim_core::common::FatalError;
use cmpsim_core::frontend::TraceFrontend;
use cmpsim_core::stats::Stat;
use cmpsim_core::SimLoop;

use common::*;

#[test]
fn test_btb_miss_indirect_branch_redirects_without_flush() {
    // op 7 is an indirect branch with no BTB entry: fetch waits for the
    // resolved target, no recovery is needed
    let mut b = TraceBuilder::new();
    for i in 0..6 {
        b = b.plain(0x1000 + i * 4);
    }
    b = ibr(b, 0x1000 + 6 * 4, 0x7000);
    for i in 0..4 {
        b = b.plain(0x7000 + i * 4);
    }
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);

    assert_eq!(summary.inst_counts, vec![11]);
    let stats = &sim.cores[0].stats;
    assert_eq!(stats.get(Stat::Recoveries), 0);
    assert!(stats.get(Stat::Redirects) >= 1);
    assert_eq!(stats.get(Stat::IbtbMiss), 1);
    assert_eq!(sim.cores[0].pool.active_ops(), 0);
}

#[test]
fn test_trained_indirect_branch_stops_redirecting() {
    // the same indirect branch twice: the second instance hits both the
    // BTB and the target cache
    let mut b = TraceBuilder::new();
    b = ibr(b, 0x1000, 0x7000);
    b = b.plain(0x7000);
    b = ibr(b, 0x7004, 0x1008);
    b = b.plain(0x1008);
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);
    assert_eq!(summary.inst_counts, vec![4]);
    assert!(sim.cores[0].stats.get(Stat::IbtbHit) <= 2);
}

#[test]
fn test_late_predictor_recovery_to_correct_path() {
    // the same branch twice: the first instance trains the late gshare
    // (and pays a full recovery); on the second the early static
    // predictor is wrong but the late predictor is right, so the machine
    // recovers after the late latency without waiting for execute
    let mut params = test_params();
    params.bp.bp_mech = "static".into();
    params.bp.late_bp_mech = "gshare".into();
    params.bp.late_bp_latency = 3;
    // fold history out of the index so the retrained branch hits the
    // same pattern-table entry after the intervening recoveries
    params.bp.global_hist_length = 1;

    let mut b = TraceBuilder::new();
    b = cbr(b, 0x1000, true, 0x5000); // trains gshare toward taken
    b = b.plain(0x5000);
    b = cbr(b, 0x5004, true, 0x1000); // back edge to re-run the branch
    b = cbr(b, 0x1000, true, 0x5000); // same static branch, late BP right
    b = b.plain(0x5000);
    b = b.plain(0x5004);
    let (summary, sim) = run_trace(params, vec![b.build()]);

    assert_eq!(summary.inst_counts, vec![6]);
    let stats = &sim.cores[0].stats;
    assert!(stats.get(Stat::LateBpRecoveries) >= 1);
    assert_eq!(sim.cores[0].pool.active_ops(), 0);
}

#[test]
fn test_call_return_stack_predicts_returns() {
    // a matched call/return pair: the CRS supplies the return target, so
    // nothing mispredicts and nothing recovers
    let mut b = TraceBuilder::new();
    b = b.plain(0x1000);
    b = call(b, 0x1004, 0x8000);
    b = b.plain(0x8000);
    b = b.plain(0x8004);
    b = ret(b, 0x8008, 0x1008); // returns to call + 4
    b = b.plain(0x1008);
    b = b.plain(0x100c);
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);

    assert_eq!(summary.inst_counts, vec![7]);
    let stats = &sim.cores[0].stats;
    assert_eq!(stats.get(Stat::Recoveries), 0);
    assert_eq!(stats.get(Stat::BpMispred), 0);
    assert_eq!(stats.get(Stat::BpMisfetch), 0);
    assert!(stats.get(Stat::CrsPush) >= 1);
    assert!(stats.get(Stat::CrsPop) >= 1);
}

#[test]
fn test_nested_calls_unwind_in_order() {
    let mut b = TraceBuilder::new();
    b = call(b, 0x1000, 0x2000); // outer
    b = call(b, 0x2000, 0x3000); // inner
    b = b.plain(0x3000);
    b = ret(b, 0x3004, 0x2004); // back to inner caller
    b = ret(b, 0x2004, 0x1004); // back to outer caller
    b = b.plain(0x1004);
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);
    assert_eq!(summary.inst_counts, vec![6]);
    assert_eq!(sim.cores[0].stats.get(Stat::BpMisfetch), 0);
}

#[test]
fn test_ideal_crs_mode_also_predicts() {
    let mut params = test_params();
    params.bp.crs_realistic = false;
    let mut b = TraceBuilder::new();
    b = call(b, 0x1000, 0x8000);
    b = b.plain(0x8000);
    b = ret(b, 0x8004, 0x1004);
    b = b.plain(0x1004);
    let (summary, sim) = run_trace(params, vec![b.build()]);
    assert_eq!(summary.inst_counts, vec![4]);
    assert_eq!(sim.cores[0].stats.get(Stat::BpMisfetch), 0);
}

#[test]
fn test_two_mispredicts_keep_earliest_recovery() {
    // two branches mispredict back to back; everything still converges
    // to exactly the trace's instruction count
    let mut b = TraceBuilder::new();
    b = cbr(b, 0x1000, true, 0x5000);
    b = cbr(b, 0x5000, true, 0x9000);
    for i in 0..6 {
        b = b.plain(0x9000 + i * 4);
    }
    let (summary, sim) = run_trace(test_params(), vec![b.build()]);
    assert_eq!(summary.inst_counts, vec![8]);
    assert!(sim.cores[0].stats.get(Stat::Recoveries) >= 1);
    assert_eq!(sim.cores[0].pool.active_ops(), 0);
}

#[test]
fn test_forward_progress_watchdog_fires() {
    // with a memory system that never answers, the I-cache miss never
    // fills and the watchdog must abort the run with a diagnostic
    let mut params = test_params();
    params.general.forward_progress_limit = 500;
    params.general.forward_progress_interval = 100;
    let frontend = Box::new(TraceFrontend::new(vec![straight_line(0x1000, 50)]));
    let memory = Box::new(BlackholeMemory);
    let mut sim = SimLoop::new(params, frontend, memory).unwrap();

    let err = sim.run().unwrap_err();
    match err {
        FatalError::ForwardProgress { proc_id, .. } => assert_eq!(proc_id, 0),
        other => panic!("expected a forward-progress failure, got {other}"),
    }
}

#[test]
fn test_clear_stats_trigger_resets_counters() {
    let mut params = test_params();
    params.general.clear_stats = "i:50".into();
    params.memory.perfect_icache = true;
    let (summary, sim) = run_trace(params, vec![straight_line(0x1000, 100)]);
    assert_eq!(summary.inst_counts, vec![100]);
    // the fetched-op counter restarted mid-run, so it is well below the
    // full program length
    assert!(sim.cores[0].stats.get(Stat::OpsFetched) < 100);
}

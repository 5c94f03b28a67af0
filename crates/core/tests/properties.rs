//! Property-based checks over randomized programs and predictor state.

mod common;

use proptest::prelude::*;

use cmpsim_core::Params;
use cmpsim_core::bp::BpData;
use cmpsim_core::frontend::TraceBuilder;
use cmpsim_core::stats::CoreStats;
use cmpsim_core::uop::{CfType, InstInfo, OpPool, TableInfo};

use common::*;

/// A random but address-consistent program: blocks of straight-line code
/// joined by taken branches to fresh regions.
fn arb_program() -> impl Strategy<Value = Vec<cmpsim_core::frontend::trace::TraceRecord>> {
    prop::collection::vec(1usize..6, 1..8).prop_map(|block_lens| {
        let mut b = TraceBuilder::new();
        let mut base: u64 = 0x1000;
        let last = block_lens.len() - 1;
        for (i, len) in block_lens.iter().enumerate() {
            for k in 0..*len {
                b = b.plain(base + (k as u64) * 4);
            }
            let branch_addr = base + (*len as u64) * 4;
            if i != last {
                let next_base = base + 0x1000;
                b = cbr(b, branch_addr, true, next_base);
                base = next_base;
            } else {
                b = b.plain(branch_addr);
            }
        }
        b.build()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every on-path op of any program retires exactly once, whatever the
    /// branch outcomes did to the pipeline in between, and no op leaks.
    #[test]
    fn prop_every_program_drains_completely(program in arb_program()) {
        let expected = program.len() as u64;
        let (summary, sim) = run_trace(test_params(), vec![program]);
        prop_assert_eq!(summary.inst_counts[0], expected);
        prop_assert_eq!(summary.uop_counts[0], expected);
        prop_assert_eq!(sim.cores[0].pool.active_ops(), 0);
        // retirement pointer and counters agree
        prop_assert_eq!(sim.cores[0].node.node_count, 0);
    }

    /// The global-history rollback bijection: recovering a conditional
    /// branch yields the snapshot shifted with the resolved direction;
    /// any other CF type restores the snapshot verbatim.
    #[test]
    fn prop_ghist_rollback_formula(
        hist in any::<u32>(),
        wrong_path_hist in any::<u32>(),
        dir in any::<bool>(),
    ) {
        let params = Params::default();
        let mut bp = BpData::new(0, &params).unwrap();
        let mut stats = CoreStats::new(0);
        let mut pool = OpPool::new(0);

        let id = pool.alloc(1, 1, 1).unwrap();
        {
            let op = pool.get_mut(id);
            op.inst = std::rc::Rc::new(InstInfo {
                addr: 0x1000,
                size: 4,
                table: TableInfo { cf_type: CfType::Cbr, ..TableInfo::default() },
                srcs: vec![],
                dests: vec![],
            });
            op.oracle.dir = dir;
            op.oracle.target = 0x9000;
            op.oracle.npc = if dir { 0x9000 } else { 0x1004 };
        }

        bp.global_hist = hist;
        bp.predict_op(pool.get_mut(id), 0, 0x1000, &mut stats);
        let info = pool.get(id).recovery_info;
        prop_assert_eq!(info.pred_global_hist, hist);

        // arbitrary wrong-path damage, then the rollback
        bp.global_hist = wrong_path_hist;
        bp.recover_op(CfType::Cbr, &info);
        prop_assert_eq!(bp.global_hist, (hist >> 1) | ((dir as u32) << 31));

        bp.global_hist = wrong_path_hist;
        bp.recover_op(CfType::Ret, &info);
        prop_assert_eq!(bp.global_hist, hist);
    }

    /// The realistic call-return stack restores its pointers exactly from
    /// any snapshot, regardless of wrong-path pushes and pops after it.
    #[test]
    fn prop_crs_snapshot_restores_pointers(
        on_path_pushes in 0usize..6,
        wrong_ops in prop::collection::vec(any::<bool>(), 0..12),
    ) {
        use cmpsim_core::bp::Crs;
        use cmpsim_core::uop::RecoveryInfo;

        let mut crs = Crs::new(8, true);
        for i in 0..on_path_pushes {
            crs.push(0x1000 + i as u64 * 4, false);
        }
        let info = RecoveryInfo {
            crs_tos: crs.tos,
            crs_next: crs.next,
            crs_depth: crs.depth,
            ..RecoveryInfo::default()
        };
        for push in wrong_ops {
            if push {
                crs.push(0xbad0, true);
            } else {
                let _ = crs.pop(true);
            }
        }
        crs.recover(&info);
        prop_assert_eq!(crs.tos, info.crs_tos);
        prop_assert_eq!(crs.next, info.crs_next);
        prop_assert_eq!(crs.depth, info.crs_depth);
    }
}

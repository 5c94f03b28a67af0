//! Recovery and redirect scheduling.
//!
//! Each core carries one single-slot "earliest pending" recovery record and
//! one redirect record. A recovery rolls the whole pipeline back to the
//! correct path of the offending op; a redirect only restarts fetch once a
//! BTB-missing op's target resolves. Both slots keep only the *earliest*
//! offender: a newer op never displaces a pending record for an older op.

use tracing::debug;

use crate::common::{Addr, Counter, MAX_CTR, ProcId, SimResult};
use crate::config::BpParams;
use crate::ensure;
use crate::uop::{CfType, Op, OpId, RecoveryInfo};

/// Pending recovery/redirect state of one core.
#[derive(Debug)]
pub struct BpRecoveryInfo {
    /// Owning core.
    pub proc_id: ProcId,

    /// Cycle at which the pending recovery fires ([`MAX_CTR`] = none).
    pub recovery_cycle: Counter,
    /// Address fetch restarts from after the recovery.
    pub recovery_fetch_addr: Addr,
    /// Op number of the recovering op.
    pub recovery_op_num: Counter,
    /// Control-flow type of the recovering op.
    pub recovery_cf_type: CfType,
    /// Predictor-state snapshot used for the rollback.
    pub recovery_info: RecoveryInfo,
    /// Whether the machine stays off-path after the recovery.
    pub recovery_force_offpath: bool,
    /// Unique number of the recovering op.
    pub recovery_unique_num: Counter,
    /// Front-end uid of the recovering instruction.
    pub recovery_inst_uid: u64,
    /// Handle of the recovering op (paired with its unique number).
    pub recovery_op: Option<(OpId, Counter)>,
    /// The recovery was scheduled by the late predictor.
    pub late_bp_recovery: bool,
    /// The late predictor itself was wrong (recovery to its wrong target).
    pub late_bp_recovery_wrong: bool,

    /// Cycle at which the pending redirect fires ([`MAX_CTR`] = none).
    pub redirect_cycle: Counter,
    /// Op number of the redirecting op.
    pub redirect_op_num: Counter,
    /// Predicted next PC of the redirecting op (known once it resolves).
    pub redirect_fetch_addr: Addr,
    /// Handle of the redirecting op (paired with its unique number).
    pub redirect_op: Option<(OpId, Counter)>,
    /// Whether the machine remains wrong-path after the redirect (the
    /// redirecting op was itself off-path or mispredicted).
    pub redirect_wrong_path: bool,
}

impl BpRecoveryInfo {
    /// Creates an empty record for one core.
    pub fn new(proc_id: ProcId) -> Self {
        Self {
            proc_id,
            recovery_cycle: MAX_CTR,
            recovery_fetch_addr: 0,
            recovery_op_num: 0,
            recovery_cf_type: CfType::NotCf,
            recovery_info: RecoveryInfo::default(),
            recovery_force_offpath: false,
            recovery_unique_num: 0,
            recovery_inst_uid: 0,
            recovery_op: None,
            late_bp_recovery: false,
            late_bp_recovery_wrong: false,
            redirect_cycle: MAX_CTR,
            redirect_op_num: 0,
            redirect_fetch_addr: 0,
            redirect_op: None,
            redirect_wrong_path: false,
        }
    }

    /// Whether a recovery is pending.
    #[inline]
    pub fn recovery_pending(&self) -> bool {
        self.recovery_cycle != MAX_CTR
    }

    /// Whether a redirect is pending.
    #[inline]
    pub fn redirect_pending(&self) -> bool {
        self.redirect_cycle != MAX_CTR
    }

    /// Records a recovery for `op`, keeping only the earliest offender.
    ///
    /// The pipeline reacts at `cycle + 1 + extra_recovery_cycles`, or after
    /// `late_bp_latency` for late-predictor recoveries. With
    /// `force_offpath` (late predictor itself wrong) the fetch target is
    /// the late prediction instead of the oracle next PC.
    pub fn schedule_recovery(
        &mut self,
        op: &mut Op,
        op_id: OpId,
        cycle: Counter,
        late_bp_recovery: bool,
        force_offpath: bool,
        params: &BpParams,
    ) -> SimResult<()> {
        ensure!(
            self.proc_id == op.proc_id,
            self.proc_id,
            "recovery scheduled across cores (op core {})",
            op.proc_id
        );
        if self.recovery_pending() && op.op_num > self.recovery_op_num {
            return Ok(());
        }

        let latency = if late_bp_recovery {
            params.late_bp_latency
        } else {
            1 + params.extra_recovery_cycles
        };
        ensure!(
            !op.pred.recovery_sch,
            self.proc_id,
            "op {} scheduled a second recovery",
            op.op_num
        );
        op.pred.recovery_sch = true;

        debug!(
            target: "bp",
            proc = self.proc_id,
            op_num = op.op_num,
            addr = format_args!("{:#x}", op.inst.addr),
            next_fetch = format_args!("{:#x}", op.oracle.npc),
            off_path = op.off_path,
            late = late_bp_recovery,
            "recovery signaled"
        );

        self.recovery_cycle = cycle + latency;
        self.recovery_fetch_addr = op.oracle.npc;
        self.recovery_op_num = op.op_num;
        self.recovery_cf_type = op.inst.table.cf_type;
        self.recovery_info = op.recovery_info;
        self.recovery_info.op_num = op.op_num;
        self.recovery_force_offpath = op.off_path;
        self.recovery_unique_num = op.unique_num;
        self.recovery_inst_uid = op.inst_uid;
        self.recovery_op = Some((op_id, op.unique_num));
        self.late_bp_recovery = late_bp_recovery;

        if force_offpath {
            ensure!(
                late_bp_recovery,
                self.proc_id,
                "forced-off-path recovery outside the late predictor"
            );
            self.recovery_fetch_addr = op.pred.late_pred_npc;
            self.recovery_info.new_dir = op.pred.late_pred;
            self.recovery_force_offpath = true;
            self.late_bp_recovery_wrong = true;
        } else {
            self.late_bp_recovery_wrong = false;
        }
        Ok(())
    }

    /// Records a redirect for `op` (a fetch-stalling op such as a BTB
    /// miss), keeping only the earliest offender. System calls pay the
    /// extra call-system latency.
    pub fn schedule_redirect(
        &mut self,
        op: &mut Op,
        op_id: OpId,
        cycle: Counter,
        use_late_bp: bool,
        params: &BpParams,
    ) -> SimResult<()> {
        ensure!(
            self.proc_id == op.proc_id,
            self.proc_id,
            "redirect scheduled across cores (op core {})",
            op.proc_id
        );
        if self.redirect_pending() && op.op_num >= self.redirect_op_num {
            return Ok(());
        }
        debug!(
            target: "bp",
            proc = self.proc_id,
            op_num = op.op_num,
            addr = format_args!("{:#x}", op.inst.addr),
            "redirect signaled"
        );
        self.redirect_cycle = cycle
            + 1
            + params.extra_redirect_cycles
            + if op.inst.table.cf_type == CfType::Sys {
                params.extra_callsys_cycles
            } else {
                0
            };
        self.redirect_op_num = op.op_num;
        self.redirect_fetch_addr = op.pred.pred_npc;
        self.redirect_op = Some((op_id, op.unique_num));
        self.redirect_wrong_path = op.off_path
            || op.pred.mispred
            || op.pred.misfetch
            || (use_late_bp && (op.pred.late_mispred || op.pred.late_misfetch));
        op.redirect_scheduled = true;
        Ok(())
    }

    /// Clears the recovery slot after it fires.
    pub fn clear_recovery(&mut self) {
        self.recovery_cycle = MAX_CTR;
    }

    /// Clears the redirect slot after it fires.
    pub fn clear_redirect(&mut self) {
        self.redirect_cycle = MAX_CTR;
    }

    /// Clears both slots (bogus-mode restart).
    pub fn reset(&mut self) {
        self.clear_recovery();
        self.clear_redirect();
        self.late_bp_recovery = false;
        self.late_bp_recovery_wrong = false;
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::uop::{InstInfo, OpPool, TableInfo};

    use super::*;

    fn cf_op(pool: &mut OpPool, op_num: Counter, cf_type: CfType, npc: Addr) -> crate::uop::OpId {
        let id = pool.alloc(op_num, op_num, op_num).unwrap();
        pool.get_mut(id).inst = Rc::new(InstInfo {
            addr: 0x1000,
            size: 4,
            table: TableInfo {
                cf_type,
                ..TableInfo::default()
            },
            srcs: vec![],
            dests: vec![],
        });
        pool.get_mut(id).oracle.npc = npc;
        id
    }

    #[test]
    fn test_recovery_latency() {
        let params = BpParams {
            extra_recovery_cycles: 2,
            ..BpParams::default()
        };
        let mut pool = OpPool::new(0);
        let mut rec = BpRecoveryInfo::new(0);
        let id = cf_op(&mut pool, 5, CfType::Cbr, 0x2000);
        rec.schedule_recovery(pool.get_mut(id), id, 100, false, false, &params)
            .unwrap();
        assert_eq!(rec.recovery_cycle, 103);
        assert_eq!(rec.recovery_fetch_addr, 0x2000);
        assert_eq!(rec.recovery_op_num, 5);
        assert!(pool.get(id).pred.recovery_sch);
    }

    #[test]
    fn test_older_recovery_wins() {
        let params = BpParams::default();
        let mut pool = OpPool::new(0);
        let mut rec = BpRecoveryInfo::new(0);
        let older = cf_op(&mut pool, 3, CfType::Cbr, 0x3000);
        let younger = cf_op(&mut pool, 9, CfType::Cbr, 0x9000);
        rec.schedule_recovery(pool.get_mut(older), older, 10, false, false, &params)
            .unwrap();
        rec.schedule_recovery(pool.get_mut(younger), younger, 10, false, false, &params)
            .unwrap();
        assert_eq!(rec.recovery_op_num, 3);
        assert_eq!(rec.recovery_fetch_addr, 0x3000);
        // the younger op never marked itself scheduled
        assert!(!pool.get(younger).pred.recovery_sch);
    }

    #[test]
    fn test_older_op_replaces_pending_recovery() {
        let params = BpParams::default();
        let mut pool = OpPool::new(0);
        let mut rec = BpRecoveryInfo::new(0);
        let younger = cf_op(&mut pool, 9, CfType::Cbr, 0x9000);
        let older = cf_op(&mut pool, 3, CfType::Cbr, 0x3000);
        rec.schedule_recovery(pool.get_mut(younger), younger, 10, false, false, &params)
            .unwrap();
        rec.schedule_recovery(pool.get_mut(older), older, 10, false, false, &params)
            .unwrap();
        assert_eq!(rec.recovery_op_num, 3);
    }

    #[test]
    fn test_late_recovery_to_wrong_target() {
        let params = BpParams {
            late_bp_latency: 3,
            ..BpParams::default()
        };
        let mut pool = OpPool::new(0);
        let mut rec = BpRecoveryInfo::new(0);
        let id = cf_op(&mut pool, 4, CfType::Cbr, 0x2000);
        {
            let op = pool.get_mut(id);
            op.pred.late_pred = true;
            op.pred.late_pred_npc = 0x5000;
        }
        rec.schedule_recovery(pool.get_mut(id), id, 50, true, true, &params)
            .unwrap();
        assert_eq!(rec.recovery_cycle, 53);
        assert_eq!(rec.recovery_fetch_addr, 0x5000);
        assert!(rec.recovery_force_offpath);
        assert!(rec.late_bp_recovery_wrong);
    }

    #[test]
    fn test_redirect_callsys_latency() {
        let params = BpParams {
            extra_redirect_cycles: 1,
            extra_callsys_cycles: 10,
            ..BpParams::default()
        };
        let mut pool = OpPool::new(0);
        let mut rec = BpRecoveryInfo::new(0);
        let sys = cf_op(&mut pool, 2, CfType::Sys, 0x2000);
        pool.get_mut(sys).pred.pred_npc = 0x2000;
        rec.schedule_redirect(pool.get_mut(sys), sys, 7, false, &params).unwrap();
        assert_eq!(rec.redirect_cycle, 7 + 1 + 1 + 10);
        assert!(pool.get(sys).redirect_scheduled);
    }

    #[test]
    fn test_double_recovery_on_same_op_is_fatal() {
        let params = BpParams::default();
        let mut pool = OpPool::new(0);
        let mut rec = BpRecoveryInfo::new(0);
        let id = cf_op(&mut pool, 5, CfType::Cbr, 0x2000);
        rec.schedule_recovery(pool.get_mut(id), id, 10, false, false, &params)
            .unwrap();
        assert!(
            rec.schedule_recovery(pool.get_mut(id), id, 11, false, false, &params)
                .is_err()
        );
    }
}

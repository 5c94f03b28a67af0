//! Decode stage: a fixed-depth shift register between fetch and map.
//!
//! Each sub-stage advances into the next one only when that one is empty;
//! the deepest sub-stage pulls from the I-cache exit buffer. At the exit
//! sub-stage the targets of *direct* control-flow ops become known: a
//! direct op that missed in the BTB writes its entry and schedules the
//! redirect that releases the parked fetch stage. (Indirect targets only
//! resolve at execute.)

use crate::common::{Counter, SimResult};
use crate::config::Params;
use crate::model::PerCore;

use super::StageData;

/// Decode pipeline: `sds[0]` is the exit (oldest) sub-stage.
#[derive(Debug)]
pub struct DecodeStage {
    /// Sub-stage buffers, exit first.
    pub sds: Vec<StageData>,
}

impl DecodeStage {
    /// Builds a decode pipeline of `decode_cycles` sub-stages.
    pub fn new(params: &Params) -> Self {
        let depth = params.core.decode_cycles;
        let width = params.core.issue_width;
        Self {
            sds: (0..depth)
                .map(|i| StageData::new(format!("decode {}", depth - i - 1), width))
                .collect(),
        }
    }

    /// The sub-stage the node-side consumer reads from.
    #[inline]
    pub fn last_sd(&mut self) -> &mut StageData {
        &mut self.sds[0]
    }

    /// Clears every sub-stage without freeing ops (bogus-mode restart
    /// frees them through the in-flight list).
    pub fn reset(&mut self) {
        for sd in &mut self.sds {
            sd.reset();
        }
    }
}

impl PerCore {
    /// Advances the decode shift register by one cycle.
    pub fn update_decode_stage(&mut self, cycle: Counter) -> SimResult<()> {
        let depth = self.decode.sds.len();
        let stalled = self.decode.sds[0].op_count > 0;

        // advance the interior sub-stages toward the exit
        for i in 0..depth - 1 {
            if self.decode.sds[i].op_count != 0 {
                continue;
            }
            let (front, back) = self.decode.sds.split_at_mut(i + 1);
            front[i].take_from(&mut back[0]);
        }

        // the deepest sub-stage pulls from the I-cache exit buffer
        if self.decode.sds[depth - 1].op_count == 0 && self.icache.sd.op_count != 0 {
            self.decode.sds[depth - 1].take_from(&mut self.icache.sd);
        }

        // ops already sitting in a stalled exit were processed on arrival
        if stalled {
            return Ok(());
        }

        // direct-branch targets are known here; a BTB-missing direct op
        // writes its entry and redirects the parked fetch stage
        for id in self.decode.sds[0].iter_ops().collect::<Vec<_>>() {
            let needs_redirect = {
                let op = self.pool.get(id);
                let cf = op.inst.table.cf_type;
                cf.is_cf()
                    && !cf.is_indirect_class()
                    && op.pred.btb_miss
                    && !op.pred.btb_miss_resolved
            };
            if needs_redirect {
                self.bp.target_known_op(self.pool.get_mut(id));
                let use_late = self.bp.use_late_bp();
                self.bp_recovery.schedule_redirect(
                    self.pool.get_mut(id),
                    id,
                    cycle,
                    use_late,
                    &self.params.bp,
                )?;
            }
        }
        Ok(())
    }

    /// Flushes wrong-path ops out of the decode stage during a recovery.
    pub fn recover_decode_stage(&mut self) -> SimResult<()> {
        let recovery_op_num = self.bp_recovery.recovery_op_num;
        for stage_idx in 0..self.decode.sds.len() {
            let width = self.decode.sds[stage_idx].ops.len();
            let mut keep = 0;
            for slot in 0..width {
                let Some(id) = self.decode.sds[stage_idx].ops[slot] else {
                    continue;
                };
                self.decode.sds[stage_idx].ops[slot] = None;
                if Self::flushes(recovery_op_num, self.pool.get(id).op_num) {
                    self.free_op(id)?;
                } else {
                    // collapse survivors to the front of the row
                    self.decode.sds[stage_idx].ops[keep] = Some(id);
                    keep += 1;
                }
            }
            self.decode.sds[stage_idx].op_count = keep;
        }
        Ok(())
    }
}

//! Map stage: a fixed-depth shift register ending in register rename.
//!
//! Structurally identical to decode, but ops reaching the tail sub-stage
//! are renamed exactly once: each source is wired to its latest in-flight
//! writer through the wake-up graph, memory dependences are recorded, and
//! each destination installs the op as its latest writer. If the tail is
//! stalled (the node stage could not drain it), the ops are not
//! re-processed.

use crate::common::SimResult;
use crate::config::Params;
use crate::model::PerCore;

use super::StageData;

/// Map pipeline: `sds[0]` is the exit (rename) sub-stage.
#[derive(Debug)]
pub struct MapStage {
    /// Sub-stage buffers, exit first.
    pub sds: Vec<StageData>,
}

impl MapStage {
    /// Builds a map pipeline of `map_cycles` sub-stages.
    pub fn new(params: &Params) -> Self {
        let depth = params.core.map_cycles;
        let width = params.core.issue_width;
        Self {
            sds: (0..depth)
                .map(|i| StageData::new(format!("map {}", depth - i - 1), width))
                .collect(),
        }
    }

    /// The sub-stage the node stage issues from.
    #[inline]
    pub fn last_sd(&mut self) -> &mut StageData {
        &mut self.sds[0]
    }

    /// Clears every sub-stage without freeing ops.
    pub fn reset(&mut self) {
        for sd in &mut self.sds {
            sd.reset();
        }
    }
}

impl PerCore {
    /// Advances the map shift register and renames ops entering the tail.
    pub fn update_map_stage(&mut self, cycle: crate::common::Counter) -> SimResult<()> {
        let depth = self.map_stage.sds.len();
        let stalled = self.map_stage.sds[0].op_count > 0;

        for i in 0..depth - 1 {
            if self.map_stage.sds[i].op_count != 0 {
                continue;
            }
            let (front, back) = self.map_stage.sds.split_at_mut(i + 1);
            front[i].take_from(&mut back[0]);
        }

        // the deepest sub-stage pulls from the decode exit
        if self.map_stage.sds[depth - 1].op_count == 0 {
            let src = self.decode.last_sd();
            if src.op_count != 0 {
                let dst = &mut self.map_stage.sds[depth - 1];
                dst.take_from(src);
                for id in dst.iter_ops().collect::<Vec<_>>() {
                    self.pool.get_mut(id).map_cycle = cycle;
                }
            }
        }

        // ops that were already sitting in the stalled tail were renamed
        // when they arrived
        if stalled {
            return Ok(());
        }

        for id in self.map_stage.sds[0].iter_ops().collect::<Vec<_>>() {
            self.map_data.map_op(&mut self.pool, id);
            self.map_data.map_mem_dep(&mut self.pool, id);
        }
        Ok(())
    }

    /// Flushes wrong-path ops out of the map stage during a recovery.
    pub fn recover_map_stage(&mut self) -> SimResult<()> {
        let recovery_op_num = self.bp_recovery.recovery_op_num;
        for stage_idx in 0..self.map_stage.sds.len() {
            let width = self.map_stage.sds[stage_idx].ops.len();
            let mut keep = 0;
            for slot in 0..width {
                let Some(id) = self.map_stage.sds[stage_idx].ops[slot] else {
                    continue;
                };
                self.map_stage.sds[stage_idx].ops[slot] = None;
                if Self::flushes(recovery_op_num, self.pool.get(id).op_num) {
                    self.free_op(id)?;
                } else {
                    self.map_stage.sds[stage_idx].ops[keep] = Some(id);
                    keep += 1;
                }
            }
            self.map_stage.sds[stage_idx].op_count = keep;
        }
        Ok(())
    }
}

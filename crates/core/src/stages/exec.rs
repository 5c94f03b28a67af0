//! Exec stage: functional-unit occupancy, dependent wake-up and branch
//! resolution.
//!
//! The stage drains the node stage's scheduling slots in two phases. Phase
//! one decides, per FU, whether the inbound op can latch — a busy or
//! memory-held FU bounces it back for rescheduling — and wakes the
//! dependents of every op that does latch, *before* any latching happens,
//! so ops flushed or replayed this cycle cannot sneak into execution behind
//! the op that caused the flush. Phase two latches the survivors, busies
//! the FUs, stamps completion times and resolves branches.

use tracing::debug;

use crate::common::{Counter, SimResult};
use crate::config::{Params, parse_list};
use crate::ensure;
use crate::map::MapData;
use crate::model::PerCore;
use crate::stats::Stat;
use crate::uop::{DepType, MemType, OpState, fu_type_mask, full_fu_type_mask};

use super::StageData;

/// A typed execution lane.
#[derive(Debug)]
pub struct FuncUnit {
    /// Lane index.
    pub fu_id: usize,
    /// Op-type bitmask this lane executes (SIMD bits distinct).
    pub type_mask: u64,
    /// Cycle at which the lane accepts its next op.
    pub avail_cycle: Counter,
    /// Cycle at which the lane's pipeline is empty again.
    pub idle_cycle: Counter,
    /// The lane is stalled holding a memory op.
    pub held_by_mem: bool,
}

/// Exec stage state: the FU array and the ops resident in them.
#[derive(Debug)]
pub struct ExecStage {
    /// Ops resident in each FU.
    pub sd: StageData,
    /// Functional units.
    pub fus: Vec<FuncUnit>,
    /// Lanes busy this cycle (excluding memory holds).
    pub fus_busy: usize,
}

impl ExecStage {
    /// Builds the FU array from the `fu_types` mask list. A mask of zero
    /// means the lane executes every op type. The union of all lanes must
    /// cover every op type.
    pub fn new(proc_id: usize, params: &Params) -> SimResult<Self> {
        let masks = parse_list("fu_types", &params.core.fu_types)?;
        let mut coverage = 0u64;
        let mut fus = Vec::with_capacity(masks.len());
        for (fu_id, &mask) in masks.iter().enumerate() {
            let type_mask = if mask == 0 { full_fu_type_mask() } else { mask };
            coverage |= type_mask;
            fus.push(FuncUnit {
                fu_id,
                type_mask,
                avail_cycle: 0,
                idle_cycle: 0,
                held_by_mem: false,
            });
        }
        ensure!(
            coverage == full_fu_type_mask(),
            proc_id,
            "functional units do not cover all op types (mask {coverage:#x})"
        );
        Ok(Self {
            sd: StageData::new("exec", fus.len()),
            fus,
            fus_busy: 0,
        })
    }

    /// Clears resident ops and lane state (bogus-mode restart).
    pub fn reset(&mut self) {
        self.sd.reset();
        self.fus_busy = 0;
        for fu in &mut self.fus {
            fu.avail_cycle = 0;
            fu.idle_cycle = 0;
            fu.held_by_mem = false;
        }
    }
}

impl PerCore {
    /// Effective FU occupancy of an op: the per-op table latency, unless a
    /// uniform delay override is configured.
    fn op_delay(&self, op: &crate::uop::Op) -> Counter {
        let uniform = self.params.core.uniform_op_delay;
        if uniform != 0 { uniform } else { op.latency() }
    }

    /// One exec-stage cycle over the scheduling slots.
    pub fn update_exec_stage(&mut self, cycle: Counter) -> SimResult<()> {
        let num_fus = self.exec.fus.len();

        // phase 1: latch/bounce decisions and dependent wake-up
        for fu_id in 0..num_fus {
            // FU not yet available: bounce the inbound op for rescheduling
            if cycle < self.exec.fus[fu_id].avail_cycle {
                if let Some(id) = self.node.sd.ops[fu_id] {
                    self.pool.get_mut(id).delay_bit = true;
                    self.node.sd.ops[fu_id] = None;
                    self.node.sd.op_count -= 1;
                    self.stats.event(Stat::FuDelayRejects);
                }
                continue;
            }

            if let Some(fop) = self.exec.sd.ops[fu_id] {
                let (is_mem, replay, replay_cycle) = {
                    let op = self.pool.get(fop);
                    (op.inst.table.mem_type.is_mem(), op.replay, op.replay_cycle)
                };
                if is_mem {
                    if replay && replay_cycle == cycle {
                        // simultaneous replay: kill the resident op
                        self.exec.sd.ops[fu_id] = None;
                        self.exec.sd.op_count -= 1;
                    } else {
                        // memory stall holds the lane
                        if let Some(id) = self.node.sd.ops[fu_id] {
                            self.pool.get_mut(id).delay_bit = true;
                            self.node.sd.ops[fu_id] = None;
                            self.node.sd.op_count -= 1;
                            self.stats.event(Stat::FuDelayRejects);
                        }
                        continue;
                    }
                } else {
                    self.exec.sd.ops[fu_id] = None;
                    self.exec.sd.op_count -= 1;
                }
            }

            let Some(id) = self.node.sd.ops[fu_id] else {
                continue;
            };

            // the op will latch this cycle: wake its dependents first
            let (op_num, latency, mem_type, exec_count, srcs_not_rdy, op_fu_mask) = {
                let op = self.pool.get(id);
                (
                    op.op_num,
                    self.op_delay(op),
                    op.inst.table.mem_type,
                    op.exec_count,
                    op.srcs_not_rdy_vector,
                    fu_type_mask(op.inst.table.op_type, op.inst.table.is_simd),
                )
            };
            ensure!(
                srcs_not_rdy == 0,
                self.proc_id,
                "op {op_num} reached exec with pending sources"
            );
            ensure!(
                self.exec.fus[fu_id].type_mask & op_fu_mask != 0,
                self.proc_id,
                "op {op_num} written to FU {fu_id} of incompatible type"
            );

            let exec_cycle = cycle + latency;
            self.pool.get_mut(id).sched_cycle = cycle;

            match mem_type {
                MemType::NotMem => {
                    // non-memory ops always distribute their results after
                    // the op's latency
                    self.pool.get_mut(id).wake_cycle = exec_cycle;
                    let woken = MapData::wake_up_ops(&mut self.pool, id, DepType::RegData);
                    for consumer in woken {
                        self.wake(consumer, cycle);
                    }
                }
                MemType::Store if exec_count == 0 => {
                    // a store's address and data become available on its
                    // first execution
                    self.pool.get_mut(id).wake_cycle = exec_cycle;
                    for dep in [DepType::MemAddr, DepType::MemData] {
                        let woken = MapData::wake_up_ops(&mut self.pool, id, dep);
                        for consumer in woken {
                            self.wake(consumer, cycle);
                        }
                    }
                }
                // loads signal their consumers from the D-cache side
                _ => {}
            }
        }

        // phase 2: latch the survivors
        for fu_id in 0..num_fus {
            if let Some(fop) = self.exec.sd.ops[fu_id] {
                // lane still busy; nothing can latch
                ensure!(
                    self.node.sd.ops[fu_id].is_none(),
                    self.proc_id,
                    "op scheduled into an occupied FU {fu_id}"
                );
                if self.pool.get(fop).inst.table.mem_type.is_mem() {
                    self.exec.fus[fu_id].held_by_mem = true;
                }
                continue;
            }
            self.exec.fus[fu_id].held_by_mem = false;

            let Some(id) = self.node.sd.ops[fu_id] else {
                continue;
            };
            self.node.sd.ops[fu_id] = None;
            ensure!(
                self.node.sd.op_count > 0,
                self.proc_id,
                "scheduling slot count drift"
            );
            self.node.sd.op_count -= 1;

            let (latency, raw_latency, mem_type, off_path, op_num) = {
                let op = self.pool.get(id);
                (
                    self.op_delay(op),
                    op.inst.table.latency,
                    op.inst.table.mem_type,
                    op.off_path,
                    op.op_num,
                )
            };
            ensure!(
                latency > 0,
                self.proc_id,
                "op {op_num} with zero latency breaks ready-list management"
            );

            self.exec.sd.ops[fu_id] = Some(id);
            self.exec.sd.op_count += 1;
            // an unpipelined lane is busied for the whole latency
            let fu = &mut self.exec.fus[fu_id];
            fu.avail_cycle = cycle + if raw_latency < 0 { latency } else { 1 };
            fu.idle_cycle = cycle + latency;

            {
                let op = self.pool.get_mut(id);
                op.state = if mem_type == MemType::NotMem {
                    OpState::Scheduled
                } else {
                    // a memory op may still fail if it misses and cannot
                    // get a request buffer
                    OpState::Tentative
                };
                op.exec_cycle = cycle + latency;
                op.exec_count += 1;
                if mem_type == MemType::NotMem {
                    op.done_cycle = op.exec_cycle;
                }
            }
            if mem_type.is_mem() {
                self.dcache.enqueue(id, self.pool.get(id).unique_num);
            }

            self.stats.event(Stat::ExecOps);
            if off_path {
                self.stats.event(Stat::ExecOpsOffPath);
            }
            debug!(
                target: "exec",
                proc = self.proc_id,
                op_num,
                fu_id,
                exec_cycle = cycle + latency,
                off_path,
                "latched"
            );

            self.resolve_branch(id)?;
        }

        // lane-occupancy accounting
        self.exec.fus_busy = self
            .exec
            .fus
            .iter()
            .filter(|fu| fu.idle_cycle > cycle && !fu.held_by_mem)
            .count();
        self.stats.add(Stat::FuBusyCycles, self.exec.fus_busy as u64);
        Ok(())
    }

    /// Branch resolution at latch time: train the predictors and schedule
    /// the recovery or redirect the op's outcome demands.
    fn resolve_branch(&mut self, id: crate::uop::OpId) -> SimResult<()> {
        let (cf_type, exec_cycle) = {
            let op = self.pool.get(id);
            (op.inst.table.cf_type, op.exec_cycle)
        };
        if !cf_type.is_cf() {
            return Ok(());
        }

        if !self.params.bp.bp_update_at_retire {
            if cf_type.is_indirect_class() {
                self.bp.target_known_op(self.pool.get_mut(id));
            }
            self.bp.resolve_op(self.pool.get(id), &mut self.stats);
        }

        let (mispred, misfetch, no_target, recovery_sch, off_path) = {
            let op = self.pool.get(id);
            (
                op.pred.mispred,
                op.pred.misfetch,
                op.pred.no_target,
                op.pred.recovery_sch,
                op.off_path,
            )
        };

        if mispred || misfetch {
            // an op recovers at most once; a late-predictor recovery that
            // already fired (and was right) stands
            if !recovery_sch {
                self.bp_recovery.schedule_recovery(
                    self.pool.get_mut(id),
                    id,
                    exec_cycle,
                    false,
                    false,
                    &self.params.bp,
                )?;
                if !off_path {
                    self.pool.get_mut(id).recovery_scheduled = true;
                }
            }
        } else if cf_type.is_indirect_class() && no_target {
            let use_late = self.bp.use_late_bp();
            self.bp_recovery.schedule_redirect(
                self.pool.get_mut(id),
                id,
                exec_cycle,
                use_late,
                &self.params.bp,
            )?;
        }
        Ok(())
    }

    /// Recovery: clears wrong-path ops out of the FU lanes and frees the
    /// lanes immediately.
    pub fn recover_exec_stage(&mut self) -> SimResult<()> {
        let recovery_op_num = self.bp_recovery.recovery_op_num;
        for fu_id in 0..self.exec.fus.len() {
            let Some(id) = self.exec.sd.ops[fu_id] else {
                continue;
            };
            if Self::flushes(recovery_op_num, self.pool.get(id).op_num) {
                self.exec.sd.ops[fu_id] = None;
                ensure!(
                    self.exec.sd.op_count > 0,
                    self.proc_id,
                    "exec resident count drift"
                );
                self.exec.sd.op_count -= 1;
                // ops in the ROB are freed by the window flush
                let fu = &mut self.exec.fus[fu_id];
                fu.avail_cycle = 0;
                fu.idle_cycle = 0;
                fu.held_by_mem = false;
            }
        }
        Ok(())
    }
}

//! Fetch / I-cache stage.
//!
//! The stage drives the front-end. In the `Fetch` state it probes the
//! I-cache at the fetch address; a hit builds a fetch packet (issuing ops
//! and predicting each control flow in it), a miss issues a memory request
//! and parks the stage. Fetch barriers drain the machine, BTB misses wait
//! for the target to resolve, and taken-branch bubbles tick down on a
//! timer. A recovery rewinds the fetch address and path state; a redirect
//! only supplies the resolved target.

use tracing::debug;

use crate::common::{Addr, Counter, ProcId, SimResult, addr_proc_id};
use crate::config::Params;
use crate::ensure;
use crate::frontend::Frontend;
use crate::libs::cache::Cache;
use crate::memory::{MemReq, MemReqKind, MemorySystem};
use crate::model::PerCore;
use crate::stats::Stat;
use crate::uop::OpId;

use super::StageData;
use super::packet_build::{BreakReason, PacketBreak, PbData};

/// Fetch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IcacheState {
    /// Normal fetch.
    #[default]
    Fetch,
    /// Outstanding I-cache miss.
    WaitForMiss,
    /// BTB-missing op awaits its resolved target.
    WaitForRedirect,
    /// Post-fetch-barrier drain.
    WaitForEmptyRob,
    /// Taken-branch bubble.
    WaitForTimer,
}

/// Fetch / I-cache stage state.
#[derive(Debug)]
pub struct IcacheStage {
    /// Owning core.
    pub proc_id: ProcId,
    /// Exit buffer feeding decode.
    pub sd: StageData,
    /// Current state.
    pub state: IcacheState,
    /// State entered at the next cycle boundary.
    pub next_state: IcacheState,
    /// Address fetched this cycle.
    pub fetch_addr: Addr,
    /// Address to fetch next.
    pub next_fetch_addr: Addr,
    /// Line address of the last I-cache access.
    pub line_addr: Addr,
    /// Whether fetch is on the wrong path.
    pub off_path: bool,
    /// A recovery put the machine back on path this cycle.
    pub back_on_path: bool,
    /// Cycle at which a taken-branch bubble expires.
    pub timer_cycle: Counter,
    /// The I-cache tag array (timing only).
    pub icache: Cache<()>,
    /// Packet-break state.
    pub pb: PbData,
    last_issue_cycle: Counter,
}

impl IcacheStage {
    /// Builds the stage from the cache geometry parameters.
    pub fn new(proc_id: ProcId, params: &Params) -> SimResult<Self> {
        let entries = params.memory.icache_size / params.memory.icache_line_size as usize;
        Ok(Self {
            proc_id,
            sd: StageData::new("icache", params.core.issue_width),
            state: IcacheState::Fetch,
            next_state: IcacheState::Fetch,
            fetch_addr: 0,
            next_fetch_addr: 0,
            line_addr: 0,
            off_path: false,
            back_on_path: false,
            timer_cycle: 0,
            icache: Cache::new(
                "ICACHE",
                entries.next_power_of_two(),
                params.memory.icache_assoc,
                params.memory.icache_line_size,
            ),
            pb: PbData::new(proc_id, params)?,
            last_issue_cycle: 0,
        })
    }

    /// Clears transient fetch state (bogus-mode restart). The tag array
    /// stays warm.
    pub fn reset(&mut self) {
        self.sd.reset();
        self.state = IcacheState::Fetch;
        self.next_state = IcacheState::Fetch;
        self.off_path = false;
        self.back_on_path = false;
        self.timer_cycle = 0;
    }
}

impl PerCore {
    /// One fetch-stage cycle.
    pub fn update_icache_stage(
        &mut self,
        cycle: Counter,
        frontend: &mut dyn Frontend,
        memory: &mut dyn MemorySystem,
        unique_count: &mut Counter,
    ) -> SimResult<()> {
        self.stats.event(Stat::FetchCycles);
        if self.icache.off_path {
            self.stats.event(Stat::FetchCyclesOffPath);
        }
        self.icache.state = self.icache.next_state;

        // ops still waiting to hand off to decode: do nothing
        if self.icache.sd.op_count > 0 {
            return Ok(());
        }

        match self.icache.state {
            IcacheState::Fetch => self.icache_fetch_cycle(cycle, frontend, memory, unique_count),
            IcacheState::WaitForMiss | IcacheState::WaitForRedirect => Ok(()),
            IcacheState::WaitForEmptyRob => {
                debug!(
                    target: "icache",
                    proc = self.proc_id,
                    "fetch barrier: waiting for the machine to drain"
                );
                if self.seq_ops.is_empty() {
                    self.icache.next_state = IcacheState::Fetch;
                }
                Ok(())
            }
            IcacheState::WaitForTimer => {
                if cycle >= self.icache.timer_cycle {
                    self.icache.next_state = IcacheState::Fetch;
                }
                Ok(())
            }
        }
    }

    fn icache_fetch_cycle(
        &mut self,
        cycle: Counter,
        frontend: &mut dyn Frontend,
        memory: &mut dyn MemorySystem,
        unique_count: &mut Counter,
    ) -> SimResult<()> {
        self.icache.off_path &= !self.icache.back_on_path;
        self.icache.back_on_path = false;

        if !self.params.core.fetch_off_path_ops && self.icache.off_path {
            return Ok(());
        }

        let line_size = self.params.memory.icache_line_size;
        self.icache.pb.reset(self.icache.next_fetch_addr, line_size);

        let mut cf_num = 0u32;
        loop {
            self.icache.fetch_addr = self.icache.next_fetch_addr;
            ensure!(
                addr_proc_id(self.icache.fetch_addr) == self.proc_id,
                self.proc_id,
                "fetch address {:#x} encodes another core",
                self.icache.fetch_addr
            );

            let hit = self.params.memory.perfect_icache
                || self
                    .icache
                    .icache
                    .access(self.icache.fetch_addr, true)
                    .is_some();
            self.icache.line_addr = self.icache.icache.line_addr(self.icache.fetch_addr);

            if !hit {
                debug!(
                    target: "icache",
                    proc = self.proc_id,
                    addr = format_args!("{:#x}", self.icache.fetch_addr),
                    "I-cache miss"
                );
                self.stats.event(Stat::IcacheMiss);
                // wait for the miss if a request buffer is available;
                // otherwise refetch next cycle
                let accepted = memory.new_req(
                    MemReqKind::Ifetch,
                    self.proc_id,
                    self.icache.line_addr,
                    line_size,
                    0,
                    None,
                    self.icache.off_path,
                    *unique_count,
                    cycle,
                );
                if accepted {
                    self.stats.event(Stat::MemReqsIfetch);
                    self.icache.next_state = IcacheState::WaitForMiss;
                    if self.params.memory.one_more_cache_line_enable {
                        self.icache_prefetch_neighbour(cycle, memory, unique_count);
                    }
                } else {
                    self.stats.event(Stat::MemReqRejects);
                }
                self.icache.pb.last_break = BreakReason::IcacheMiss;
                break;
            }

            self.stats.event(Stat::IcacheHit);
            let (next_state, break_reason) =
                self.icache_issue_ops(cycle, &mut cf_num, frontend, unique_count)?;
            self.icache.next_state = next_state;
            if break_reason != BreakReason::Dont {
                break;
            }
        }
        Ok(())
    }

    /// Opposite-parity neighbour line prefetch on an I-cache miss.
    fn icache_prefetch_neighbour(
        &mut self,
        cycle: Counter,
        memory: &mut dyn MemorySystem,
        unique_count: &mut Counter,
    ) {
        let line_size = self.params.memory.icache_line_size;
        let line_num = self.icache.line_addr / line_size;
        let neighbour = if line_num & 1 == 1 {
            (line_num - 1) * line_size
        } else {
            (line_num + 1) * line_size
        };
        if self.icache.icache.probe(neighbour).is_none()
            && memory.new_req(
                MemReqKind::Iprf,
                self.proc_id,
                neighbour,
                line_size,
                0,
                None,
                self.icache.off_path,
                *unique_count,
                cycle,
            )
        {
            self.stats.event(Stat::IcachePrefetchReq);
        }
    }

    /// On a cache hit, pulls ops from the front-end into the fetch packet
    /// up to the first packet break, predicting each control flow.
    fn icache_issue_ops(
        &mut self,
        cycle: Counter,
        cf_num: &mut u32,
        frontend: &mut dyn Frontend,
        unique_count: &mut Counter,
    ) -> SimResult<(IcacheState, BreakReason)> {
        let fetch_lag = cycle - self.icache.last_issue_cycle;
        self.icache.last_issue_cycle = cycle;

        loop {
            if !frontend.can_fetch_op(self.proc_id) {
                // nothing to fetch right now; retry next cycle
                self.icache.pb.last_break = BreakReason::Barrier;
                return Ok((IcacheState::Fetch, BreakReason::Barrier));
            }

            let id = self.pool.alloc(
                self.op_count,
                *unique_count,
                self.unique_count_per_core,
            )?;
            frontend.fetch_op(self.proc_id, self.pool.get_mut(id));

            {
                let next_fetch_addr = self.icache.next_fetch_addr;
                let off_path = self.icache.off_path;
                let op = self.pool.get_mut(id);
                ensure!(
                    next_fetch_addr == op.inst.addr,
                    op.proc_id,
                    "fetch address {:#x} does not match op address {:#x}",
                    next_fetch_addr,
                    op.inst.addr
                );
                op.fetch_addr = next_fetch_addr;
                op.off_path = off_path;
                if !op.off_path && op.inst.table.mem_type.is_mem() && op.oracle.va == 0 {
                    crate::fatal!(op.proc_id, "access to 0x0 at {:#x}", op.inst.addr);
                }
            }

            let packet_break = {
                let sd_count = self.icache.sd.op_count;
                self.icache
                    .pb
                    .packet_build(self.pool.get(id), sd_count, &self.params)
            };
            if packet_break == PacketBreak::Before {
                self.free_op(id)?;
                return Ok((IcacheState::Fetch, self.icache.pb.last_break));
            }

            self.seq_ops.push_back(id);
            ensure!(
                self.seq_ops.len() <= self.pool.active_ops(),
                self.proc_id,
                "in-flight sequence longer than the live op count"
            );

            {
                let op = self.pool.get_mut(id);
                op.fetch_lag = fetch_lag;
                op.fetch_cycle = cycle;
            }
            let slot = self.icache.sd.op_count;
            self.icache.sd.ops[slot] = Some(id);
            self.icache.sd.op_count += 1;
            self.op_count += 1;
            self.unique_count_per_core += 1;
            *unique_count += 1;
            self.stats.event(Stat::OpsFetched);
            if self.icache.off_path {
                self.stats.event(Stat::OpsFetchedOffPath);
            }

            debug!(
                target: "icache",
                proc = self.proc_id,
                addr = format_args!("{:#x}", self.pool.get(id).inst.addr),
                op_num = self.pool.get(id).op_num,
                off_path = self.icache.off_path,
                "fetched op"
            );

            let is_cf = self.pool.get(id).inst.table.cf_type.is_cf();
            if is_cf {
                if let Some(verdict) =
                    self.icache_handle_cf_op(id, cycle, cf_num, frontend, packet_break)?
                {
                    return Ok(verdict);
                }
            } else {
                {
                    let global_hist = self.bp.global_hist;
                    let op = self.pool.get_mut(id);
                    if op.eom {
                        // advance past this instruction
                        self.icache.next_fetch_addr = op.fetch_addr + op.inst.size;
                    }
                    // non-CF ops still carry the history for the record
                    op.pred.pred_global_hist = global_hist;
                }
            }

            if packet_break == PacketBreak::After {
                break;
            }
        }

        if self.icache.pb.last_break == BreakReason::Barrier {
            return Ok((IcacheState::WaitForEmptyRob, BreakReason::Barrier));
        }
        Ok((IcacheState::Fetch, self.icache.pb.last_break))
    }

    /// Predicts one control-flow op and reacts to its outcome. Returns the
    /// issue loop's verdict when the op forces an immediate state change.
    fn icache_handle_cf_op(
        &mut self,
        id: OpId,
        cycle: Counter,
        cf_num: &mut u32,
        frontend: &mut dyn Frontend,
        packet_break: PacketBreak,
    ) -> SimResult<Option<(IcacheState, BreakReason)>> {
        let barrier_break =
            packet_break == PacketBreak::After && self.icache.pb.last_break == BreakReason::Barrier;
        let fetch_addr = self.icache.fetch_addr;

        if barrier_break {
            // fetch barriers (system calls included) still train the
            // predictor, but never redirect or recover
            let br_num = *cf_num;
            *cf_num += 1;
            let _ = self
                .bp
                .predict_op(self.pool.get_mut(id), br_num, fetch_addr, &mut self.stats);
            let op = self.pool.get_mut(id);
            op.pred.mispred = false;
            op.pred.misfetch = false;
            op.pred.btb_miss = false;
            op.pred.no_target = false;
            // fetch resumes at the committed next PC once the machine
            // drains
            self.icache.next_fetch_addr = op.oracle.npc;
            return Ok(None);
        }

        let br_num = *cf_num;
        *cf_num += 1;
        let prediction = self
            .bp
            .predict_op(self.pool.get_mut(id), br_num, fetch_addr, &mut self.stats);
        self.icache.next_fetch_addr = prediction;

        let (mispred, misfetch, late_mispred, late_misfetch, btb_miss, pred_taken, inst_uid) = {
            let op = self.pool.get(id);
            (
                op.pred.mispred,
                op.pred.misfetch,
                op.pred.late_mispred,
                op.pred.late_misfetch,
                op.pred.btb_miss,
                op.pred.pred,
                op.inst_uid,
            )
        };
        let use_late = self.bp.use_late_bp();

        // a wrong prediction kicks fetch off the correct path
        if mispred || misfetch || (use_late && (late_mispred || late_misfetch)) {
            self.icache.off_path = true;

            if self.params.core.fetch_off_path_ops {
                if mispred || misfetch {
                    debug!(
                        target: "icache",
                        proc = self.proc_id,
                        to = format_args!("{:#x}", self.icache.next_fetch_addr),
                        "front-end redirected by the early predictor"
                    );
                    frontend.redirect(self.proc_id, inst_uid, self.icache.next_fetch_addr);
                }
                if use_late {
                    let (pred_npc, late_pred_npc) = {
                        let op = self.pool.get(id);
                        (op.pred.pred_npc, op.pred.late_pred_npc)
                    };
                    if (mispred || misfetch) && !late_mispred && !late_misfetch {
                        // the late predictor got it right: recovery to the
                        // correct address after its latency
                        self.bp_recovery.schedule_recovery(
                            self.pool.get_mut(id),
                            id,
                            cycle,
                            true,
                            false,
                            &self.params.bp,
                        )?;
                    } else if (late_mispred || late_misfetch) && pred_npc != late_pred_npc {
                        // both wrong and disagreeing: recovery onto the
                        // late predictor's (wrong) path
                        self.bp_recovery.schedule_recovery(
                            self.pool.get_mut(id),
                            id,
                            cycle,
                            true,
                            true,
                            &self.params.bp,
                        )?;
                    }
                }
            } else {
                self.icache.pb.last_break = BreakReason::OffPath;
                return Ok(Some((IcacheState::Fetch, BreakReason::OffPath)));
            }
        }

        // a BTB miss stops fetch until the target resolves
        if btb_miss {
            debug!(target: "icache", proc = self.proc_id, "waiting for redirect");
            self.icache.pb.last_break = BreakReason::BtbMiss;
            return Ok(Some((IcacheState::WaitForRedirect, BreakReason::BtbMiss)));
        }

        // a predicted-taken branch may cost a fetch bubble
        if self.params.core.fetch_break_on_taken && pred_taken {
            self.icache.pb.last_break = BreakReason::Taken;
            if self.params.core.fetch_taken_bubble_cycles >= 1 {
                self.icache.timer_cycle = cycle + self.params.core.fetch_taken_bubble_cycles;
                return Ok(Some((IcacheState::WaitForTimer, BreakReason::Taken)));
            }
            return Ok(Some((IcacheState::Fetch, BreakReason::Taken)));
        }

        Ok(None)
    }

    /// Completion callback for an I-cache miss: install the line and
    /// resume fetch if this fill is the one the stage is parked on.
    pub fn icache_fill_line(&mut self, req: &MemReq) {
        let _ = self.icache.icache.insert(req.addr, ());
        self.stats.event(Stat::IcacheFill);
        if req.addr == self.icache.line_addr
            && (self.icache.state == IcacheState::WaitForMiss
                || self.icache.next_state == IcacheState::WaitForMiss)
        {
            self.icache.next_state = IcacheState::Fetch;
        }
    }

    /// Recovery: flush wrong-path ops from the exit buffer and rewind the
    /// fetch state.
    pub fn recover_icache_stage(&mut self) -> SimResult<()> {
        let recovery_op_num = self.bp_recovery.recovery_op_num;
        debug!(
            target: "icache",
            proc = self.proc_id,
            fetch_addr = format_args!("{:#x}", self.bp_recovery.recovery_fetch_addr),
            "recovery"
        );

        let mut keep = 0usize;
        for slot in 0..self.icache.sd.ops.len() {
            let Some(id) = self.icache.sd.ops[slot] else {
                continue;
            };
            self.icache.sd.ops[slot] = None;
            if Self::flushes(recovery_op_num, self.pool.get(id).op_num) {
                self.free_op(id)?;
            } else {
                self.icache.sd.ops[keep] = Some(id);
                keep += 1;
            }
        }
        self.icache.sd.op_count = keep;

        self.icache.back_on_path = !self.bp_recovery.recovery_force_offpath;

        // A late-predictor recovery can land while the stage still waits
        // for a BTB-miss redirect of the same (older) op; the wait stands
        // until the target resolves.
        let redirect_still_pending = self.bp_recovery.late_bp_recovery
            && self.icache.state == IcacheState::WaitForRedirect
            && self.bp_recovery.redirect_pending()
            && self.bp_recovery.redirect_op_num <= recovery_op_num;
        if !redirect_still_pending && self.icache.next_state != IcacheState::WaitForMiss {
            self.icache.next_state = IcacheState::Fetch;
        }

        self.icache.next_fetch_addr = self.bp_recovery.recovery_fetch_addr;
        Ok(())
    }
}

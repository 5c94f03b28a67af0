//! Node stage: reorder buffer, reservation stations, scheduling and
//! retirement.
//!
//! One cycle of the node stage, in order:
//! 1. **Issue:** ops from the map exit enter the ROB (a program-order
//!    linked list through the op records).
//! 2. **Remove scheduled:** ops the exec stage latched last cycle leave
//!    the ready list and release their RS slot.
//! 3. **Fill RS:** the oldest not-yet-windowed ops claim reservation
//!    stations (emptiest eligible RS first); ready ones join the ready
//!    list.
//! 4. **Schedule:** the oldest-first scheduler assigns ready ops to
//!    functional-unit slots for next cycle's exec stage.
//! 5. **Retire:** completed ops leave from the ROB head, in program order
//!    only, gated on completion, path correctness and the absence of
//!    pending recovery/redirect.

use tracing::debug;

use crate::common::{Counter, SimResult};
use crate::config::{Params, parse_list};
use crate::ensure;
use crate::frontend::Frontend;
use crate::model::PerCore;
use crate::stats::{RobBlockIssueReason, RobStallReason, Stat};
use crate::uop::{CfType, OpId, OpState, fu_type_mask};

use super::StageData;

/// A buffer holding dispatched ops waiting for operands and an FU.
#[derive(Debug)]
pub struct ReservationStation {
    /// Diagnostic name.
    pub name: String,
    /// Capacity (0 would be unbounded; rejected by the issuer).
    pub size: u32,
    /// Indices of the functional units this RS feeds.
    pub connected_fus: Vec<usize>,
    /// Ops currently occupying this RS.
    pub rs_op_count: u32,
}

/// Node stage state: ROB, ready list, reservation stations, scheduling
/// slots.
#[derive(Debug)]
pub struct NodeStage {
    /// Scheduling slots drained by next cycle's exec stage (one per FU).
    pub sd: StageData,
    /// ROB head (oldest op).
    pub node_head: Option<OpId>,
    /// ROB tail (youngest op).
    pub node_tail: Option<OpId>,
    /// Occupied ROB entries.
    pub node_count: usize,
    /// Capacity of the ROB.
    pub node_table_size: usize,
    /// Head of the ready list.
    pub rdy_head: Option<OpId>,
    /// Next op number to retire.
    pub ret_op: Counter,
    /// Op number of the most recently scheduled op.
    pub last_scheduled_opnum: Counter,
    /// Oldest issued op not yet placed into an RS.
    pub next_op_into_rs: Option<OpId>,
    /// Reservation stations.
    pub rs: Vec<ReservationStation>,
    /// Out of memory request buffers (D-side).
    pub mem_blocked: bool,
    /// Length of the current memory block, in cycles.
    pub mem_block_length: u32,
    /// Length of the current retirement stall, in cycles.
    pub ret_stall_length: u32,
}

impl NodeStage {
    /// Builds the node stage from the execution-port configuration.
    pub fn new(proc_id: usize, params: &Params) -> SimResult<Self> {
        let sizes = parse_list("rs_sizes", &params.core.rs_sizes)?;
        let conns = parse_list("rs_connections", &params.core.rs_connections)?;
        let num_fus = parse_list("fu_types", &params.core.fu_types)?.len();
        let mut rs = Vec::with_capacity(sizes.len());
        for (i, (&size, &conn)) in sizes.iter().zip(conns.iter()).enumerate() {
            ensure!(
                size > 0,
                proc_id,
                "unbounded RS {i} not supported by the emptiest-RS issuer"
            );
            rs.push(ReservationStation {
                name: format!("RS{i}"),
                size: size as u32,
                connected_fus: (0..num_fus).filter(|fu| conn & (1 << fu) != 0).collect(),
                rs_op_count: 0,
            });
        }
        Ok(Self {
            sd: StageData::new("node", num_fus),
            node_head: None,
            node_tail: None,
            node_count: 0,
            node_table_size: params.core.node_table_size,
            rdy_head: None,
            ret_op: 1,
            last_scheduled_opnum: 0,
            next_op_into_rs: None,
            rs,
            mem_blocked: false,
            mem_block_length: 0,
            ret_stall_length: 0,
        })
    }

    /// Whether the ROB is full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.node_count == self.node_table_size
    }

    /// Clears all transient state (bogus-mode restart). Ops are freed by
    /// the caller through the in-flight list.
    pub fn reset(&mut self) {
        self.sd.reset();
        self.node_head = None;
        self.node_tail = None;
        self.node_count = 0;
        self.rdy_head = None;
        self.next_op_into_rs = None;
        self.last_scheduled_opnum = 0;
        self.mem_blocked = false;
        self.mem_block_length = 0;
        self.ret_stall_length = 0;
        for rs in &mut self.rs {
            rs.rs_op_count = 0;
        }
    }
}

impl PerCore {
    /// One node-stage cycle: issue, drain scheduled, fill RS, schedule,
    /// retire.
    pub fn update_node_stage(
        &mut self,
        cycle: Counter,
        frontend: &mut dyn Frontend,
    ) -> SimResult<()> {
        self.node_issue(cycle)?;
        self.node_handle_scheduled_ops()?;
        self.node_fill_rs(cycle)?;
        self.node_sched_ops(cycle)?;
        self.node_retire(cycle, frontend)?;
        Ok(())
    }

    /// Moves ops from the map exit into the ROB.
    fn node_issue(&mut self, cycle: Counter) -> SimResult<()> {
        self.stats.rob_block_issue_reason = RobBlockIssueReason::None;
        if self.map_stage.last_sd().op_count == 0 {
            return Ok(());
        }

        let width = self.map_stage.sds[0].ops.len();
        for slot in 0..width {
            if self.node.is_full() {
                self.stats.rob_block_issue_reason = RobBlockIssueReason::Full;
                return Ok(());
            }
            self.stats.rob_block_issue_reason = RobBlockIssueReason::None;

            let Some(id) = self.map_stage.sds[0].ops[slot] else {
                continue;
            };
            let (bar_issue, off_path, op_num) = {
                let op = self.pool.get(id);
                (op.inst.table.bar_type.bars_issue(), op.off_path, op.op_num)
            };
            // a synchronizing op waits for the ROB to drain
            if bar_issue && self.node.node_count > 0 {
                break;
            }

            self.map_stage.sds[0].ops[slot] = None;
            ensure!(
                self.map_stage.sds[0].op_count > 0,
                self.proc_id,
                "map exit count drift"
            );
            self.map_stage.sds[0].op_count -= 1;

            {
                let node_count = self.node.node_count;
                let op = self.pool.get_mut(id);
                ensure!(!op.in_node_list, self.proc_id, "op {} re-issued", op.op_num);
                op.node_id = node_count as Counter;
                op.issue_cycle = cycle;
                op.next_node = None;
                op.in_node_list = true;
                op.state = OpState::Issued;
            }
            if let Some(tail) = self.node.node_tail {
                self.pool.get_mut(tail).next_node = Some(id);
            }
            if self.node.node_head.is_none() {
                self.node.node_head = Some(id);
            }
            self.node.node_tail = Some(id);
            if self.node.next_op_into_rs.is_none() {
                self.node.next_op_into_rs = Some(id);
            }
            self.node.node_count += 1;
            ensure!(
                self.node.node_count <= self.node.node_table_size,
                self.proc_id,
                "ROB overflow"
            );
            self.stats.event(Stat::OpsIssued);
            debug!(
                target: "node",
                proc = self.proc_id,
                op_num,
                off_path,
                "issued into ROB"
            );

            if bar_issue {
                break;
            }
        }
        Ok(())
    }

    /// Removes ops the exec stage latched (or that missed) from the ready
    /// list and their reservation stations.
    fn node_handle_scheduled_ops(&mut self) -> SimResult<()> {
        let mut prev: Option<OpId> = None;
        let mut cur = self.node.rdy_head;
        while let Some(id) = cur {
            let (state, next, rs_id, op_num) = {
                let op = self.pool.get(id);
                (op.state, op.next_rdy, op.rs_id, op.op_num)
            };
            if matches!(state, OpState::Scheduled | OpState::Miss) {
                match prev {
                    Some(p) => self.pool.get_mut(p).next_rdy = next,
                    None => self.node.rdy_head = next,
                }
                self.pool.get_mut(id).in_rdy_list = false;
                let Some(rs_id) = rs_id else {
                    crate::fatal!(self.proc_id, "scheduled op {op_num} has no RS");
                };
                ensure!(
                    self.node.rs[rs_id].rs_op_count > 0,
                    self.proc_id,
                    "RS {rs_id} count underflow"
                );
                self.node.rs[rs_id].rs_op_count -= 1;
            } else {
                prev = Some(id);
            }
            cur = next;
        }
        Ok(())
    }

    /// Selects the emptiest reservation station connected to an FU that
    /// can execute `op`'s type. Returns `None` when none has space.
    fn find_emptiest_rs(&self, fu_mask: u64) -> Option<usize> {
        let mut emptiest: Option<(usize, u32)> = None;
        for (rs_id, rs) in self.node.rs.iter().enumerate() {
            let eligible = rs
                .connected_fus
                .iter()
                .any(|&fu| self.exec.fus[fu].type_mask & fu_mask != 0);
            if !eligible {
                continue;
            }
            let free = rs.size - rs.rs_op_count;
            if free == 0 {
                continue;
            }
            if emptiest.is_none_or(|(_, best)| free > best) {
                emptiest = Some((rs_id, free));
            }
        }
        emptiest.map(|(rs_id, _)| rs_id)
    }

    /// Fills reservation stations with the oldest issued ops; ops with no
    /// pending sources join the ready list.
    fn node_fill_rs(&mut self, cycle: Counter) -> SimResult<()> {
        let fill_width = self.params.core.rs_fill_width;
        let mut filled = 0usize;
        let mut cur = self.node.next_op_into_rs;
        while let Some(id) = cur {
            let (fu_mask, next_node, state) = {
                let op = self.pool.get(id);
                (
                    fu_type_mask(op.inst.table.op_type, op.inst.table.is_simd),
                    op.next_node,
                    op.state,
                )
            };
            ensure!(
                state == OpState::Issued,
                self.proc_id,
                "RS fill found op in state {state:?}"
            );
            let Some(rs_id) = self.find_emptiest_rs(fu_mask) else {
                break;
            };
            self.node.rs[rs_id].rs_op_count += 1;
            self.stats.event(Stat::RsFills);
            {
                let op = self.pool.get_mut(id);
                op.state = OpState::InRs;
                op.rs_id = Some(rs_id);
            }
            if self.pool.get(id).srcs_not_rdy_vector == 0 {
                self.add_to_rdy_list(id, cycle);
            }
            filled += 1;
            cur = next_node;
            if fill_width != 0 && filled == fill_width {
                break;
            }
        }
        self.node.next_op_into_rs = cur;
        Ok(())
    }

    /// Puts an in-RS op whose sources are all ready onto the ready list.
    pub(crate) fn add_to_rdy_list(&mut self, id: OpId, cycle: Counter) {
        let rdy_head = self.node.rdy_head;
        let op = self.pool.get_mut(id);
        debug_assert!(!op.in_rdy_list);
        debug_assert_eq!(op.srcs_not_rdy_vector, 0);
        op.state = if cycle + 1 >= op.rdy_cycle {
            OpState::Ready
        } else {
            OpState::WaitFwd
        };
        op.next_rdy = rdy_head;
        op.in_rdy_list = true;
        self.node.rdy_head = Some(id);
    }

    /// Wakes a consumer whose source vector reached zero: if it already
    /// occupies an RS it joins the ready list now, otherwise the RS fill
    /// pass will pick it up.
    pub(crate) fn wake(&mut self, id: OpId, cycle: Counter) {
        let op = self.pool.get(id);
        if op.in_rdy_list || op.state != OpState::InRs {
            return;
        }
        self.add_to_rdy_list(id, cycle);
    }

    /// Oldest-first scheduling of ready ops into FU slots for next cycle.
    fn node_sched_ops(&mut self, cycle: Counter) -> SimResult<()> {
        ensure!(
            self.node.sd.op_count == 0,
            self.proc_id,
            "exec stage left scheduling slots occupied"
        );

        self.check_if_mem_blocked();

        let mut cur = self.node.rdy_head;
        while let Some(id) = cur {
            let next = self.pool.get(id).next_rdy;
            let (state, rdy_cycle, in_rdy) = {
                let op = self.pool.get(id);
                (op.state, op.rdy_cycle, op.in_rdy_list)
            };
            ensure!(in_rdy, self.proc_id, "ready list holds unmarked op");

            if state == OpState::WaitMem {
                if self.node.mem_blocked {
                    cur = next;
                    continue;
                }
                self.pool.get_mut(id).state = OpState::Ready;
            }
            if matches!(state, OpState::Tentative | OpState::WaitDcache) {
                cur = next;
                continue;
            }

            // op will be ready next cycle, try to schedule
            if cycle >= rdy_cycle.saturating_sub(1) {
                ensure!(
                    self.pool.get(id).srcs_not_rdy_vector == 0,
                    self.proc_id,
                    "ready op with pending sources"
                );
                self.oldest_first_sched(id)?;
            }
            cur = next;
        }
        Ok(())
    }

    /// The oldest-first scheduler: prefer an empty slot among the FUs
    /// reachable from the op's RS; otherwise displace the youngest
    /// occupant older than none.
    fn oldest_first_sched(&mut self, id: OpId) -> SimResult<()> {
        let (op_num, fu_mask, rs_id) = {
            let op = self.pool.get(id);
            let Some(rs_id) = op.rs_id else {
                crate::fatal!(self.proc_id, "scheduling op {} outside any RS", op.op_num);
            };
            (
                op.op_num,
                fu_type_mask(op.inst.table.op_type, op.inst.table.is_simd),
                rs_id,
            )
        };

        let mut youngest_slot: Option<(usize, Counter)> = None;
        for i in 0..self.node.rs[rs_id].connected_fus.len() {
            let fu_id = self.node.rs[rs_id].connected_fus[i];
            if self.exec.fus[fu_id].type_mask & fu_mask == 0 {
                continue;
            }
            match self.node.sd.ops[fu_id] {
                None => {
                    // empty slot: take it
                    self.pool.get_mut(id).fu_num = Some(fu_id);
                    self.node.sd.ops[fu_id] = Some(id);
                    self.node.sd.op_count += 1;
                    self.node.last_scheduled_opnum = op_num;
                    self.stats.event(Stat::SchedOps);
                    debug!(
                        target: "node",
                        proc = self.proc_id,
                        op_num,
                        fu_id,
                        "scheduler selected (empty slot)"
                    );
                    return Ok(());
                }
                Some(occupant) => {
                    let occ_num = self.pool.get(occupant).op_num;
                    if op_num < occ_num
                        && youngest_slot.is_none_or(|(_, y)| occ_num > y)
                    {
                        youngest_slot = Some((fu_id, occ_num));
                    }
                }
            }
        }

        if let Some((fu_id, _)) = youngest_slot {
            // no empty slot, but a younger occupant can be displaced
            self.pool.get_mut(id).fu_num = Some(fu_id);
            self.node.sd.ops[fu_id] = Some(id);
            self.node.last_scheduled_opnum = op_num;
            self.stats.event(Stat::SchedOps);
            debug!(
                target: "node",
                proc = self.proc_id,
                op_num,
                fu_id,
                "scheduler selected (displaced younger op)"
            );
        }
        Ok(())
    }

    /// Re-checks whether the memory request buffers freed up.
    fn check_if_mem_blocked(&mut self) {
        if self.node.mem_blocked && !self.dcache.mem_still_blocked {
            self.node.mem_blocked = false;
            self.node.mem_block_length = 0;
        }
        if self.node.mem_blocked {
            self.stats.event(Stat::MemBlockedCycles);
            self.node.mem_block_length += 1;
        }
    }

    /// Retires completed ops from the ROB head, in program order.
    fn node_retire(&mut self, cycle: Counter, frontend: &mut dyn Frontend) -> SimResult<()> {
        self.stats.rob_stall_reason = RobStallReason::None;
        if self.node.node_count == 0 {
            ensure!(
                self.node.node_head.is_none() && self.node.node_tail.is_none(),
                self.proc_id,
                "empty ROB with dangling head/tail"
            );
            return Ok(());
        }

        let mut ret_count = 0usize;
        let mut cur = self.node.node_head;
        while let Some(id) = cur {
            if ret_count >= self.params.core.node_ret_width {
                break;
            }
            {
                let op = self.pool.get(id);
                let not_ready = !op.is_done(cycle)
                    || op.off_path
                    || op.recovery_scheduled
                    || op.redirect_scheduled;
                if not_ready {
                    self.collect_not_ready_to_retire_stats(id);
                    break;
                }
            }
            self.stats.rob_stall_reason = RobStallReason::None;
            self.node.ret_stall_length = 0;

            let (op_num, eom, exit, is_cf, inst_uid, next_node) = {
                let op = self.pool.get(id);
                (
                    op.op_num,
                    op.eom,
                    op.exit,
                    op.inst.table.cf_type.is_cf(),
                    op.inst_uid,
                    op.next_node,
                )
            };
            ensure!(
                self.pool.get(id).state != OpState::Tentative,
                self.proc_id,
                "retiring tentative op {op_num}"
            );
            ensure!(
                self.pool.get(id).in_node_list && !self.pool.get(id).off_path,
                self.proc_id,
                "retirement purity violated for op {op_num}"
            );
            ensure!(
                op_num == self.node.ret_op,
                self.proc_id,
                "out-of-order retirement: op {op_num}, expected {}",
                self.node.ret_op
            );

            ret_count += 1;
            debug!(target: "node", proc = self.proc_id, op_num, "retiring");

            if eom {
                self.inst_count += 1;
                self.stats.event(Stat::InstRetired);

                // system calls, fetch barriers and the exit op must reach
                // the front-end; other retires are rate-limited resource
                // releases
                let must_notify = {
                    let op = self.pool.get(id);
                    op.inst.table.cf_type == CfType::Sys || op.inst.table.bar_type.bars_fetch()
                };
                if exit {
                    self.retired_exit = true;
                    frontend.retire(self.proc_id, None);
                } else if must_notify
                    || self.inst_count % self.params.core.node_retire_rate == 0
                {
                    frontend.retire(self.proc_id, Some(inst_uid));
                }
            }
            self.uop_count += 1;
            self.stats.event(Stat::OpsRetired);
            ensure!(
                self.uop_count == self.node.ret_op,
                self.proc_id,
                "uop count {} diverged from retire pointer {}",
                self.uop_count,
                self.node.ret_op
            );
            self.node.ret_op += 1;

            // the in-flight sequence retires strictly from the front
            if self.seq_ops.front() == Some(&id) {
                self.seq_ops.pop_front();
            } else {
                crate::fatal!(
                    self.proc_id,
                    "op {op_num} retired out of sequence-list order"
                );
            }

            if is_cf {
                if self.params.bp.bp_update_at_retire {
                    if self.pool.get(id).inst.table.cf_type.is_indirect_class() {
                        self.bp.target_known_op(self.pool.get_mut(id));
                    }
                    self.bp.resolve_op(self.pool.get(id), &mut self.stats);
                }
                self.bp.retire_op(self.pool.get(id));
            }

            {
                let op = self.pool.get_mut(id);
                op.retire_cycle = cycle;
                op.in_node_list = false;
            }
            self.free_op(id)?;

            ensure!(self.node.node_count > 0, self.proc_id, "ROB count underflow");
            self.node.node_count -= 1;
            cur = next_node;
        }

        // cur now points at the first op that did not retire
        self.node.node_head = cur;
        if cur.is_none() {
            self.node.node_tail = None;
            ensure!(
                self.node.node_count == 0,
                self.proc_id,
                "ROB must be empty when the head list drains"
            );
        }
        Ok(())
    }

    fn collect_not_ready_to_retire_stats(&mut self, id: OpId) {
        let op = self.pool.get(id);
        let mut reason = RobStallReason::Other;
        if op.recovery_scheduled {
            reason = RobStallReason::WaitForRecovery;
        } else if op.redirect_scheduled {
            reason = RobStallReason::WaitForRedirect;
        } else if op.state == OpState::Miss {
            reason = RobStallReason::WaitForL1Miss;
        } else if op.state == OpState::WaitMem {
            reason = RobStallReason::WaitForMemory;
        } else if op.state == OpState::WaitDcache {
            reason = RobStallReason::WaitForDcMiss;
        }
        self.stats.rob_stall_reason = reason;
        self.node.ret_stall_length += 1;
    }

    /// Recovery: flushes wrong-path state from the ready list, the
    /// scheduling slots, the RS-entry pointer and the ROB itself.
    pub fn recover_node_stage(&mut self) -> SimResult<()> {
        let recovery_op_num = self.bp_recovery.recovery_op_num;

        // ready list; ops here (in any wait state) still hold their RS
        // slot, which frees with them
        let mut prev: Option<OpId> = None;
        let mut cur = self.node.rdy_head;
        while let Some(id) = cur {
            let (flush, next, rs_id) = {
                let op = self.pool.get(id);
                (Self::flushes(recovery_op_num, op.op_num), op.next_rdy, op.rs_id)
            };
            if flush {
                match prev {
                    Some(p) => self.pool.get_mut(p).next_rdy = next,
                    None => self.node.rdy_head = next,
                }
                self.pool.get_mut(id).in_rdy_list = false;
                if let Some(rs_id) = rs_id {
                    ensure!(
                        self.node.rs[rs_id].rs_op_count > 0,
                        self.proc_id,
                        "RS {rs_id} count underflow during ready-list flush"
                    );
                    self.node.rs[rs_id].rs_op_count -= 1;
                }
            } else {
                prev = Some(id);
            }
            cur = next;
        }

        // scheduling slots
        for slot in 0..self.node.sd.ops.len() {
            let Some(id) = self.node.sd.ops[slot] else {
                continue;
            };
            if Self::flushes(recovery_op_num, self.pool.get(id).op_num) {
                self.node.sd.ops[slot] = None;
                ensure!(
                    self.node.sd.op_count > 0,
                    self.proc_id,
                    "scheduling slot count drift"
                );
                self.node.sd.op_count -= 1;
            }
        }

        // next op into RS: all younger ops are flushed with it
        if let Some(id) = self.node.next_op_into_rs
            && Self::flushes(recovery_op_num, self.pool.get(id).op_num)
        {
            self.node.next_op_into_rs = None;
        }

        // the window itself
        let mut flush_ops = 0usize;
        let mut keep_ops = 0usize;
        self.node.node_tail = None;
        let mut prev: Option<OpId> = None;
        let mut cur = self.node.node_head;
        while let Some(id) = cur {
            let (flush, next, state, rs_id, op_num) = {
                let op = self.pool.get(id);
                (
                    Self::flushes(recovery_op_num, op.op_num),
                    op.next_node,
                    op.state,
                    op.rs_id,
                    op.op_num,
                )
            };
            if flush {
                debug!(target: "node", proc = self.proc_id, op_num, "flushing from ROB");
                flush_ops += 1;
                match prev {
                    Some(p) => self.pool.get_mut(p).next_node = next,
                    None => self.node.node_head = next,
                }
                self.pool.get_mut(id).in_node_list = false;
                // ready-list residents released their RS slot above; the
                // only RS holders left are ops still waiting on sources
                if state == OpState::InRs {
                    let Some(rs_id) = rs_id else {
                        crate::fatal!(self.proc_id, "RS-resident op {op_num} without RS id");
                    };
                    ensure!(
                        self.node.rs[rs_id].rs_op_count > 0,
                        self.proc_id,
                        "RS {rs_id} count underflow during flush"
                    );
                    self.node.rs[rs_id].rs_op_count -= 1;
                }
                self.free_op(id)?;
            } else {
                if op_num == recovery_op_num {
                    // the scheduled recovery has now occurred
                    self.pool.get_mut(id).recovery_scheduled = false;
                }
                keep_ops += 1;
                prev = Some(id);
                self.node.node_tail = Some(id);
            }
            cur = next;
        }

        ensure!(
            flush_ops + keep_ops == self.node.node_count,
            self.proc_id,
            "ROB flush count drift: {flush_ops}+{keep_ops} != {}",
            self.node.node_count
        );
        self.node.node_count = keep_ops;

        if self.node.last_scheduled_opnum >= recovery_op_num {
            self.node.last_scheduled_opnum = recovery_op_num;
        }
        Ok(())
    }
}

// The node stage is exercised end to end by the pipeline tests in tests/,
// which drive issue, wake-up, scheduling and retirement through whole-core
// scenarios.

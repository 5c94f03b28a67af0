//! Per-core model driver.
//!
//! [`PerCore`] aggregates everything one simulated core owns: the op pool,
//! the branch prediction subsystem, the rename map, all pipeline stages and
//! the per-core counters. The simulation loop borrows one core at a time
//! and advances it one cycle; the only state shared between cores is the
//! memory system, accessed through its interface trait.
//!
//! Within a cycle the stages run in reverse pipeline order — retirement
//! side first, fetch side last — so an op flushed at the retirement end is
//! never re-observed by an earlier stage in the same cycle. A pending
//! recovery or redirect fires before any stage update of the cycle whose
//! number it carries.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::debug;

use crate::bp::{BpData, BpRecoveryInfo};
use crate::common::{Counter, ProcId, SimResult};
use crate::config::Params;
use crate::frontend::Frontend;
use crate::map::MapData;
use crate::memory::MemorySystem;
use crate::pipeview::Pipeview;
use crate::stages::dcache::DcacheStage;
use crate::stages::decode::DecodeStage;
use crate::stages::exec::ExecStage;
use crate::stages::icache::{IcacheStage, IcacheState};
use crate::stages::map_stage::MapStage;
use crate::stages::node::NodeStage;
use crate::stats::{CoreStats, Stat};
use crate::uop::{MemType, OpId, OpPool};

/// One simulated core: pipeline stages, predictors, rename state, op pool
/// and counters.
#[derive(Debug)]
pub struct PerCore {
    /// Core index.
    pub proc_id: ProcId,
    /// Run parameters (shared across cores).
    pub params: Rc<Params>,
    /// Op arena.
    pub pool: OpPool,
    /// Branch prediction subsystem.
    pub bp: BpData,
    /// Pending recovery/redirect records.
    pub bp_recovery: BpRecoveryInfo,
    /// Rename map and memory-dependence state.
    pub map_data: MapData,
    /// Statistics counters.
    pub stats: CoreStats,
    /// Fetch / I-cache stage.
    pub icache: IcacheStage,
    /// Decode shift register.
    pub decode: DecodeStage,
    /// Map shift register (renames at its tail).
    pub map_stage: MapStage,
    /// ROB, reservation stations, scheduler and retirement.
    pub node: NodeStage,
    /// Functional units.
    pub exec: ExecStage,
    /// Load/store completion modeling.
    pub dcache: DcacheStage,
    /// Every in-flight op in program order (fetch to retire).
    pub seq_ops: VecDeque<OpId>,
    /// Shared timing-trace writer, when pipeview is enabled.
    pub pipeview: Option<Rc<RefCell<Pipeview>>>,
    /// Next op number to hand out (per-core, reset by recoveries).
    pub op_count: Counter,
    /// Per-core unique op count (monotonic across recoveries).
    pub unique_count_per_core: Counter,
    /// Retired macro-instructions.
    pub inst_count: Counter,
    /// Retired uops.
    pub uop_count: Counter,
    /// The exit marker retired.
    pub retired_exit: bool,
}

impl PerCore {
    /// Builds one core from the run parameters.
    pub fn new(proc_id: ProcId, params: Rc<Params>) -> SimResult<Self> {
        Ok(Self {
            proc_id,
            pool: OpPool::new(proc_id),
            bp: BpData::new(proc_id, &params)?,
            bp_recovery: BpRecoveryInfo::new(proc_id),
            map_data: MapData::new(proc_id),
            stats: CoreStats::new(proc_id),
            icache: IcacheStage::new(proc_id, &params)?,
            decode: DecodeStage::new(&params),
            map_stage: MapStage::new(&params),
            node: NodeStage::new(proc_id, &params)?,
            exec: ExecStage::new(proc_id, &params)?,
            dcache: DcacheStage::new(proc_id, &params),
            seq_ops: VecDeque::new(),
            pipeview: None,
            op_count: 1,
            unique_count_per_core: 1,
            inst_count: 0,
            uop_count: 0,
            retired_exit: false,
            params,
        })
    }

    /// Points fetch at the front-end's first address. Called once before
    /// the first cycle and after each bogus-mode reopen.
    pub fn init_fetch(&mut self, frontend: &mut dyn Frontend) {
        self.icache.next_fetch_addr = frontend.next_fetch_addr(self.proc_id);
    }

    /// Advances this core by one cycle.
    pub fn cycle(
        &mut self,
        cycle: Counter,
        frontend: &mut dyn Frontend,
        memory: &mut dyn MemorySystem,
        unique_count: &mut Counter,
    ) -> SimResult<()> {
        if cycle == self.bp_recovery.recovery_cycle {
            self.process_recovery(frontend)?;
        }
        if cycle == self.bp_recovery.redirect_cycle {
            self.process_redirect();
        }

        self.update_exec_stage(cycle)?;
        self.update_dcache_stage(cycle, memory)?;
        self.update_node_stage(cycle, frontend)?;
        self.update_map_stage(cycle)?;
        self.update_decode_stage(cycle)?;
        self.update_icache_stage(cycle, frontend, memory, unique_count)?;

        self.stats.record_stall_reasons();
        Ok(())
    }

    /// Whether an op with `op_num` is flushed by the pending recovery.
    #[inline]
    pub(crate) fn flushes(recovery_op_num: Counter, op_num: Counter) -> bool {
        op_num > recovery_op_num
    }

    /// Frees an op, clearing its dependent rename-side allocations and
    /// recording it in the timing trace.
    pub fn free_op(&mut self, id: OpId) -> SimResult<()> {
        let (mem_type, va, unique_num) = {
            let op = self.pool.get(id);
            (op.inst.table.mem_type, op.oracle.va, op.unique_num)
        };
        if mem_type == MemType::Store {
            self.map_data.delete_store_hash_entry(va, unique_num);
        }
        if let Some(pipeview) = &self.pipeview {
            pipeview.borrow_mut().record(self.pool.get(id));
        }
        self.pool.free(id)
    }

    /// Executes a pending recovery: flushes every stage of state younger
    /// than the recovering op, rolls the predictors back and returns the
    /// front-end to the correct path.
    fn process_recovery(&mut self, frontend: &mut dyn Frontend) -> SimResult<()> {
        let recovery_op_num = self.bp_recovery.recovery_op_num;
        debug!(
            target: "model",
            proc = self.proc_id,
            recovery_op_num,
            fetch_addr = format_args!("{:#x}", self.bp_recovery.recovery_fetch_addr),
            late = self.bp_recovery.late_bp_recovery,
            "recovery firing"
        );

        // The recovering op survives the flush; its pending markers clear
        // here. Only a late-and-wrong recovery re-arms the op for the
        // corrective recovery at execute time.
        if let Some((id, unique)) = self.bp_recovery.recovery_op
            && self.pool.is_live(id, unique)
        {
            let op = self.pool.get_mut(id);
            op.recovery_scheduled = false;
            if self.bp_recovery.late_bp_recovery_wrong {
                op.pred.recovery_sch = false;
            }
        }

        // drop flushed ops from the in-flight sequence before the stage
        // flushes free them
        while let Some(&back) = self.seq_ops.back() {
            if Self::flushes(recovery_op_num, self.pool.get(back).op_num) {
                self.seq_ops.pop_back();
            } else {
                break;
            }
        }

        self.recover_icache_stage()?;
        self.recover_decode_stage()?;
        self.recover_map_stage()?;
        self.recover_node_stage()?;
        self.recover_exec_stage()?;
        self.recover_dcache_stage();

        let cf_type = self.bp_recovery.recovery_cf_type;
        let info = self.bp_recovery.recovery_info;
        self.bp.recover_op(cf_type, &info);

        frontend.recover(self.proc_id, self.bp_recovery.recovery_inst_uid);
        if self.bp_recovery.recovery_force_offpath {
            // the machine is steered down the late predictor's (wrong) path
            frontend.redirect(
                self.proc_id,
                self.bp_recovery.recovery_inst_uid,
                self.bp_recovery.recovery_fetch_addr,
            );
        }

        self.op_count = recovery_op_num + 1;
        self.stats.event(Stat::Recoveries);
        if self.bp_recovery.late_bp_recovery {
            self.stats.event(Stat::LateBpRecoveries);
        }
        self.bp_recovery.clear_recovery();
        Ok(())
    }

    /// Executes a pending redirect: points fetch at the now-known target.
    /// No pipeline state is flushed — nothing younger was admitted.
    fn process_redirect(&mut self) {
        let live_op = self
            .bp_recovery
            .redirect_op
            .filter(|&(id, unique)| self.pool.is_live(id, unique));

        if let Some((id, _)) = live_op {
            let op = self.pool.get_mut(id);
            op.redirect_scheduled = false;
            op.pred.btb_miss_resolved = true;
            if self.icache.state == IcacheState::WaitForRedirect {
                debug!(
                    target: "model",
                    proc = self.proc_id,
                    fetch_addr = format_args!("{:#x}", self.bp_recovery.redirect_fetch_addr),
                    "redirect firing"
                );
                self.icache.back_on_path = !self.bp_recovery.redirect_wrong_path;
                self.icache.next_fetch_addr = self.bp_recovery.redirect_fetch_addr;
                self.icache.next_state = IcacheState::Fetch;
            }
            self.stats.event(Stat::Redirects);
        }
        // a redirect whose op was flushed by an earlier recovery is stale
        self.bp_recovery.clear_redirect();
    }

    /// Resets the core for a bogus-mode rerun: every in-flight op is freed,
    /// all pipeline state clears, and fetch restarts from the reopened
    /// front-end. Predictor and cache tables stay warm; statistics stay
    /// frozen.
    pub fn reset_for_bogus(
        &mut self,
        frontend: &mut dyn Frontend,
        memory: &mut dyn MemorySystem,
    ) -> SimResult<()> {
        while let Some(id) = self.seq_ops.pop_front() {
            self.free_op(id)?;
        }
        memory.flush_core(self.proc_id);

        self.icache.reset();
        self.decode.reset();
        self.map_stage.reset();
        self.node.reset();
        self.exec.reset();
        self.dcache.reset();
        self.map_data.reset();
        self.bp_recovery.reset();
        self.bp.reset_speculative_state();

        self.retired_exit = false;
        self.op_count = self.uop_count + 1;
        self.init_fetch(frontend);
        debug!(target: "model", proc = self.proc_id, "core restarted in bogus mode");
        Ok(())
    }
}

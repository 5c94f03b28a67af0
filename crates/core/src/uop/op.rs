//! The per-instruction dynamic record flowing through the pipeline.
//!
//! An [`Op`] carries:
//! 1. **Identity:** owning core, per-core op number, global unique number,
//!    and the front-end's instruction uid.
//! 2. **Static info:** an [`InstInfo`] shared by reference across dynamic
//!    instances of the same static instruction.
//! 3. **Oracle truth** from the front-end and **prediction outcome** from
//!    the branch predictor, plus the snapshot needed to undo the
//!    prediction's speculative state.
//! 4. **Pipeline state:** the op state machine, timing stamps, wake-up
//!    adjacency lists, and the intrusive links threading the ROB and ready
//!    lists.
//!
//! Ops live in an arena ([`super::OpPool`]) and reference each other through
//! [`OpId`] handles; a handle paired with the producer's unique number lets
//! stale adjacency entries be discarded after the slot is recycled.

use std::rc::Rc;

use crate::common::{Addr, Counter, MAX_CTR, ProcId};

/// Operation class of a static instruction.
///
/// The variant order defines the bit position of each class in an FU type
/// mask (SIMD variants occupy a second bank of bits above these).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    /// No-operation.
    #[default]
    Nop,
    /// Control flow (all CF types).
    Cf,
    /// Register move.
    Mov,
    /// Conditional move.
    Cmov,
    /// Load effective address.
    Lda,
    /// Integer add/subtract.
    Iadd,
    /// Integer multiply.
    Imul,
    /// Integer divide.
    Idiv,
    /// Integer compare.
    Icmp,
    /// Bitwise logic.
    Logic,
    /// Shift/rotate.
    Shift,
    /// Integer-side memory access.
    Imem,
    /// Float-side memory access.
    Fmem,
    /// Float convert.
    Fcvt,
    /// Float add/subtract.
    Fadd,
    /// Float multiply.
    Fmul,
    /// Fused multiply-add.
    Fma,
    /// Float divide / square root.
    Fdiv,
    /// Float compare.
    Fcmp,
    /// Float conditional move.
    Fcmov,
    /// Vector gather.
    Gather,
    /// Vector scatter.
    Scatter,
}

/// Number of [`OpType`] variants (one mask bit each, times two for SIMD).
pub const NUM_OP_TYPES: u32 = 22;

/// The FU-type mask bit for an op class, SIMD occupying the upper bank.
#[inline]
pub fn fu_type_mask(op_type: OpType, is_simd: bool) -> u64 {
    let bit = op_type as u32 + if is_simd { NUM_OP_TYPES } else { 0 };
    1 << bit
}

/// Mask covering every op class, SIMD and non-SIMD.
#[inline]
pub fn full_fu_type_mask() -> u64 {
    (1 << (2 * NUM_OP_TYPES)) - 1
}

/// Memory behaviour of a static instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemType {
    /// Not a memory operation.
    #[default]
    NotMem,
    /// Load.
    Load,
    /// Store.
    Store,
    /// Software prefetch.
    Prefetch,
}

impl MemType {
    /// Whether the op touches memory at all.
    #[inline]
    pub fn is_mem(self) -> bool {
        self != Self::NotMem
    }
}

/// Control-flow classification of a static instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CfType {
    /// Not a control-flow op.
    #[default]
    NotCf,
    /// Unconditional direct branch.
    Br,
    /// Direct call.
    Call,
    /// Conditional branch.
    Cbr,
    /// Indirect branch.
    Ibr,
    /// Indirect call.
    Icall,
    /// Indirect-call-other (coroutine yield: pop then push).
    Ico,
    /// Return.
    Ret,
    /// System call.
    Sys,
}

impl CfType {
    /// Whether the op is control flow at all.
    #[inline]
    pub fn is_cf(self) -> bool {
        self != Self::NotCf
    }

    /// Control-flow kinds whose target is produced late (indirect target
    /// or return address): these drive BTB-miss redirects and late target
    /// predictor training.
    #[inline]
    pub fn is_indirect_class(self) -> bool {
        self >= Self::Ibr
    }
}

/// Synchronization behaviour of a static instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarKind {
    /// No barrier semantics.
    #[default]
    None,
    /// Fetch barrier: nothing younger is fetched until the ROB drains.
    Fetch,
    /// Issue barrier: issues alone into an empty ROB.
    Issue,
    /// Both fetch and issue barrier.
    FetchIssue,
}

impl BarKind {
    /// Fetch-barrier bit.
    #[inline]
    pub fn bars_fetch(self) -> bool {
        matches!(self, Self::Fetch | Self::FetchIssue)
    }

    /// Issue-barrier bit.
    #[inline]
    pub fn bars_issue(self) -> bool {
        matches!(self, Self::Issue | Self::FetchIssue)
    }
}

/// Dependence kinds carried by the wake-up graph; consumers of one producer
/// wake at different moments per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepType {
    /// Register value dependence.
    RegData = 0,
    /// Dependence on a store's address computation.
    MemAddr = 1,
    /// Dependence on a store's data.
    MemData = 2,
}

/// Number of [`DepType`] kinds (parallel adjacency lists per producer).
pub const NUM_DEP_TYPES: usize = 3;

/// Classification shared by every dynamic instance of a static instruction.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct TableInfo {
    /// Operation class.
    pub op_type: OpType,
    /// Memory behaviour.
    pub mem_type: MemType,
    /// Control-flow classification.
    pub cf_type: CfType,
    /// Barrier semantics.
    pub bar_type: BarKind,
    /// SIMD variant (distinct FU mask bank).
    pub is_simd: bool,
    /// Execution latency in cycles; negative means the FU is busied for the
    /// whole latency (unpipelined). Never zero.
    pub latency: i32,
}

impl Default for TableInfo {
    fn default() -> Self {
        Self {
            op_type: OpType::default(),
            mem_type: MemType::default(),
            cf_type: CfType::default(),
            bar_type: BarKind::default(),
            is_simd: false,
            latency: 1,
        }
    }
}

/// Static information about one instruction, shared by `Rc` across its
/// dynamic instances.
#[derive(Debug, Clone, Default)]
pub struct InstInfo {
    /// Instruction address.
    pub addr: Addr,
    /// Instruction size in bytes.
    pub size: u64,
    /// Classification.
    pub table: TableInfo,
    /// Source architectural registers.
    pub srcs: Vec<u16>,
    /// Destination architectural registers.
    pub dests: Vec<u16>,
}

/// Ground truth supplied by the front-end for one dynamic op.
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleInfo {
    /// Actual direction (taken / not-taken).
    pub dir: bool,
    /// Actual branch target.
    pub target: Addr,
    /// Committed next PC.
    pub npc: Addr,
    /// Memory virtual address (zero for non-memory ops).
    pub va: Addr,
    /// Memory access size in bytes.
    pub mem_size: u8,
}

/// Prediction outcome for one dynamic op.
#[derive(Debug, Clone, Copy, Default)]
pub struct PredInfo {
    /// Address the prediction was made from.
    pub pred_addr: Addr,
    /// Predicted direction.
    pub pred: bool,
    /// Predicted next PC.
    pub pred_npc: Addr,
    /// Late predictor's direction.
    pub late_pred: bool,
    /// Late predictor's next PC.
    pub late_pred_npc: Addr,
    /// The BTB had no entry for this op.
    pub btb_miss: bool,
    /// A pending BTB-miss redirect has delivered its target.
    pub btb_miss_resolved: bool,
    /// No structure produced a target (assumed oracle target).
    pub no_target: bool,
    /// The indirect-target predictor missed.
    pub ibp_miss: bool,
    /// Direction wrong and next PC wrong.
    pub mispred: bool,
    /// Next PC wrong without a direction mispredict.
    pub misfetch: bool,
    /// Late-predictor mispredict.
    pub late_mispred: bool,
    /// Late-predictor misfetch.
    pub late_misfetch: bool,
    /// Global history as seen at prediction time.
    pub pred_global_hist: u32,
    /// Confidence estimate (true = confident the prediction is right).
    pub pred_conf: bool,
    /// Confidence table index used (for the resolve-time update).
    pub pred_conf_index: usize,
    /// A recovery has been scheduled on behalf of this op.
    pub recovery_sch: bool,
    /// Position of this CF op within its fetch packet.
    pub cf_within_fetch: u32,
}

/// Snapshot of speculative predictor state taken before an op's own update,
/// sufficient to restore the predictor exactly if the op's prediction turns
/// out wrong.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryInfo {
    /// Owning core.
    pub proc_id: ProcId,
    /// Global history before the op's speculative update.
    pub pred_global_hist: u32,
    /// Target history before the op's speculative update.
    pub targ_hist: u32,
    /// Resolved direction (overwritten by the late predictor on a
    /// forced-off-path recovery).
    pub new_dir: bool,
    /// CRS next-write pointer before this op's push/pop.
    pub crs_next: usize,
    /// CRS top-of-stack pointer before this op's push/pop.
    pub crs_tos: usize,
    /// CRS depth before this op's push/pop.
    pub crs_depth: usize,
    /// CRS tail pointer before this op's push/pop (ideal mode).
    pub crs_tail: usize,
    /// Address on top of the CRS at prediction time.
    pub tos_addr: Addr,
    /// Op number of the op that owns this snapshot.
    pub op_num: Counter,
    /// PC of the op.
    pub pc: Addr,
    /// Control-flow type of the op.
    pub cf_type: CfType,
    /// Oracle direction.
    pub oracle_dir: bool,
    /// Oracle target.
    pub branch_target: Addr,
}

/// Pipeline lifecycle of an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpState {
    /// Fetched, not yet in the ROB.
    #[default]
    Fetched,
    /// In the ROB, not yet in a reservation station.
    Issued,
    /// In a reservation station, sources not all ready.
    InRs,
    /// Sources ready; eligible for scheduling.
    Ready,
    /// Sources ready but the earliest forwarding cycle is still ahead.
    WaitFwd,
    /// Memory op parked until request buffers free up.
    WaitMem,
    /// Load waiting for a free D-cache port.
    WaitDcache,
    /// Latched into a functional unit.
    Scheduled,
    /// Load latched but may still miss (not yet known done).
    Tentative,
    /// Load missed; waiting for the fill.
    Miss,
    /// Complete.
    Done,
}

impl OpState {
    /// States that occupy a reservation-station slot.
    #[inline]
    pub fn occupies_rs(self) -> bool {
        matches!(self, Self::InRs | Self::Ready | Self::WaitFwd)
    }
}

/// Stable handle of an op inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u32);

impl OpId {
    /// Slot index inside the pool.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One edge of the wake-up graph: a consumer waiting on a producer.
#[derive(Debug, Clone, Copy)]
pub struct WakeUpEntry {
    /// Consumer handle.
    pub op: OpId,
    /// Consumer's unique number, for stale-handle detection.
    pub unique_num: Counter,
    /// Bit position of the consumer source this edge satisfies.
    pub src_index: u32,
}

/// The dynamic op record.
#[derive(Debug, Clone)]
pub struct Op {
    // identity
    /// Owning core.
    pub proc_id: ProcId,
    /// Per-core, monotonically increasing op number.
    pub op_num: Counter,
    /// Globally unique op number.
    pub unique_num: Counter,
    /// Per-core unique op number (survives recoveries).
    pub unique_num_per_proc: Counter,
    /// Front-end instruction uid.
    pub inst_uid: u64,

    // pool bookkeeping
    /// Stable arena slot id.
    pub op_pool_id: u32,
    /// Slot currently holds a live op.
    pub op_pool_valid: bool,
    /// Free-list link.
    pub op_pool_next: Option<OpId>,
    /// Protected from freeing while a retire hook holds it.
    pub marked: bool,

    // static + oracle + prediction
    /// Shared static instruction info.
    pub inst: Rc<InstInfo>,
    /// Front-end ground truth.
    pub oracle: OracleInfo,
    /// Prediction outcome.
    pub pred: PredInfo,
    /// Predictor-state snapshot for precise recovery.
    pub recovery_info: RecoveryInfo,

    // dynamic flags
    /// First uop of its macro instruction.
    pub bom: bool,
    /// Last uop of its macro instruction.
    pub eom: bool,
    /// Exit marker: retiring this op ends the core's run.
    pub exit: bool,
    /// Fetched on a wrong-path segment not yet flushed.
    pub off_path: bool,
    /// Present in the ready list.
    pub in_rdy_list: bool,
    /// Present in the ROB linked list.
    pub in_node_list: bool,
    /// A recovery is pending on this op.
    pub recovery_scheduled: bool,
    /// A redirect is pending on this op.
    pub redirect_scheduled: bool,
    /// Op is being replayed through exec.
    pub replay: bool,
    /// FU was busy; op must be rescheduled.
    pub delay_bit: bool,

    // pipeline position
    /// Lifecycle state.
    pub state: OpState,
    /// Address this op was fetched from.
    pub fetch_addr: Addr,
    /// Position assigned at ROB insertion.
    pub node_id: Counter,
    /// Reservation station the op occupies.
    pub rs_id: Option<usize>,
    /// Functional unit the op was scheduled to.
    pub fu_num: Option<usize>,
    /// Times this op entered a functional unit.
    pub exec_count: u32,

    // timing stamps
    /// Cycle fetched.
    pub fetch_cycle: Counter,
    /// Cycles between this fetch packet and the previous one.
    pub fetch_lag: Counter,
    /// Cycle entered the map stage.
    pub map_cycle: Counter,
    /// Cycle issued into the ROB.
    pub issue_cycle: Counter,
    /// Cycle all sources become ready.
    pub rdy_cycle: Counter,
    /// Cycle latched into an FU.
    pub sched_cycle: Counter,
    /// Cycle execution completes in the FU.
    pub exec_cycle: Counter,
    /// Cycle of D-cache access.
    pub dcache_cycle: Counter,
    /// Cycle the result is final.
    pub done_cycle: Counter,
    /// Cycle retired.
    pub retire_cycle: Counter,
    /// Cycle a replay was triggered.
    pub replay_cycle: Counter,
    /// Cycle this op's consumers may wake.
    pub wake_cycle: Counter,

    // wake-up graph
    /// One pending bit per declared source.
    pub srcs_not_rdy_vector: u64,
    /// Outgoing edges, one list per dependence kind.
    pub wake_up_lists: [Vec<WakeUpEntry>; NUM_DEP_TYPES],
    /// Whether this op already signaled each dependence kind.
    pub wake_up_signaled: [bool; NUM_DEP_TYPES],

    // intrusive links
    /// Next op in the ROB list.
    pub next_node: Option<OpId>,
    /// Next op in the ready list.
    pub next_rdy: Option<OpId>,
}

impl Op {
    /// Creates the permanent shell of a pool slot. Per-allocation state is
    /// set by [`Op::reset`].
    pub fn shell(op_pool_id: u32, invalid_inst: Rc<InstInfo>) -> Self {
        Self {
            proc_id: 0,
            op_num: 0,
            unique_num: 0,
            unique_num_per_proc: 0,
            inst_uid: 0,
            op_pool_id,
            op_pool_valid: false,
            op_pool_next: None,
            marked: false,
            inst: invalid_inst,
            oracle: OracleInfo::default(),
            pred: PredInfo::default(),
            recovery_info: RecoveryInfo::default(),
            bom: false,
            eom: false,
            exit: false,
            off_path: false,
            in_rdy_list: false,
            in_node_list: false,
            recovery_scheduled: false,
            redirect_scheduled: false,
            replay: false,
            delay_bit: false,
            state: OpState::Fetched,
            fetch_addr: 0,
            node_id: MAX_CTR,
            rs_id: None,
            fu_num: None,
            exec_count: 0,
            fetch_cycle: MAX_CTR,
            fetch_lag: 0,
            map_cycle: MAX_CTR,
            issue_cycle: MAX_CTR,
            rdy_cycle: 1,
            sched_cycle: MAX_CTR,
            exec_cycle: MAX_CTR,
            dcache_cycle: MAX_CTR,
            done_cycle: MAX_CTR,
            retire_cycle: MAX_CTR,
            replay_cycle: MAX_CTR,
            wake_cycle: MAX_CTR,
            srcs_not_rdy_vector: 0,
            wake_up_lists: Default::default(),
            wake_up_signaled: [false; NUM_DEP_TYPES],
            next_node: None,
            next_rdy: None,
        }
    }

    /// Resets per-allocation state when the slot is handed out. Everything
    /// the engine observes must be well-defined after this call.
    pub fn reset(
        &mut self,
        proc_id: ProcId,
        op_num: Counter,
        unique_num: Counter,
        unique_num_per_proc: Counter,
        invalid_inst: Rc<InstInfo>,
    ) {
        self.proc_id = proc_id;
        self.op_num = op_num;
        self.unique_num = unique_num;
        self.unique_num_per_proc = unique_num_per_proc;
        self.inst_uid = 0;
        self.marked = false;
        self.inst = invalid_inst;
        self.oracle = OracleInfo::default();
        self.pred = PredInfo::default();
        self.recovery_info = RecoveryInfo::default();
        self.bom = false;
        self.eom = false;
        self.exit = false;
        self.off_path = false;
        self.in_rdy_list = false;
        self.in_node_list = false;
        self.recovery_scheduled = false;
        self.redirect_scheduled = false;
        self.replay = false;
        self.delay_bit = false;
        self.state = OpState::Fetched;
        self.fetch_addr = 0;
        self.node_id = MAX_CTR;
        self.rs_id = None;
        self.fu_num = None;
        self.exec_count = 0;
        self.fetch_cycle = MAX_CTR;
        self.fetch_lag = 0;
        self.map_cycle = MAX_CTR;
        self.issue_cycle = MAX_CTR;
        self.rdy_cycle = 1;
        self.sched_cycle = MAX_CTR;
        self.exec_cycle = MAX_CTR;
        self.dcache_cycle = MAX_CTR;
        self.done_cycle = MAX_CTR;
        self.retire_cycle = MAX_CTR;
        self.replay_cycle = MAX_CTR;
        self.wake_cycle = MAX_CTR;
        self.srcs_not_rdy_vector = 0;
        for list in &mut self.wake_up_lists {
            list.clear();
        }
        self.wake_up_signaled = [false; NUM_DEP_TYPES];
        self.next_node = None;
        self.next_rdy = None;
    }

    /// An op is complete once its result is final at or before `cycle`.
    #[inline]
    pub fn is_done(&self, cycle: Counter) -> bool {
        self.state == OpState::Done || self.done_cycle <= cycle
    }

    /// The absolute execution latency of this op (negative table latencies
    /// mean unpipelined).
    #[inline]
    pub fn latency(&self) -> Counter {
        self.inst.table.latency.unsigned_abs() as Counter
    }

    /// Fall-through address of this instruction.
    #[inline]
    pub fn pc_plus_offset(&self) -> Addr {
        self.inst.addr.wrapping_add(self.inst.size)
    }

    /// One-line description for diagnostics.
    pub fn describe(&self) -> String {
        format!(
            "op_num:{} unique:{} addr:{:#x} type:{:?} mem:{:?} cf:{:?} state:{:?} off_path:{}",
            self.op_num,
            self.unique_num,
            self.inst.addr,
            self.inst.table.op_type,
            self.inst.table.mem_type,
            self.inst.table.cf_type,
            self.state,
            self.off_path,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fu_type_mask_simd_is_distinct() {
        let scalar = fu_type_mask(OpType::Iadd, false);
        let simd = fu_type_mask(OpType::Iadd, true);
        assert_ne!(scalar, simd);
        assert_eq!(scalar & simd, 0);
        assert_eq!(full_fu_type_mask() & scalar, scalar);
        assert_eq!(full_fu_type_mask() & simd, simd);
    }

    #[test]
    fn test_cf_type_indirect_class() {
        assert!(!CfType::Cbr.is_indirect_class());
        assert!(!CfType::Call.is_indirect_class());
        assert!(CfType::Ibr.is_indirect_class());
        assert!(CfType::Ret.is_indirect_class());
        assert!(CfType::Sys.is_indirect_class());
    }

    #[test]
    fn test_reset_restores_defaults() {
        let inst = Rc::new(InstInfo::default());
        let mut op = Op::shell(0, Rc::clone(&inst));
        op.state = OpState::Done;
        op.off_path = true;
        op.srcs_not_rdy_vector = 0b11;
        op.exec_count = 4;
        op.wake_up_lists[0].push(WakeUpEntry {
            op: OpId(3),
            unique_num: 9,
            src_index: 0,
        });
        op.reset(1, 17, 42, 17, inst);
        assert_eq!(op.state, OpState::Fetched);
        assert!(!op.off_path);
        assert_eq!(op.srcs_not_rdy_vector, 0);
        assert_eq!(op.exec_count, 0);
        assert!(op.wake_up_lists[0].is_empty());
        assert_eq!(op.done_cycle, MAX_CTR);
        assert_eq!(op.rdy_cycle, 1);
        assert_eq!((op.proc_id, op.op_num, op.unique_num), (1, 17, 42));
    }

    #[test]
    fn test_is_done_by_cycle_stamp() {
        let inst = Rc::new(InstInfo::default());
        let mut op = Op::shell(0, inst);
        assert!(!op.is_done(1_000_000));
        op.done_cycle = 10;
        assert!(!op.is_done(9));
        assert!(op.is_done(10));
        op.done_cycle = MAX_CTR;
        op.state = OpState::Done;
        assert!(op.is_done(0));
    }

    #[test]
    fn test_unpipelined_latency_is_absolute() {
        let mut inst = InstInfo::default();
        inst.table.latency = -12;
        let mut op = Op::shell(0, Rc::new(InstInfo::default()));
        op.inst = Rc::new(inst);
        assert_eq!(op.latency(), 12);
    }
}

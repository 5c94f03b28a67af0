//! Fetch packet construction rules.
//!
//! Each cycle the fetch stage builds one packet of ops. For every candidate
//! op the packet-break predicate decides whether the packet ends *before*
//! the op (it stays for next cycle) or *after* it, and why. The counters
//! reset at the start of every packet.

use crate::common::{Addr, ProcId};
use crate::config::{Params, parse_list};
use crate::common::SimResult;
use crate::uop::{CfType, Op, fu_type_mask};

/// Why the current fetch packet ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakReason {
    /// Packet still open.
    #[default]
    Dont,
    /// Issue width reached.
    IssueWidth,
    /// Control-flow budget spent.
    Cf,
    /// Op reached the end of the cache line.
    LineEnd,
    /// Fetch barrier (system call or barrier-flagged op).
    Barrier,
    /// Mispredict detected with off-path fetch disabled.
    OffPath,
    /// I-cache miss.
    IcacheMiss,
    /// BTB miss; fetch waits for redirect.
    BtbMiss,
    /// Predicted-taken branch with the taken-break knob on.
    Taken,
    /// Load/store or per-FU-type budget spent.
    FuBudget,
}

/// Packet-break verdict for one candidate op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBreak {
    /// Keep building.
    Dont,
    /// End the packet before this op (op is not consumed).
    Before,
    /// End the packet after this op.
    After,
}

#[derive(Debug, Clone)]
struct FuBudget {
    mask: u64,
    max: u32,
    count: u32,
}

/// Per-packet break-condition counters for one core's fetch stage.
#[derive(Debug)]
pub struct PbData {
    /// Owning core.
    pub proc_id: ProcId,
    /// Reason the last packet ended.
    pub last_break: BreakReason,
    cf_count: u64,
    load_store_count: u64,
    packet_line_addr: Addr,
    fu_budgets: Vec<FuBudget>,
}

impl PbData {
    /// Builds the packet-break state, deriving per-FU-type budgets from the
    /// execution-port configuration when that rule is enabled.
    pub fn new(proc_id: ProcId, params: &Params) -> SimResult<Self> {
        let mut fu_budgets: Vec<FuBudget> = Vec::new();
        if params.core.packet_break_on_fus {
            for &mask in &parse_list("fu_types", &params.core.fu_types)? {
                let mask = if mask == 0 {
                    crate::uop::full_fu_type_mask()
                } else {
                    mask
                };
                if let Some(budget) = fu_budgets.iter_mut().find(|b| b.mask == mask) {
                    budget.max += 1;
                } else {
                    fu_budgets.push(FuBudget { mask, max: 1, count: 0 });
                }
            }
        }
        Ok(Self {
            proc_id,
            last_break: BreakReason::Dont,
            cf_count: 0,
            load_store_count: 0,
            packet_line_addr: 0,
            fu_budgets,
        })
    }

    /// Resets the per-packet counters; `fetch_addr` anchors the line-end
    /// rule.
    pub fn reset(&mut self, fetch_addr: Addr, line_size: u64) {
        self.last_break = BreakReason::Dont;
        self.cf_count = 0;
        self.load_store_count = 0;
        self.packet_line_addr = fetch_addr & !(line_size - 1);
        for budget in &mut self.fu_budgets {
            budget.count = 0;
        }
    }

    /// Decides whether the packet breaks around `op`. `ops_in_packet` is
    /// the number of ops already accepted this packet.
    pub fn packet_build(
        &mut self,
        op: &Op,
        ops_in_packet: usize,
        params: &Params,
    ) -> PacketBreak {
        let table = &op.inst.table;

        if params.core.num_load_store_per_packet != 0 {
            self.load_store_count += table.mem_type.is_mem() as u64;
            if self.load_store_count > params.core.num_load_store_per_packet {
                self.last_break = BreakReason::FuBudget;
                return PacketBreak::Before;
            }
        }

        if !self.fu_budgets.is_empty() {
            let mask = fu_type_mask(table.op_type, table.is_simd);
            if let Some(budget) = self.fu_budgets.iter_mut().find(|b| b.mask & mask != 0) {
                if budget.count < budget.max {
                    budget.count += 1;
                } else {
                    self.last_break = BreakReason::FuBudget;
                    return PacketBreak::Before;
                }
            }
        }

        // fetch barrier: the op is taken, then fetch drains the machine
        if table.cf_type == CfType::Sys || table.bar_type.bars_fetch() {
            self.last_break = BreakReason::Barrier;
            return PacketBreak::After;
        }

        if params.core.enable_icache_packet_breaking {
            self.cf_count += table.cf_type.is_cf() as u64;
            if self.cf_count == params.core.cfs_per_cycle && table.cf_type.is_cf() {
                self.last_break = BreakReason::Cf;
                return PacketBreak::After;
            }

            // the last op of a line may spill into the next line; the
            // packet still ends with it
            let line = params.memory.icache_line_size;
            let op_end_line = (op.inst.addr + op.inst.size - 1) & !(line - 1);
            if op_end_line != self.packet_line_addr && !params.core.fetch_across_cache_lines {
                self.last_break = BreakReason::LineEnd;
                return PacketBreak::After;
            }
        }

        if ops_in_packet + 1 == params.core.issue_width {
            self.last_break = BreakReason::IssueWidth;
            return PacketBreak::After;
        }

        if params.core.enable_icache_packet_breaking && table.cf_type.is_cf() {
            // an unremarkable CF break: fetch may continue at the target
            // within the same cycle
            self.last_break = BreakReason::Dont;
            return PacketBreak::After;
        }

        PacketBreak::Dont
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::uop::{BarKind, InstInfo, MemType, OpPool, OpType, TableInfo};

    use super::*;

    fn op_with(pool: &mut OpPool, addr: Addr, table: TableInfo) -> crate::uop::OpId {
        let id = pool.alloc(1, 1, 1).unwrap();
        pool.get_mut(id).inst = Rc::new(InstInfo {
            addr,
            size: 4,
            table,
            srcs: vec![],
            dests: vec![],
        });
        id
    }

    #[test]
    fn test_issue_width_break() {
        let params = Params::default();
        let mut pool = OpPool::new(0);
        let mut pb = PbData::new(0, &params).unwrap();
        pb.reset(0x1000, params.memory.icache_line_size);
        let id = op_with(&mut pool, 0x1000, TableInfo::default());
        for n in 0..params.core.issue_width - 1 {
            assert_eq!(
                pb.packet_build(pool.get(id), n, &params),
                PacketBreak::Dont
            );
        }
        assert_eq!(
            pb.packet_build(pool.get(id), params.core.issue_width - 1, &params),
            PacketBreak::After
        );
        assert_eq!(pb.last_break, BreakReason::IssueWidth);
    }

    #[test]
    fn test_barrier_breaks_after() {
        let params = Params::default();
        let mut pool = OpPool::new(0);
        let mut pb = PbData::new(0, &params).unwrap();
        pb.reset(0x1000, params.memory.icache_line_size);
        let sys = op_with(
            &mut pool,
            0x1000,
            TableInfo {
                cf_type: CfType::Sys,
                bar_type: BarKind::FetchIssue,
                op_type: OpType::Cf,
                ..TableInfo::default()
            },
        );
        assert_eq!(pb.packet_build(pool.get(sys), 0, &params), PacketBreak::After);
        assert_eq!(pb.last_break, BreakReason::Barrier);
    }

    #[test]
    fn test_cf_breaks_after() {
        let params = Params::default();
        let mut pool = OpPool::new(0);
        let mut pb = PbData::new(0, &params).unwrap();
        pb.reset(0x1000, params.memory.icache_line_size);
        let br = op_with(
            &mut pool,
            0x1000,
            TableInfo {
                cf_type: CfType::Cbr,
                op_type: OpType::Cf,
                ..TableInfo::default()
            },
        );
        assert_eq!(pb.packet_build(pool.get(br), 0, &params), PacketBreak::After);
    }

    #[test]
    fn test_line_end_breaks_after() {
        let params = Params::default();
        let line = params.memory.icache_line_size;
        let mut pool = OpPool::new(0);
        let mut pb = PbData::new(0, &params).unwrap();
        pb.reset(0x1000, line);
        // an op whose last byte is in the next line
        let spill = op_with(&mut pool, 0x1000 + line - 2, TableInfo::default());
        assert_eq!(pb.packet_build(pool.get(spill), 0, &params), PacketBreak::After);
        assert_eq!(pb.last_break, BreakReason::LineEnd);
    }

    #[test]
    fn test_load_store_budget_breaks_before() {
        let mut params = Params::default();
        params.core.num_load_store_per_packet = 1;
        let mut pool = OpPool::new(0);
        let mut pb = PbData::new(0, &params).unwrap();
        pb.reset(0x1000, params.memory.icache_line_size);
        let ld = op_with(
            &mut pool,
            0x1000,
            TableInfo {
                mem_type: MemType::Load,
                op_type: OpType::Imem,
                ..TableInfo::default()
            },
        );
        assert_eq!(pb.packet_build(pool.get(ld), 0, &params), PacketBreak::Dont);
        assert_eq!(pb.packet_build(pool.get(ld), 1, &params), PacketBreak::Before);
    }

    #[test]
    fn test_fu_budget_breaks_before() {
        let mut params = Params::default();
        params.core.packet_break_on_fus = true;
        params.core.fu_types = "b10,b10,x1".into(); // two Cf-capable FUs, one Nop-capable
        params.core.rs_sizes = "8,8,8".into();
        params.core.rs_connections = "x1,x2,x4".into();
        let mut pool = OpPool::new(0);
        let mut pb = PbData::new(0, &params).unwrap();
        pb.reset(0x1000, params.memory.icache_line_size);
        let mov = op_with(
            &mut pool,
            0x1000,
            TableInfo {
                op_type: OpType::Nop,
                ..TableInfo::default()
            },
        );
        assert_eq!(pb.packet_build(pool.get(mov), 0, &params), PacketBreak::Dont);
        assert_eq!(pb.packet_build(pool.get(mov), 1, &params), PacketBreak::Before);
        assert_eq!(pb.last_break, BreakReason::FuBudget);
    }
}

//! Shared harness for whole-machine scenario tests.
//!
//! Provides a small, fast machine configuration, trace constructors for
//! the recurring shapes (straight-line code, single branches, calls and
//! returns), and a runner that executes a trace to completion and hands
//! back the finished simulator for inspection.

use cmpsim_core::common::Counter;
use cmpsim_core::frontend::trace::TraceRecord;
use cmpsim_core::frontend::{TraceBuilder, TraceFrontend};
use cmpsim_core::memory::{MemReq, MemReqKind, MemorySystem};
use cmpsim_core::uop::{BarKind, CfType, MemType, OpType};
use cmpsim_core::{FixedLatencyMemory, Params, SimLoop, SimSummary};

/// A small machine that converges quickly in tests.
pub fn test_params() -> Params {
    let mut p = Params::default();
    p.general.heartbeat_interval = 0;
    p.general.forward_progress_limit = 20_000;
    p.general.forward_progress_interval = 1_000;
    p.core.node_table_size = 32;
    p.core.rs_sizes = "8,8,8,8".into();
    p.memory.mem_latency = 20;
    p
}

/// Runs `programs` on a machine described by `params` until every core
/// completes. Returns the summary and the finished simulator.
pub fn run_trace(params: Params, programs: Vec<Vec<TraceRecord>>) -> (SimSummary, SimLoop) {
    params.validate().unwrap();
    let frontend = Box::new(TraceFrontend::new(programs));
    let memory = Box::new(FixedLatencyMemory::new(
        params.memory.mem_latency,
        params.memory.mem_req_buffer_entries,
    ));
    let mut sim = SimLoop::new(params, frontend, memory).unwrap();
    let summary = sim.run().unwrap();
    (summary, sim)
}

/// A straight-line program of `n` non-CF ops starting at `base`.
pub fn straight_line(base: u64, n: usize) -> Vec<TraceRecord> {
    let mut b = TraceBuilder::new();
    for i in 0..n {
        b = b.plain(base + (i as u64) * 4);
    }
    b.build()
}

/// Appends a conditional branch at `addr` to `builder`.
pub fn cbr(builder: TraceBuilder, addr: u64, taken: bool, target: u64) -> TraceBuilder {
    builder.op(|r| {
        r.addr = addr;
        r.table.op_type = OpType::Cf;
        r.table.cf_type = CfType::Cbr;
        r.dir = taken;
        r.target = target;
        r.npc = if taken { target } else { addr + 4 };
    })
}

/// Appends an indirect branch at `addr` to `builder`.
pub fn ibr(builder: TraceBuilder, addr: u64, target: u64) -> TraceBuilder {
    builder.op(|r| {
        r.addr = addr;
        r.table.op_type = OpType::Cf;
        r.table.cf_type = CfType::Ibr;
        r.dir = true;
        r.target = target;
        r.npc = target;
    })
}

/// Appends a direct call at `addr` to `builder`.
pub fn call(builder: TraceBuilder, addr: u64, target: u64) -> TraceBuilder {
    builder.op(|r| {
        r.addr = addr;
        r.table.op_type = OpType::Cf;
        r.table.cf_type = CfType::Call;
        r.dir = true;
        r.target = target;
        r.npc = target;
    })
}

/// Appends a return at `addr` to `builder`.
pub fn ret(builder: TraceBuilder, addr: u64, target: u64) -> TraceBuilder {
    builder.op(|r| {
        r.addr = addr;
        r.table.op_type = OpType::Cf;
        r.table.cf_type = CfType::Ret;
        r.dir = true;
        r.target = target;
        r.npc = target;
    })
}

/// Appends a system call (fetch barrier) at `addr` to `builder`.
pub fn syscall(builder: TraceBuilder, addr: u64) -> TraceBuilder {
    builder.op(|r| {
        r.addr = addr;
        r.table.op_type = OpType::Cf;
        r.table.cf_type = CfType::Sys;
        r.table.bar_type = BarKind::FetchIssue;
        r.dir = true;
        r.target = addr + 4;
        r.npc = addr + 4;
    })
}

/// Appends a load at `addr` touching `va` to `builder`.
pub fn load(builder: TraceBuilder, addr: u64, va: u64) -> TraceBuilder {
    builder.op(|r| {
        r.addr = addr;
        r.npc = addr + 4;
        r.table.op_type = OpType::Imem;
        r.table.mem_type = MemType::Load;
        r.va = va;
        r.mem_size = 8;
    })
}

/// Appends a store at `addr` touching `va` to `builder`.
pub fn store(builder: TraceBuilder, addr: u64, va: u64) -> TraceBuilder {
    builder.op(|r| {
        r.addr = addr;
        r.npc = addr + 4;
        r.table.op_type = OpType::Imem;
        r.table.mem_type = MemType::Store;
        r.va = va;
        r.mem_size = 8;
    })
}

/// A memory system that accepts requests and never completes them; used
/// to drive the forward-progress watchdog.
#[derive(Debug, Default)]
pub struct BlackholeMemory;

impl MemorySystem for BlackholeMemory {
    fn can_allocate(&self, _proc_id: usize, _kind: MemReqKind) -> bool {
        true
    }

    fn new_req(
        &mut self,
        _kind: MemReqKind,
        _proc_id: usize,
        _addr: u64,
        _size: u64,
        _priority: u32,
        _op: Option<(cmpsim_core::uop::OpId, Counter)>,
        _off_path: bool,
        _unique_num: Counter,
        _cycle: Counter,
    ) -> bool {
        true
    }

    fn cycle(&mut self, _cycle: Counter) -> Vec<MemReq> {
        Vec::new()
    }

    fn flush_core(&mut self, _proc_id: usize) {}
}

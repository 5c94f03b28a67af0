//! Memory-system interface and the fixed-latency stand-in.
//!
//! The core emits requests through [`MemorySystem::new_req`]; a request is
//! rejected when the outstanding-request buffer is full, and the rejected
//! stage retries every cycle from its stall state. Completions are returned
//! from [`MemorySystem::cycle`] and routed by the model driver to the
//! owning core's I-cache or D-cache fill path.
//!
//! The bundled [`FixedLatencyMemory`] answers every request after a flat
//! latency. It is the only truly shared structure between cores, which is
//! exactly what makes cross-core interference (and the bogus-rerun policy)
//! observable: a finished core rerunning in bogus mode keeps competing for
//! the same request buffer.

use std::collections::VecDeque;

use tracing::debug;

use crate::common::{Addr, Counter, ProcId};
use crate::uop::OpId;

/// Kind of a memory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemReqKind {
    /// Demand instruction fetch.
    Ifetch,
    /// Instruction prefetch (fire and forget).
    Iprf,
    /// Demand data fetch (load miss).
    Dfetch,
}

/// One outstanding memory request.
#[derive(Debug, Clone)]
pub struct MemReq {
    /// Request kind.
    pub kind: MemReqKind,
    /// Requesting core.
    pub proc_id: ProcId,
    /// Line address requested.
    pub addr: Addr,
    /// Bytes requested.
    pub size: u64,
    /// Priority hint (unused by the flat model, carried for the interface).
    pub priority: u32,
    /// Op waiting on this request, with its unique number for staleness
    /// checks after recoveries.
    pub op: Option<(OpId, Counter)>,
    /// Whether the request was issued from the wrong path.
    pub off_path: bool,
    /// Global unique number of the op that triggered the request.
    pub unique_num: Counter,
    /// Cycle the fill completes.
    pub done_cycle: Counter,
}

/// Downstream memory interface consumed by the core.
pub trait MemorySystem: std::fmt::Debug {
    /// Whether a request buffer entry is available for `proc_id`.
    fn can_allocate(&self, proc_id: ProcId, kind: MemReqKind) -> bool;

    /// Submits a request. Returns false when the request buffer is full
    /// (the caller retries next cycle).
    #[allow(clippy::too_many_arguments)]
    fn new_req(
        &mut self,
        kind: MemReqKind,
        proc_id: ProcId,
        addr: Addr,
        size: u64,
        priority: u32,
        op: Option<(OpId, Counter)>,
        off_path: bool,
        unique_num: Counter,
        cycle: Counter,
    ) -> bool;

    /// Advances one cycle and returns the requests whose fills complete
    /// this cycle, oldest first.
    fn cycle(&mut self, cycle: Counter) -> Vec<MemReq>;

    /// Drops every in-flight request of `proc_id` (bogus-mode restart).
    fn flush_core(&mut self, proc_id: ProcId);
}

/// Flat-latency memory with a bounded request buffer.
#[derive(Debug)]
pub struct FixedLatencyMemory {
    latency: Counter,
    buffer_entries: usize,
    in_flight: VecDeque<MemReq>,
}

impl FixedLatencyMemory {
    /// Creates a memory model with the given fill latency and buffer size.
    pub fn new(latency: Counter, buffer_entries: usize) -> Self {
        Self {
            latency,
            buffer_entries,
            in_flight: VecDeque::new(),
        }
    }

    /// Number of requests currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }
}

impl MemorySystem for FixedLatencyMemory {
    fn can_allocate(&self, _proc_id: ProcId, _kind: MemReqKind) -> bool {
        self.in_flight.len() < self.buffer_entries
    }

    fn new_req(
        &mut self,
        kind: MemReqKind,
        proc_id: ProcId,
        addr: Addr,
        size: u64,
        priority: u32,
        op: Option<(OpId, Counter)>,
        off_path: bool,
        unique_num: Counter,
        cycle: Counter,
    ) -> bool {
        if self.in_flight.len() >= self.buffer_entries {
            return false;
        }
        debug!(
            target: "memory",
            proc = proc_id,
            ?kind,
            addr = format_args!("{addr:#x}"),
            done = cycle + self.latency,
            "request accepted"
        );
        self.in_flight.push_back(MemReq {
            kind,
            proc_id,
            addr,
            size,
            priority,
            op,
            off_path,
            unique_num,
            done_cycle: cycle + self.latency,
        });
        true
    }

    fn cycle(&mut self, cycle: Counter) -> Vec<MemReq> {
        let mut done = Vec::new();
        // flat latency preserves order, so completions sit at the front
        while self
            .in_flight
            .front()
            .is_some_and(|req| req.done_cycle <= cycle)
        {
            if let Some(req) = self.in_flight.pop_front() {
                done.push(req);
            }
        }
        done
    }

    fn flush_core(&mut self, proc_id: ProcId) {
        self.in_flight.retain(|req| req.proc_id != proc_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_after_latency() {
        let mut mem = FixedLatencyMemory::new(10, 4);
        assert!(mem.new_req(MemReqKind::Ifetch, 0, 0x1000, 64, 0, None, false, 1, 5));
        assert!(mem.cycle(14).is_empty());
        let done = mem.cycle(15);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].addr, 0x1000);
        assert_eq!(done[0].kind, MemReqKind::Ifetch);
        assert_eq!(mem.outstanding(), 0);
    }

    #[test]
    fn test_buffer_full_rejects() {
        let mut mem = FixedLatencyMemory::new(10, 2);
        assert!(mem.new_req(MemReqKind::Dfetch, 0, 0x0, 64, 0, None, false, 1, 0));
        assert!(mem.new_req(MemReqKind::Dfetch, 0, 0x40, 64, 0, None, false, 2, 0));
        assert!(!mem.can_allocate(0, MemReqKind::Dfetch));
        assert!(!mem.new_req(MemReqKind::Dfetch, 0, 0x80, 64, 0, None, false, 3, 0));
        // drain frees the buffer
        let _ = mem.cycle(10);
        assert!(mem.can_allocate(0, MemReqKind::Dfetch));
    }

    #[test]
    fn test_completions_oldest_first() {
        let mut mem = FixedLatencyMemory::new(5, 4);
        mem.new_req(MemReqKind::Ifetch, 0, 0x0, 64, 0, None, false, 1, 0);
        mem.new_req(MemReqKind::Dfetch, 1, 0x40, 64, 0, None, false, 2, 1);
        let done = mem.cycle(6);
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].unique_num, 1);
        assert_eq!(done[1].unique_num, 2);
    }

    #[test]
    fn test_flush_core_drops_only_that_core() {
        let mut mem = FixedLatencyMemory::new(5, 4);
        mem.new_req(MemReqKind::Dfetch, 0, 0x0, 64, 0, None, false, 1, 0);
        mem.new_req(MemReqKind::Dfetch, 1, 0x40, 64, 0, None, false, 2, 0);
        mem.flush_core(0);
        assert_eq!(mem.outstanding(), 1);
        let done = mem.cycle(5);
        assert_eq!(done[0].proc_id, 1);
    }
}

//! Trace-driven front-end.
//!
//! Replays a recorded uop stream per core. Each record carries the static
//! classification and the oracle outcome of one dynamic uop. After a
//! `redirect` the front-end synthesizes plausible wrong-path filler ops at
//! the requested address until a `recover` returns it to the recorded
//! stream; a `reopen` rewinds the whole stream for a bogus-mode rerun.
//!
//! Instruction uids are 1-based positions in the recorded stream, so
//! "recover to after uid" is a direct index assignment.

use std::rc::Rc;

use serde::Deserialize;
use tracing::debug;

use crate::common::{Addr, ProcId};
use crate::uop::{InstInfo, Op, OracleInfo, TableInfo};

use super::Frontend;

/// One recorded dynamic uop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceRecord {
    /// Instruction address.
    pub addr: Addr,
    /// Instruction size in bytes.
    pub size: u64,
    /// Static classification.
    pub table: TableInfo,
    /// Source architectural registers.
    pub srcs: Vec<u16>,
    /// Destination architectural registers.
    pub dests: Vec<u16>,
    /// Oracle direction.
    pub dir: bool,
    /// Oracle target.
    pub target: Addr,
    /// Committed next PC.
    pub npc: Addr,
    /// Memory virtual address.
    pub va: Addr,
    /// Memory access size.
    pub mem_size: u8,
    /// First uop of its macro instruction.
    pub bom: bool,
    /// Last uop of its macro instruction.
    pub eom: bool,
}

impl Default for TraceRecord {
    fn default() -> Self {
        Self {
            addr: 0,
            size: 4,
            table: TableInfo::default(),
            srcs: Vec::new(),
            dests: Vec::new(),
            dir: false,
            target: 0,
            npc: 0,
            va: 0,
            mem_size: 0,
            bom: true,
            eom: true,
        }
    }
}

#[derive(Debug)]
struct CoreStream {
    records: Vec<TraceRecord>,
    /// Shared static info, one per record.
    insts: Vec<Rc<InstInfo>>,
    /// Index of the next on-path record.
    pos: usize,
    /// Whether the stream is serving synthesized wrong-path ops.
    off_path: bool,
    /// Address of the next synthesized wrong-path op.
    off_path_addr: Addr,
    /// The exit marker has retired.
    exit_retired: bool,
}

impl CoreStream {
    fn new(records: Vec<TraceRecord>) -> Self {
        let insts = records
            .iter()
            .map(|r| {
                Rc::new(InstInfo {
                    addr: r.addr,
                    size: r.size,
                    table: r.table.clone(),
                    srcs: r.srcs.clone(),
                    dests: r.dests.clone(),
                })
            })
            .collect();
        Self {
            records,
            insts,
            pos: 0,
            off_path: false,
            off_path_addr: 0,
            exit_retired: false,
        }
    }
}

/// Trace front-end over per-core recorded streams.
#[derive(Debug)]
pub struct TraceFrontend {
    streams: Vec<CoreStream>,
}

/// Size of synthesized wrong-path filler ops.
const OFF_PATH_INST_SIZE: u64 = 4;

impl TraceFrontend {
    /// Creates a front-end from one recorded stream per core.
    pub fn new(programs: Vec<Vec<TraceRecord>>) -> Self {
        Self {
            streams: programs.into_iter().map(CoreStream::new).collect(),
        }
    }

    /// Whether the exit marker of `proc_id` has retired.
    pub fn exit_retired(&self, proc_id: ProcId) -> bool {
        self.streams[proc_id].exit_retired
    }
}

impl Frontend for TraceFrontend {
    fn next_fetch_addr(&mut self, proc_id: ProcId) -> Addr {
        let s = &self.streams[proc_id];
        if s.off_path {
            s.off_path_addr
        } else if let Some(r) = s.records.get(s.pos) {
            r.addr
        } else {
            // stream exhausted; report the last fall-through
            s.records.last().map_or(0, |r| r.npc)
        }
    }

    fn can_fetch_op(&mut self, proc_id: ProcId) -> bool {
        let s = &self.streams[proc_id];
        s.off_path || s.pos < s.records.len()
    }

    fn fetch_op(&mut self, proc_id: ProcId, op: &mut Op) {
        let s = &mut self.streams[proc_id];
        if s.off_path {
            // wrong-path filler: a straight-line non-memory op
            op.inst = Rc::new(InstInfo {
                addr: s.off_path_addr,
                size: OFF_PATH_INST_SIZE,
                table: TableInfo::default(),
                srcs: Vec::new(),
                dests: Vec::new(),
            });
            op.oracle = OracleInfo {
                dir: false,
                target: 0,
                npc: s.off_path_addr + OFF_PATH_INST_SIZE,
                va: 0,
                mem_size: 0,
            };
            op.bom = true;
            op.eom = true;
            op.exit = false;
            op.inst_uid = 0;
            s.off_path_addr += OFF_PATH_INST_SIZE;
            return;
        }

        debug_assert!(s.pos < s.records.len(), "fetch_op past end of trace");
        let r = &s.records[s.pos];
        op.inst = Rc::clone(&s.insts[s.pos]);
        op.oracle = OracleInfo {
            dir: r.dir,
            target: r.target,
            npc: r.npc,
            va: r.va,
            mem_size: r.mem_size,
        };
        op.bom = r.bom;
        op.eom = r.eom;
        op.exit = s.pos + 1 == s.records.len();
        op.inst_uid = (s.pos + 1) as u64;
        s.pos += 1;
    }

    fn redirect(&mut self, proc_id: ProcId, inst_uid: u64, fetch_addr: Addr) {
        debug!(
            target: "frontend",
            proc = proc_id,
            inst_uid,
            fetch_addr = format_args!("{fetch_addr:#x}"),
            "redirect"
        );
        let s = &mut self.streams[proc_id];
        s.off_path = true;
        s.off_path_addr = fetch_addr;
    }

    fn recover(&mut self, proc_id: ProcId, inst_uid: u64) {
        debug!(target: "frontend", proc = proc_id, inst_uid, "recover");
        let s = &mut self.streams[proc_id];
        s.off_path = false;
        if inst_uid > 0 && (inst_uid as usize) <= s.records.len() {
            // uid is the 1-based position: resume right after it
            s.pos = inst_uid as usize;
        }
    }

    fn retire(&mut self, proc_id: ProcId, inst_uid: Option<u64>) {
        if inst_uid.is_none() {
            self.streams[proc_id].exit_retired = true;
        }
    }

    fn reopen(&mut self, proc_id: ProcId) -> bool {
        let s = &mut self.streams[proc_id];
        s.pos = 0;
        s.off_path = false;
        s.off_path_addr = 0;
        s.exit_retired = false;
        true
    }

    fn done(&mut self, retired_exit: &[bool]) {
        for (proc_id, retired) in retired_exit.iter().enumerate() {
            debug!(target: "frontend", proc = proc_id, retired, "trace closed");
        }
    }
}

/// Convenience builder for recorded streams (used by tests and the demo
/// trace generator).
#[derive(Debug, Default)]
pub struct TraceBuilder {
    records: Vec<TraceRecord>,
}

impl TraceBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an op built from a default record mutated by `f`.
    pub fn op(mut self, f: impl FnOnce(&mut TraceRecord)) -> Self {
        let mut r = TraceRecord::default();
        f(&mut r);
        self.records.push(r);
        self
    }

    /// Appends a straight-line non-CF op at `addr`.
    pub fn plain(self, addr: Addr) -> Self {
        self.op(|r| {
            r.addr = addr;
            r.npc = addr + 4;
        })
    }

    /// Finishes the stream.
    pub fn build(self) -> Vec<TraceRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use crate::uop::OpPool;

    use super::*;

    fn straight_line(n: usize) -> Vec<TraceRecord> {
        let mut b = TraceBuilder::new();
        for i in 0..n {
            b = b.plain(0x1000 + (i as Addr) * 4);
        }
        b.build()
    }

    #[test]
    fn test_replays_in_order() {
        let mut fe = TraceFrontend::new(vec![straight_line(3)]);
        let mut pool = OpPool::new(0);
        assert_eq!(fe.next_fetch_addr(0), 0x1000);
        for i in 0..3 {
            assert!(fe.can_fetch_op(0));
            let id = pool.alloc(i + 1, i + 1, i + 1).unwrap();
            fe.fetch_op(0, pool.get_mut(id));
            let op = pool.get(id);
            assert_eq!(op.inst.addr, 0x1000 + i * 4);
            assert_eq!(op.inst_uid, i + 1);
        }
        assert!(!fe.can_fetch_op(0));
    }

    #[test]
    fn test_exit_flag_on_last_record() {
        let mut fe = TraceFrontend::new(vec![straight_line(2)]);
        let mut pool = OpPool::new(0);
        let a = pool.alloc(1, 1, 1).unwrap();
        fe.fetch_op(0, pool.get_mut(a));
        assert!(!pool.get(a).exit);
        let b = pool.alloc(2, 2, 2).unwrap();
        fe.fetch_op(0, pool.get_mut(b));
        assert!(pool.get(b).exit);
    }

    #[test]
    fn test_redirect_synthesizes_wrong_path() {
        let mut fe = TraceFrontend::new(vec![straight_line(4)]);
        let mut pool = OpPool::new(0);
        let a = pool.alloc(1, 1, 1).unwrap();
        fe.fetch_op(0, pool.get_mut(a));
        fe.redirect(0, 1, 0x9000);
        assert_eq!(fe.next_fetch_addr(0), 0x9000);
        let w = pool.alloc(2, 2, 2).unwrap();
        fe.fetch_op(0, pool.get_mut(w));
        assert_eq!(pool.get(w).inst.addr, 0x9000);
        assert_eq!(pool.get(w).inst_uid, 0);
        assert_eq!(fe.next_fetch_addr(0), 0x9004);
    }

    #[test]
    fn test_recover_resumes_after_uid() {
        let mut fe = TraceFrontend::new(vec![straight_line(4)]);
        let mut pool = OpPool::new(0);
        let a = pool.alloc(1, 1, 1).unwrap();
        fe.fetch_op(0, pool.get_mut(a)); // uid 1
        fe.redirect(0, 1, 0x9000);
        let w = pool.alloc(2, 2, 2).unwrap();
        fe.fetch_op(0, pool.get_mut(w));
        fe.recover(0, 1);
        assert_eq!(fe.next_fetch_addr(0), 0x1004);
        let b = pool.alloc(3, 3, 3).unwrap();
        fe.fetch_op(0, pool.get_mut(b));
        assert_eq!(pool.get(b).inst_uid, 2);
    }

    #[test]
    fn test_reopen_rewinds() {
        let mut fe = TraceFrontend::new(vec![straight_line(2)]);
        let mut pool = OpPool::new(0);
        let a = pool.alloc(1, 1, 1).unwrap();
        fe.fetch_op(0, pool.get_mut(a));
        fe.retire(0, None);
        assert!(fe.exit_retired(0));
        assert!(fe.reopen(0));
        assert!(!fe.exit_retired(0));
        assert_eq!(fe.next_fetch_addr(0), 0x1000);
    }
}

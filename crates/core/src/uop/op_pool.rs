//! Bounded-growth arena for op records.
//!
//! Ops are allocated once and recycled through a free list, eliminating
//! per-op heap traffic. Handles ([`OpId`]) stay stable across the pool's
//! lifetime; a freed slot keeps its id and is handed out again later, so
//! holders of stale handles must compare unique numbers before trusting one.

use std::rc::Rc;

use tracing::debug;

use crate::common::{Counter, ProcId, SimResult};
use crate::{ensure, fatal};

use super::op::{InstInfo, Op, OpId};

/// Slots added per pool expansion.
const OP_POOL_ENTRIES_INC: usize = 128;

/// Hard cap on pool growth; exceeding it means ops are leaking.
const OP_POOL_MAX_ENTRIES: usize = OP_POOL_ENTRIES_INC * 128;

/// Arena of op records with a free list.
#[derive(Debug)]
pub struct OpPool {
    proc_id: ProcId,
    slots: Vec<Op>,
    free_head: Option<OpId>,
    active_ops: usize,
    invalid_inst: Rc<InstInfo>,
}

impl OpPool {
    /// Creates a pool with one expansion's worth of free slots.
    pub fn new(proc_id: ProcId) -> Self {
        let mut pool = Self {
            proc_id,
            slots: Vec::with_capacity(OP_POOL_ENTRIES_INC),
            free_head: None,
            active_ops: 0,
            invalid_inst: Rc::new(InstInfo::default()),
        };
        pool.expand();
        pool
    }

    /// Number of slots ever created.
    #[inline]
    pub fn entries(&self) -> usize {
        self.slots.len()
    }

    /// Number of live ops.
    #[inline]
    pub fn active_ops(&self) -> usize {
        self.active_ops
    }

    /// The shared "invalid" static info installed into fresh ops.
    #[inline]
    pub fn invalid_inst(&self) -> Rc<InstInfo> {
        Rc::clone(&self.invalid_inst)
    }

    fn expand(&mut self) {
        let base = self.slots.len();
        debug!(
            target: "op_pool",
            proc = self.proc_id,
            new_size = base + OP_POOL_ENTRIES_INC,
            "expanding op pool"
        );
        for i in 0..OP_POOL_ENTRIES_INC {
            let id = (base + i) as u32;
            let mut op = Op::shell(id, Rc::clone(&self.invalid_inst));
            op.op_pool_next = if i + 1 < OP_POOL_ENTRIES_INC {
                Some(OpId(id + 1))
            } else {
                self.free_head
            };
            self.slots.push(op);
        }
        self.free_head = Some(OpId(base as u32));
    }

    /// Hands out a fresh op with all engine-visible fields reset.
    ///
    /// `op_num`/`unique_num`/`unique_num_per_proc` come from the caller's
    /// counters; the pool does not own instruction numbering.
    pub fn alloc(
        &mut self,
        op_num: Counter,
        unique_num: Counter,
        unique_num_per_proc: Counter,
    ) -> SimResult<OpId> {
        if self.free_head.is_none() {
            ensure!(
                self.active_ops == self.slots.len(),
                self.proc_id,
                "op pool free list empty with {} of {} active",
                self.active_ops,
                self.slots.len()
            );
            if self.slots.len() >= OP_POOL_MAX_ENTRIES {
                fatal!(
                    self.proc_id,
                    "op pool exceeded {OP_POOL_MAX_ENTRIES} entries; ops are leaking"
                );
            }
            self.expand();
        }

        let Some(id) = self.free_head else {
            fatal!(self.proc_id, "op pool expansion produced no free slots");
        };
        let proc_id = self.proc_id;
        let invalid_inst = Rc::clone(&self.invalid_inst);
        let op = &mut self.slots[id.index()];
        ensure!(!op.op_pool_valid, proc_id, "free list held a live op");
        self.free_head = op.op_pool_next;
        op.op_pool_valid = true;
        op.op_pool_next = None;
        op.reset(proc_id, op_num, unique_num, unique_num_per_proc, invalid_inst);
        self.active_ops += 1;
        debug!(
            target: "op_pool",
            proc = self.proc_id,
            id = op.op_pool_id,
            active = self.active_ops,
            "allocated op"
        );
        Ok(id)
    }

    /// Returns a slot to the free list. Double frees and frees of marked
    /// (retire-hook-held) ops are fatal; the active-op count must never go
    /// negative.
    pub fn free(&mut self, id: OpId) -> SimResult<()> {
        let proc_id = self.proc_id;
        let op = &mut self.slots[id.index()];
        ensure!(op.op_pool_valid, proc_id, "double free of op slot {}", op.op_pool_id);
        ensure!(!op.marked, proc_id, "freeing marked op {}", op.op_num);
        op.op_pool_valid = false;
        for list in &mut op.wake_up_lists {
            list.clear();
        }
        op.op_pool_next = self.free_head;
        self.free_head = Some(id);
        ensure!(self.active_ops > 0, proc_id, "active op count underflow");
        self.active_ops -= 1;
        debug!(
            target: "op_pool",
            proc = self.proc_id,
            id = self.slots[id.index()].op_pool_id,
            active = self.active_ops,
            "freed op"
        );
        Ok(())
    }

    /// Borrows a live op.
    ///
    /// # Panics
    ///
    /// Panics if the slot is free; holding an [`OpId`] across a free is a
    /// simulator bug (stale holders must check [`OpPool::is_live`] first).
    #[inline]
    pub fn get(&self, id: OpId) -> &Op {
        let op = &self.slots[id.index()];
        assert!(op.op_pool_valid, "access to freed op slot {}", id.0);
        op
    }

    /// Mutably borrows a live op.
    ///
    /// # Panics
    ///
    /// Panics if the slot is free (see [`OpPool::get`]).
    #[inline]
    pub fn get_mut(&mut self, id: OpId) -> &mut Op {
        let op = &mut self.slots[id.index()];
        assert!(op.op_pool_valid, "access to freed op slot {}", id.0);
        op
    }

    /// Whether `id` currently holds the live op with `unique_num`. Used to
    /// discard stale rename-table and wake-up entries after slot recycling.
    #[inline]
    pub fn is_live(&self, id: OpId, unique_num: Counter) -> bool {
        let op = &self.slots[id.index()];
        op.op_pool_valid && op.unique_num == unique_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_cycle() {
        let mut pool = OpPool::new(0);
        let id = pool.alloc(1, 1, 1).unwrap();
        assert_eq!(pool.active_ops(), 1);
        assert_eq!(pool.get(id).op_num, 1);
        pool.free(id).unwrap();
        assert_eq!(pool.active_ops(), 0);
    }

    #[test]
    fn test_double_free_is_fatal() {
        let mut pool = OpPool::new(0);
        let id = pool.alloc(1, 1, 1).unwrap();
        pool.free(id).unwrap();
        assert!(pool.free(id).is_err());
    }

    #[test]
    fn test_free_of_marked_op_is_fatal() {
        let mut pool = OpPool::new(0);
        let id = pool.alloc(1, 1, 1).unwrap();
        pool.get_mut(id).marked = true;
        assert!(pool.free(id).is_err());
    }

    #[test]
    fn test_pool_grows_past_first_block() {
        let mut pool = OpPool::new(0);
        let mut ids = Vec::new();
        for n in 0..(OP_POOL_ENTRIES_INC as u64 + 10) {
            ids.push(pool.alloc(n + 1, n + 1, n + 1).unwrap());
        }
        assert!(pool.entries() >= 2 * OP_POOL_ENTRIES_INC);
        assert_eq!(pool.active_ops(), OP_POOL_ENTRIES_INC + 10);
        for id in ids {
            pool.free(id).unwrap();
        }
        assert_eq!(pool.active_ops(), 0);
    }

    #[test]
    fn test_stale_handle_detection() {
        let mut pool = OpPool::new(0);
        let id = pool.alloc(1, 77, 1).unwrap();
        assert!(pool.is_live(id, 77));
        pool.free(id).unwrap();
        assert!(!pool.is_live(id, 77));
        // slot is recycled with a different unique number
        let id2 = pool.alloc(2, 78, 2).unwrap();
        assert_eq!(id, id2);
        assert!(!pool.is_live(id, 77));
        assert!(pool.is_live(id, 78));
    }

    #[test]
    fn test_wake_lists_cleared_on_free() {
        let mut pool = OpPool::new(0);
        let id = pool.alloc(1, 1, 1).unwrap();
        pool.get_mut(id).wake_up_lists[0].push(crate::uop::WakeUpEntry {
            op: OpId(5),
            unique_num: 3,
            src_index: 0,
        });
        pool.free(id).unwrap();
        let id2 = pool.alloc(2, 2, 2).unwrap();
        assert!(pool.get(id2).wake_up_lists[0].is_empty());
    }
}

//! Register renaming and the wake-up dependency graph.
//!
//! The map tracks, per architectural register, the last in-flight op to
//! write it. Renaming an op wires a wake-up edge from each still-pending
//! producer to the op and sets the matching bit in the op's
//! `srcs_not_rdy_vector`; the op becomes schedulable when the vector is
//! zero. Stores additionally register themselves in a store hash so later
//! loads can pick up address/data dependences.
//!
//! Producers are referenced by handle + unique number; a recovery frees
//! flushed producers and the liveness check quietly retires their stale
//! map entries, so no explicit map rollback walk is needed.

use std::collections::HashMap;

use tracing::debug;

use crate::common::{Addr, Counter, ProcId};
use crate::uop::{DepType, MemType, OpId, OpPool, WakeUpEntry};

/// Source-vector bit reserved for a store-address dependence.
pub const MEM_ADDR_DEP_BIT: u32 = 62;
/// Source-vector bit reserved for a store-data dependence.
pub const MEM_DATA_DEP_BIT: u32 = 63;

/// Store-to-load aliasing granularity in bytes.
const STORE_HASH_GRAIN: Addr = 8;

/// Record of the last op to write a register (or the last store).
#[derive(Debug, Clone, Copy)]
pub struct MapEntry {
    /// Producer handle.
    pub op: OpId,
    /// Producer op number.
    pub op_num: Counter,
    /// Producer unique number, for stale-entry detection.
    pub unique_num: Counter,
}

/// Per-core rename and memory-dependence state.
#[derive(Debug)]
pub struct MapData {
    proc_id: ProcId,
    reg_map: Vec<Option<MapEntry>>,
    last_store: Option<MapEntry>,
    store_hash: HashMap<Addr, MapEntry>,
}

impl MapData {
    /// Architectural register id space.
    pub const NUM_REG_IDS: usize = 256;

    /// Creates an empty map for one core.
    pub fn new(proc_id: ProcId) -> Self {
        Self {
            proc_id,
            reg_map: vec![None; Self::NUM_REG_IDS],
            last_store: None,
            store_hash: HashMap::new(),
        }
    }

    /// Clears all rename and memory-dependence state (bogus-mode restart).
    pub fn reset(&mut self) {
        self.reg_map.iter_mut().for_each(|e| *e = None);
        self.last_store = None;
        self.store_hash.clear();
    }

    /// Wires one dependence edge from the producer described by `entry` to
    /// `consumer`, or inherits the producer's wake cycle if the value was
    /// already broadcast.
    fn add_src_from_entry(
        pool: &mut OpPool,
        consumer: OpId,
        entry: MapEntry,
        dep: DepType,
        src_bit: u32,
    ) {
        if !pool.is_live(entry.op, entry.unique_num) {
            return; // producer committed (or was flushed); source is ready
        }
        let (signaled, wake_cycle, consumer_unique) = {
            let producer = pool.get(entry.op);
            (
                producer.wake_up_signaled[dep as usize],
                producer.wake_cycle,
                pool.get(consumer).unique_num,
            )
        };
        if signaled {
            let c = pool.get_mut(consumer);
            c.rdy_cycle = c.rdy_cycle.max(wake_cycle);
        } else {
            pool.get_mut(entry.op).wake_up_lists[dep as usize].push(WakeUpEntry {
                op: consumer,
                unique_num: consumer_unique,
                src_index: src_bit,
            });
            pool.get_mut(consumer).srcs_not_rdy_vector |= 1 << src_bit;
        }
    }

    /// Renames `op`: builds register wake-up edges from the latest writer
    /// of each source and installs `op` as the latest writer of each
    /// destination.
    pub fn map_op(&mut self, pool: &mut OpPool, op_id: OpId) {
        let (srcs, dests, op_num, unique_num) = {
            let op = pool.get(op_id);
            (
                op.inst.srcs.clone(),
                op.inst.dests.clone(),
                op.op_num,
                op.unique_num,
            )
        };
        for (i, &reg) in srcs.iter().enumerate() {
            debug_assert!((reg as usize) < Self::NUM_REG_IDS);
            if let Some(entry) = self.reg_map[reg as usize] {
                Self::add_src_from_entry(pool, op_id, entry, DepType::RegData, i as u32);
            }
        }
        for &reg in &dests {
            self.reg_map[reg as usize] = Some(MapEntry {
                op: op_id,
                op_num,
                unique_num,
            });
        }
        debug!(
            target: "map",
            proc = self.proc_id,
            op_num,
            not_rdy = pool.get(op_id).srcs_not_rdy_vector,
            "mapped op"
        );
    }

    /// Establishes memory dependences: a load aliasing a pending store
    /// waits for the store's data; a load behind a non-aliasing pending
    /// store waits for that store's address computation. Stores register
    /// themselves for later loads.
    pub fn map_mem_dep(&mut self, pool: &mut OpPool, op_id: OpId) {
        let (mem_type, va, op_num, unique_num) = {
            let op = pool.get(op_id);
            (
                op.inst.table.mem_type,
                op.oracle.va,
                op.op_num,
                op.unique_num,
            )
        };
        let key = va & !(STORE_HASH_GRAIN - 1);
        match mem_type {
            MemType::Load | MemType::Prefetch => {
                let aliasing = self
                    .store_hash
                    .get(&key)
                    .copied()
                    .filter(|e| pool.is_live(e.op, e.unique_num));
                if let Some(entry) = aliasing {
                    Self::add_src_from_entry(
                        pool,
                        op_id,
                        entry,
                        DepType::MemData,
                        MEM_DATA_DEP_BIT,
                    );
                } else if let Some(entry) = self
                    .last_store
                    .filter(|e| pool.is_live(e.op, e.unique_num))
                {
                    Self::add_src_from_entry(
                        pool,
                        op_id,
                        entry,
                        DepType::MemAddr,
                        MEM_ADDR_DEP_BIT,
                    );
                }
            }
            MemType::Store => {
                let entry = MapEntry {
                    op: op_id,
                    op_num,
                    unique_num,
                };
                self.last_store = Some(entry);
                self.store_hash.insert(key, entry);
            }
            MemType::NotMem => {}
        }
    }

    /// Drops the store-hash entry owned by a store being freed (stale
    /// entries from younger overwrites are left to the liveness check).
    pub fn delete_store_hash_entry(&mut self, va: Addr, unique_num: Counter) {
        let key = va & !(STORE_HASH_GRAIN - 1);
        if self
            .store_hash
            .get(&key)
            .is_some_and(|e| e.unique_num == unique_num)
        {
            self.store_hash.remove(&key);
        }
    }

    /// Signals completion of `producer`'s `dep`-kind value: clears the
    /// matching not-ready bit of every live consumer and returns the
    /// consumers whose source vector just reached zero (the caller moves
    /// those into the ready list if they already sit in an RS).
    pub fn wake_up_ops(pool: &mut OpPool, producer: OpId, dep: DepType) -> Vec<OpId> {
        let (entries, wake_cycle) = {
            let p = pool.get_mut(producer);
            p.wake_up_signaled[dep as usize] = true;
            (p.wake_up_lists[dep as usize].clone(), p.wake_cycle)
        };
        let mut newly_ready = Vec::new();
        for entry in entries {
            if !pool.is_live(entry.op, entry.unique_num) {
                continue; // consumer was flushed and its slot recycled
            }
            let consumer = pool.get_mut(entry.op);
            let was_pending = consumer.srcs_not_rdy_vector & (1 << entry.src_index) != 0;
            consumer.srcs_not_rdy_vector &= !(1 << entry.src_index);
            consumer.rdy_cycle = consumer.rdy_cycle.max(wake_cycle);
            if was_pending && consumer.srcs_not_rdy_vector == 0 {
                newly_ready.push(entry.op);
            }
        }
        newly_ready
    }
}

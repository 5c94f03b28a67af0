//! D-cache stage: load/store completion modeling.
//!
//! Memory ops latched by the exec stage arrive here one cycle later. The
//! stage models a port-limited D-cache: loads probe the tag array and
//! either complete after the hit latency or miss into the memory system;
//! a load that cannot get a request buffer parks in `WaitMem` and is
//! rescheduled once buffers free up. Stores and software prefetches
//! write-allocate and complete after the hit latency. Only timing is
//! modeled — there is no data.

use tracing::debug;

use crate::common::{Counter, ProcId, SimResult};
use crate::config::Params;
use crate::libs::cache::Cache;
use crate::map::MapData;
use crate::memory::{MemReq, MemReqKind, MemorySystem};
use crate::model::PerCore;
use crate::stats::Stat;
use crate::uop::{DepType, MemType, OpId, OpState};

/// D-cache stage state.
#[derive(Debug)]
pub struct DcacheStage {
    /// Owning core.
    pub proc_id: ProcId,
    /// Tag array (timing only).
    pub cache: Cache<()>,
    /// Memory ops handed over by exec, with unique numbers for staleness.
    queue: Vec<(OpId, Counter)>,
    /// Loads the cache accepts per cycle.
    ports: usize,
    /// Hit latency.
    hit_latency: Counter,
    /// Sticky flag: the last allocation attempt found the buffers full.
    pub mem_still_blocked: bool,
}

impl DcacheStage {
    /// Builds the stage from the cache geometry parameters.
    pub fn new(proc_id: ProcId, params: &Params) -> Self {
        let entries = params.memory.dcache_size / params.memory.dcache_line_size as usize;
        Self {
            proc_id,
            cache: Cache::new(
                "DCACHE",
                entries.next_power_of_two(),
                params.memory.dcache_assoc,
                params.memory.dcache_line_size,
            ),
            queue: Vec::new(),
            ports: params.memory.dcache_ports,
            hit_latency: params.memory.dcache_cycles,
            mem_still_blocked: false,
        }
    }

    /// Accepts a memory op latched by the exec stage.
    pub fn enqueue(&mut self, id: OpId, unique_num: Counter) {
        self.queue.push((id, unique_num));
    }

    /// Clears all pending ops (bogus-mode restart).
    pub fn reset(&mut self) {
        self.queue.clear();
        self.mem_still_blocked = false;
    }
}

impl PerCore {
    /// One D-cache cycle: serve up to `ports` pending memory ops.
    pub fn update_dcache_stage(
        &mut self,
        cycle: Counter,
        memory: &mut dyn MemorySystem,
    ) -> SimResult<()> {
        let pending = std::mem::take(&mut self.dcache.queue);
        self.dcache.mem_still_blocked = false;
        let mut served = 0usize;

        for (id, unique_num) in pending {
            if !self.pool.is_live(id, unique_num) {
                continue; // flushed since exec latched it
            }
            if served >= self.dcache.ports {
                // port conflict: the op retries next cycle and its FU
                // stays held
                self.pool.get_mut(id).state = OpState::WaitDcache;
                self.stats.event(Stat::DcachePortConflicts);
                self.dcache.queue.push((id, unique_num));
                continue;
            }
            served += 1;

            let (mem_type, va, off_path, op_num) = {
                let op = self.pool.get(id);
                (op.inst.table.mem_type, op.oracle.va, op.off_path, op.op_num)
            };
            self.pool.get_mut(id).dcache_cycle = cycle;

            match mem_type {
                MemType::Load => {
                    if self.dcache.cache.access(va, true).is_some() {
                        self.stats.event(Stat::DcacheHit);
                        let done = cycle + self.dcache.hit_latency;
                        self.complete_load(id, cycle, done);
                    } else {
                        self.stats.event(Stat::DcacheMiss);
                        let line_addr = self.dcache.cache.line_addr(va);
                        let accepted = memory.new_req(
                            MemReqKind::Dfetch,
                            self.proc_id,
                            line_addr,
                            self.params.memory.dcache_line_size,
                            0,
                            Some((id, unique_num)),
                            off_path,
                            unique_num,
                            cycle,
                        );
                        if accepted {
                            self.stats.event(Stat::MemReqsDfetch);
                            self.pool.get_mut(id).state = OpState::Miss;
                        } else {
                            // out of request buffers: park and retry once
                            // the scheduler sees memory unblocked
                            self.stats.event(Stat::MemReqRejects);
                            self.node.mem_blocked = true;
                            self.dcache.mem_still_blocked =
                                !memory.can_allocate(self.proc_id, MemReqKind::Dfetch);
                            self.pool.get_mut(id).state = OpState::WaitMem;
                        }
                    }
                    debug!(
                        target: "dcache",
                        proc = self.proc_id,
                        op_num,
                        va = format_args!("{va:#x}"),
                        state = ?self.pool.get(id).state,
                        "load served"
                    );
                }
                MemType::Store | MemType::Prefetch => {
                    // write-allocate; completes after the hit latency
                    if self.dcache.cache.access(va, true).is_none() {
                        let _ = self.dcache.cache.insert(va, ());
                    }
                    let op = self.pool.get_mut(id);
                    op.state = OpState::Scheduled;
                    op.done_cycle = cycle + self.dcache.hit_latency;
                }
                MemType::NotMem => {
                    crate::fatal!(self.proc_id, "non-memory op {op_num} in the D-cache stage");
                }
            }

            // the FU lane frees once the access is underway
            self.release_exec_slot(id);
        }
        Ok(())
    }

    /// Completes a load: the value is available at `done_cycle` and its
    /// register consumers wake then.
    fn complete_load(&mut self, id: OpId, cycle: Counter, done_cycle: Counter) {
        {
            let op = self.pool.get_mut(id);
            op.state = OpState::Scheduled;
            op.done_cycle = done_cycle;
            op.wake_cycle = done_cycle;
        }
        let woken = MapData::wake_up_ops(&mut self.pool, id, DepType::RegData);
        for consumer in woken {
            self.wake(consumer, cycle);
        }
    }

    /// Clears the exec-stage lane still holding `id`.
    fn release_exec_slot(&mut self, id: OpId) {
        if let Some(fu_id) = self.pool.get(id).fu_num
            && self.exec.sd.ops[fu_id] == Some(id)
        {
            self.exec.sd.ops[fu_id] = None;
            self.exec.sd.op_count -= 1;
            self.exec.fus[fu_id].held_by_mem = false;
        }
    }

    /// Routes a completed demand-fetch fill back to its load.
    pub fn dcache_fill(&mut self, req: &MemReq, cycle: Counter) {
        let _ = self.dcache.cache.insert(req.addr, ());
        self.stats.event(Stat::DcacheFill);
        let Some((id, unique_num)) = req.op else {
            return;
        };
        if !self.pool.is_live(id, unique_num) {
            return; // the load was flushed while its miss was in flight
        }
        {
            let op = self.pool.get_mut(id);
            op.state = OpState::Done;
            op.done_cycle = cycle + 1;
            op.wake_cycle = cycle + 1;
        }
        let woken = MapData::wake_up_ops(&mut self.pool, id, DepType::RegData);
        for consumer in woken {
            self.wake(consumer, cycle);
        }
        debug!(
            target: "dcache",
            proc = self.proc_id,
            op_num = self.pool.get(id).op_num,
            addr = format_args!("{:#x}", req.addr),
            "miss filled"
        );
    }

    /// Recovery: drops flushed ops from the pending queue.
    pub fn recover_dcache_stage(&mut self) {
        let recovery_op_num = self.bp_recovery.recovery_op_num;
        let pool = &self.pool;
        self.dcache.queue.retain(|&(id, unique_num)| {
            pool.is_live(id, unique_num)
                && !Self::flushes(recovery_op_num, pool.get(id).op_num)
        });
    }
}

//! The simulation loop.
//!
//! Drives the whole machine: advances the frequency domains, routes memory
//! completions, steps every core, enforces the run limits and the
//! forward-progress watchdog, and handles per-core completion with the
//! multi-core bogus-rerun policy — a core that finishes its trace keeps
//! generating memory-system interference for the cores still running,
//! with frozen statistics.
//!
//! Simulation outputs (stats dumps, the pipeview trace) are acquired
//! before the first cycle and finalised exactly once at sim end.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use tracing::info;

use crate::common::{Counter, FatalError, ProcId, SimResult};
use crate::config::Params;
use crate::freq::{DOMAIN_CORES, DOMAIN_MEMORY, FreqSystem};
use crate::frontend::Frontend;
use crate::memory::{MemReqKind, MemorySystem};
use crate::model::PerCore;
use crate::pipeview::Pipeview;
use crate::trigger::Trigger;
use crate::uop::{CfType, MemType};

/// Core clock period in femtoseconds (3.2 GHz).
const CORE_PERIOD_FS: u64 = 312_500;
/// Memory-system clock period in femtoseconds. The bundled memory model
/// counts its latency in core cycles, so the domains tick together.
const MEMORY_PERIOD_FS: u64 = 312_500;

/// Final per-run accounting returned by [`SimLoop::run`].
#[derive(Debug, Clone)]
pub struct SimSummary {
    /// Total core cycles simulated.
    pub cycles: Counter,
    /// Final simulated time in femtoseconds.
    pub sim_time_fs: u64,
    /// Retired macro-instructions per core (first run only for bogus
    /// cores).
    pub inst_counts: Vec<Counter>,
    /// Retired uops per core.
    pub uop_counts: Vec<Counter>,
}

/// The top-level simulator: cores, front-end, memory, clocks and limits.
#[derive(Debug)]
pub struct SimLoop {
    params: Rc<Params>,
    /// The simulated cores.
    pub cores: Vec<PerCore>,
    frontend: Box<dyn Frontend>,
    memory: Box<dyn MemorySystem>,
    freq: FreqSystem,
    unique_count: Counter,
    sim_limit: Trigger,
    clear_stats: Trigger,
    inst_limits: Option<Vec<Counter>>,
    sim_done: Vec<bool>,
    /// First-completion (insts, uops) snapshot per core.
    first_done: Vec<Option<(Counter, Counter)>>,
    /// Latest-completion snapshots for bogus-run reporting.
    sim_done_last: Vec<(Counter, Counter, Counter)>,
    sim_count: Vec<u32>,
    last_forward_progress: Vec<Counter>,
    last_uop_count: Vec<Counter>,
    pipeview: Option<Rc<RefCell<Pipeview>>>,
    output_dir: PathBuf,
    start_time: Instant,
    heartbeat_checked: Counter,
    outputs_finalized: bool,
}

impl SimLoop {
    /// Builds the simulator: cores, clocks, triggers and output files.
    pub fn new(
        params: Params,
        mut frontend: Box<dyn Frontend>,
        memory: Box<dyn MemorySystem>,
    ) -> SimResult<Self> {
        params.validate()?;
        let params = Rc::new(params);
        let num_cores = params.general.num_cores;

        let output_dir = PathBuf::from(&params.general.output_dir);
        std::fs::create_dir_all(&output_dir)?;
        let pipeview = if params.general.pipeview {
            Some(Rc::new(RefCell::new(Pipeview::open(&output_dir)?)))
        } else {
            None
        };

        let mut cores = Vec::with_capacity(num_cores);
        for proc_id in 0..num_cores {
            let mut core = PerCore::new(proc_id, Rc::clone(&params))?;
            core.pipeview = pipeview.clone();
            core.init_fetch(frontend.as_mut());
            cores.push(core);
        }

        Ok(Self {
            sim_limit: Trigger::parse("SIM_LIMIT", &params.general.sim_limit)?,
            clear_stats: Trigger::parse("CLEAR_STATS", &params.general.clear_stats)?,
            inst_limits: params.inst_limits()?,
            sim_done: vec![false; num_cores],
            first_done: vec![None; num_cores],
            sim_done_last: vec![(0, 0, 0); num_cores],
            sim_count: vec![0; num_cores],
            last_forward_progress: vec![0; num_cores],
            last_uop_count: vec![0; num_cores],
            freq: FreqSystem::new(CORE_PERIOD_FS, MEMORY_PERIOD_FS),
            unique_count: 1,
            pipeview,
            output_dir,
            start_time: Instant::now(),
            heartbeat_checked: 0,
            outputs_finalized: false,
            params,
            cores,
            frontend,
            memory,
        })
    }

    /// Runs the simulation to completion. On a fatal error the statistics
    /// are dumped before the error is returned.
    pub fn run(&mut self) -> SimResult<SimSummary> {
        if self.params.general.warmup > 0 {
            self.uop_warmup()?;
        }
        let result = self.full_sim();
        match result {
            Ok(summary) => Ok(summary),
            Err(err) => {
                // fatal path: dump whatever statistics exist, then unwind
                let _ = self.finalize_outputs();
                Err(err)
            }
        }
    }

    /// Warmup: stream instructions through a uop-level loop so predictor
    /// and cache tables are warm, then reset counters and domain cycles
    /// (time is kept).
    fn uop_warmup(&mut self) -> SimResult<()> {
        let warmup = self.params.general.warmup;
        info!(target: "sim", warmup, "uop-mode warmup");
        for proc_id in 0..self.cores.len() {
            let mut streamed: Counter = 0;
            while streamed < warmup && self.frontend.can_fetch_op(proc_id) {
                let core = &mut self.cores[proc_id];
                let id = core.pool.alloc(core.op_count, self.unique_count, 1)?;
                self.frontend.fetch_op(proc_id, core.pool.get_mut(id));
                self.unique_count += 1;

                let (addr, eom, exit, is_cf, va, mem_type, inst_uid) = {
                    let op = core.pool.get(id);
                    (
                        op.inst.addr,
                        op.eom,
                        op.exit,
                        op.inst.table.cf_type.is_cf(),
                        op.oracle.va,
                        op.inst.table.mem_type,
                        op.inst_uid,
                    )
                };
                if exit {
                    crate::fatal!(proc_id, "program ended before the start of simulation");
                }

                // warm the timing structures the pipeline will use
                let _ = core.icache.icache.insert(addr, ());
                if mem_type != MemType::NotMem {
                    let _ = core.dcache.cache.insert(va, ());
                }
                if is_cf {
                    let fetch_addr = addr;
                    let _ = core
                        .bp
                        .predict_op(core.pool.get_mut(id), 0, fetch_addr, &mut core.stats);
                    if core.pool.get(id).inst.table.cf_type != CfType::Sys {
                        core.bp.target_known_op(core.pool.get_mut(id));
                    }
                    core.bp.resolve_op(core.pool.get(id), &mut core.stats);
                    core.bp.retire_op(core.pool.get(id));
                }

                if eom {
                    streamed += 1;
                    self.frontend.retire(proc_id, Some(inst_uid));
                }
                core.pool.free(id)?;
            }
            // the pipeline starts clean: numbering restarts, history clears
            let core = &mut self.cores[proc_id];
            core.op_count = 1;
            core.unique_count_per_core = 1;
            core.bp.reset_speculative_state();
            core.stats.reset();
            core.init_fetch(self.frontend.as_mut());
        }
        self.freq.reset_cycle_counts();
        Ok(())
    }

    /// The main loop of full (cycle-accurate) simulation.
    fn full_sim(&mut self) -> SimResult<SimSummary> {
        let fpi = self.params.general.forward_progress_interval.max(1);
        loop {
            let time_fs = self.freq.advance_time();
            if self.freq.is_ready(DOMAIN_MEMORY) {
                self.route_memory_completions()?;
            }
            if !self.freq.is_ready(DOMAIN_CORES) {
                continue;
            }
            let cycle = self.freq.cycle_count(DOMAIN_CORES);

            for core in &mut self.cores {
                core.cycle(
                    cycle,
                    self.frontend.as_mut(),
                    self.memory.as_mut(),
                    &mut self.unique_count,
                )?;
            }

            self.check_heartbeat(cycle, false);

            let inst_counts: Vec<Counter> = self.cores.iter().map(|c| c.inst_count).collect();
            if self.clear_stats.check(cycle, &inst_counts, time_fs) {
                for core in &mut self.cores {
                    core.stats.reset();
                }
            }

            let mut all_done = true;
            for proc_id in 0..self.cores.len() {
                self.handle_core_completion(proc_id, cycle)?;
                all_done &= self.sim_done[proc_id];
            }

            if cycle % fpi == 0 {
                for proc_id in 0..self.cores.len() {
                    self.check_forward_progress(proc_id, cycle)?;
                }
            }

            if all_done || self.sim_limit.check(cycle, &inst_counts, time_fs) {
                break;
            }
        }

        let cycle = self.freq.cycle_count(DOMAIN_CORES);
        self.check_heartbeat(cycle, true);
        self.finalize_outputs()?;

        // bogus-mode cores keep counting; report their first-run numbers
        let mut inst_counts = Vec::with_capacity(self.cores.len());
        let mut uop_counts = Vec::with_capacity(self.cores.len());
        for (proc_id, core) in self.cores.iter().enumerate() {
            let (insts, uops) =
                self.first_done[proc_id].unwrap_or((core.inst_count, core.uop_count));
            inst_counts.push(insts);
            uop_counts.push(uops);
        }

        Ok(SimSummary {
            cycles: cycle,
            sim_time_fs: self.freq.time(),
            inst_counts,
            uop_counts,
        })
    }

    /// Routes completed memory requests to the owning core's fill paths.
    fn route_memory_completions(&mut self) -> SimResult<()> {
        let cycle = self.freq.cycle_count(DOMAIN_CORES);
        for req in self.memory.cycle(cycle) {
            let core = &mut self.cores[req.proc_id];
            match req.kind {
                MemReqKind::Ifetch | MemReqKind::Iprf => core.icache_fill_line(&req),
                MemReqKind::Dfetch => core.dcache_fill(&req, cycle),
            }
        }
        Ok(())
    }

    /// Per-core completion: dump stats, then — for trace front-ends —
    /// restart the core in bogus mode to preserve interference.
    fn handle_core_completion(&mut self, proc_id: ProcId, cycle: Counter) -> SimResult<()> {
        let reached_limit = self
            .inst_limits
            .as_ref()
            .is_some_and(|limits| self.cores[proc_id].inst_count >= limits[proc_id]);
        let retired_exit = self.cores[proc_id].retired_exit;

        if !self.sim_done[proc_id] && (retired_exit || reached_limit) {
            self.per_core_done(proc_id, cycle)?;
            self.sim_done[proc_id] = true;
            if retired_exit {
                self.start_bogus_run(proc_id, cycle)?;
            }
        } else if self.sim_done[proc_id] && retired_exit {
            // a bogus run completed; report its increment and go again
            self.print_bogus_run(proc_id, cycle);
            self.start_bogus_run(proc_id, cycle)?;
        }
        Ok(())
    }

    fn per_core_done(&mut self, proc_id: ProcId, cycle: Counter) -> SimResult<()> {
        let core = &self.cores[proc_id];
        if self.first_done[proc_id].is_none() {
            self.first_done[proc_id] = Some((core.inst_count, core.uop_count));
        }
        info!(
            target: "sim",
            proc = proc_id,
            insts = core.inst_count,
            uops = core.uop_count,
            cycle,
            "core finished"
        );
        core.stats
            .print(cycle, core.inst_count, core.uop_count);
        core.stats
            .dump_flat(&self.output_dir, cycle, core.inst_count, core.uop_count)?;
        core.stats
            .dump_json(&self.output_dir, cycle, core.inst_count, core.uop_count)?;
        Ok(())
    }

    /// Records the completion point and restarts the core in bogus mode,
    /// if the front-end can rerun. Statistics freeze permanently.
    fn start_bogus_run(&mut self, proc_id: ProcId, cycle: Counter) -> SimResult<()> {
        let core = &mut self.cores[proc_id];
        self.sim_done_last[proc_id] = (cycle, core.inst_count, core.uop_count);
        self.sim_count[proc_id] += 1;
        if !self.frontend.reopen(proc_id) {
            // execution-driven front-ends cannot rerun; the core idles
            core.retired_exit = false;
            return Ok(());
        }
        core.stats.freeze();
        core.reset_for_bogus(self.frontend.as_mut(), self.memory.as_mut())
    }

    fn print_bogus_run(&self, proc_id: ProcId, cycle: Counter) {
        let core = &self.cores[proc_id];
        let (last_cycle, last_inst, last_uop) = self.sim_done_last[proc_id];
        let cycles = (cycle - last_cycle).max(1);
        let insts = core.inst_count - last_inst;
        println!(
            " --Core: {:<2} {} run finished:    insts:{:<10}  uops:{:<10}  cycles:{:<10} -- {:.2} IPC",
            proc_id,
            self.sim_count[proc_id] + 1,
            insts,
            core.uop_count - last_uop,
            cycles,
            insts as f64 / cycles as f64,
        );
    }

    /// The deadlock watchdog: every core must retire within the configured
    /// window or the run aborts with a diagnostic naming the ROB head.
    fn check_forward_progress(&mut self, proc_id: ProcId, cycle: Counter) -> SimResult<()> {
        let core = &self.cores[proc_id];
        if core.uop_count > self.last_uop_count[proc_id] {
            self.last_forward_progress[proc_id] = cycle;
            self.last_uop_count[proc_id] = core.uop_count;
        }
        let last = self.last_forward_progress[proc_id];
        if cycle - last > self.params.general.forward_progress_limit {
            let rob_head = core.node.node_head.map_or_else(
                || "ROB is empty".to_string(),
                |id| core.pool.get(id).describe(),
            );
            return Err(FatalError::ForwardProgress {
                proc_id,
                last_progress: last,
                cycle,
                rob_head,
            });
        }
        Ok(())
    }

    /// Heartbeat: periodic progress lines keyed to core 0's retirement.
    fn check_heartbeat(&mut self, cycle: Counter, fin: bool) {
        let interval = self.params.general.heartbeat_interval;
        if interval == 0 && !fin {
            return;
        }
        let inst0 = self.cores[0].inst_count;
        if !fin && inst0 - self.heartbeat_checked < interval {
            return;
        }
        self.heartbeat_checked = inst0;
        let elapsed = self.start_time.elapsed().as_secs_f64().max(1e-9);
        let total: Counter = self.cores.iter().map(|c| c.inst_count).sum();
        let kips = total as f64 / elapsed / 1000.0;
        let inst_counts: Vec<Counter> = self.cores.iter().map(|c| c.inst_count).collect();
        let progress = self
            .sim_limit
            .progress(cycle, &inst_counts, self.freq.time())
            .max(self.inst_limit_progress());
        if fin {
            println!(
                "** Finished:  insts:{total:<12} cycles:{cycle:<12} -- {kips:.2} KIPS"
            );
        } else {
            print!("** Heartbeat: {:3.0}% -- {{ ", progress * 100.0);
            for count in &inst_counts {
                print!("{count} ");
            }
            println!("}} -- {kips:.2} KIPS");
        }
    }

    fn inst_limit_progress(&self) -> f64 {
        let Some(limits) = &self.inst_limits else {
            return 0.0;
        };
        self.cores
            .iter()
            .zip(limits)
            .map(|(core, &limit)| core.inst_count as f64 / limit.max(1) as f64)
            .fold(1.0, f64::min)
    }

    /// Finalises all outputs exactly once: remaining stats dumps, the
    /// front-end close, and the pipeview trace.
    fn finalize_outputs(&mut self) -> SimResult<()> {
        if self.outputs_finalized {
            return Ok(());
        }
        self.outputs_finalized = true;
        let cycle = self.freq.cycle_count(DOMAIN_CORES);
        for proc_id in 0..self.cores.len() {
            if !self.sim_done[proc_id] {
                self.per_core_done(proc_id, cycle)?;
            }
        }
        let retired: Vec<bool> = self.cores.iter().map(|c| c.retired_exit).collect();
        self.frontend.done(&retired);
        if let Some(pipeview) = &self.pipeview {
            pipeview.borrow_mut().finalize()?;
        }
        Ok(())
    }
}

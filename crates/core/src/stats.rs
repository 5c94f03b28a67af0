//! Per-core simulation statistics.
//!
//! This module tracks the performance counters of one core. It provides:
//! 1. **Event counting:** a flat counter array indexed by [`Stat`], bumped
//!    from every stage.
//! 2. **Stall accounting:** retire-blocked and issue-blocked reason codes.
//! 3. **Reporting:** sectioned text output, a flat `name value` dump file,
//!    and a JSON dump.
//! 4. **Freezing:** a core restarted in bogus mode keeps generating events,
//!    but its counters stop moving.

use std::io::Write;
use std::path::Path;

use crate::common::{ProcId, SimResult};

macro_rules! define_stats {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        /// Countable simulation events.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(usize)]
        #[allow(missing_docs)]
        pub enum Stat {
            $($(#[$meta])* $name),+
        }

        /// Number of [`Stat`] kinds.
        pub const NUM_STATS: usize = [$(Stat::$name),+].len();

        /// Dump names, index-aligned with [`Stat`].
        pub const STAT_NAMES: [&str; NUM_STATS] = [$(stringify!($name)),+];
    };
}

define_stats! {
    // fetch
    FetchCycles,
    FetchCyclesOffPath,
    OpsFetched,
    OpsFetchedOffPath,
    IcacheHit,
    IcacheMiss,
    IcacheFill,
    IcachePrefetchReq,
    // branch prediction
    CbrOnPathCorrect,
    CbrOnPathMispred,
    BpMispred,
    BpMisfetch,
    LateBpMispred,
    LateBpMisfetch,
    BtbHit,
    BtbMiss,
    IbtbHit,
    IbtbMiss,
    CrsPush,
    CrsPop,
    ConfLow,
    Recoveries,
    LateBpRecoveries,
    Redirects,
    /// Cumulative exec-to-issue distance of mispredicted branches.
    BpMispredPenalty,
    // node
    OpsIssued,
    OpsRetired,
    InstRetired,
    FullWindowStalls,
    RetStallOther,
    RetStallWaitForRecovery,
    RetStallWaitForRedirect,
    RetStallWaitForL1Miss,
    RetStallWaitForMemory,
    RetStallWaitForDcMiss,
    RsFills,
    SchedOps,
    // exec
    ExecOps,
    ExecOpsOffPath,
    FuBusyCycles,
    FuDelayRejects,
    // memory side
    DcacheHit,
    DcacheMiss,
    DcacheFill,
    DcachePortConflicts,
    MemBlockedCycles,
    MemReqsIfetch,
    MemReqsDfetch,
    MemReqRejects,
}

/// Why retirement was blocked this cycle (reported per cycle by the node
/// stage, consumed by the stats layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RobStallReason {
    /// Not blocked.
    #[default]
    None,
    /// Head op simply not done.
    Other,
    /// Head op has a pending recovery.
    WaitForRecovery,
    /// Head op has a pending redirect.
    WaitForRedirect,
    /// Head op waits on an L1 miss.
    WaitForL1Miss,
    /// Head op waits on blocked memory.
    WaitForMemory,
    /// Head op waits on a D-cache miss.
    WaitForDcMiss,
}

impl RobStallReason {
    /// The stat counter charged for this reason, if any.
    pub fn stat(self) -> Option<Stat> {
        match self {
            Self::None => None,
            Self::Other => Some(Stat::RetStallOther),
            Self::WaitForRecovery => Some(Stat::RetStallWaitForRecovery),
            Self::WaitForRedirect => Some(Stat::RetStallWaitForRedirect),
            Self::WaitForL1Miss => Some(Stat::RetStallWaitForL1Miss),
            Self::WaitForMemory => Some(Stat::RetStallWaitForMemory),
            Self::WaitForDcMiss => Some(Stat::RetStallWaitForDcMiss),
        }
    }
}

/// Why ROB issue was blocked this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RobBlockIssueReason {
    /// Not blocked.
    #[default]
    None,
    /// ROB is full.
    Full,
}

/// Statistics of one simulated core.
#[derive(Debug, Clone)]
pub struct CoreStats {
    proc_id: ProcId,
    frozen: bool,
    values: [u64; NUM_STATS],
    /// Retire-blocked reason recorded for the current cycle.
    pub rob_stall_reason: RobStallReason,
    /// Issue-blocked reason recorded for the current cycle.
    pub rob_block_issue_reason: RobBlockIssueReason,
}

impl CoreStats {
    /// Creates zeroed statistics for one core.
    pub fn new(proc_id: ProcId) -> Self {
        Self {
            proc_id,
            frozen: false,
            values: [0; NUM_STATS],
            rob_stall_reason: RobStallReason::None,
            rob_block_issue_reason: RobBlockIssueReason::None,
        }
    }

    /// Counts one event.
    #[inline]
    pub fn event(&mut self, stat: Stat) {
        self.add(stat, 1);
    }

    /// Counts `n` events.
    #[inline]
    pub fn add(&mut self, stat: Stat, n: u64) {
        if !self.frozen {
            self.values[stat as usize] += n;
        }
    }

    /// Reads a counter.
    #[inline]
    pub fn get(&self, stat: Stat) -> u64 {
        self.values[stat as usize]
    }

    /// Freezes the counters (bogus mode); events keep arriving but are
    /// dropped.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the counters are frozen.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Resets every counter (clear-stats trigger, warmup end). Freezing is
    /// unaffected.
    pub fn reset(&mut self) {
        self.values = [0; NUM_STATS];
    }

    /// Charges the current cycle's stall reasons.
    pub fn record_stall_reasons(&mut self) {
        if let Some(stat) = self.rob_stall_reason.stat() {
            self.event(stat);
        }
        if self.rob_block_issue_reason == RobBlockIssueReason::Full {
            self.event(Stat::FullWindowStalls);
        }
    }

    /// Prints the human-readable sectioned report for this core.
    pub fn print(&self, cycles: u64, insts: u64, uops: u64) {
        let cyc = cycles.max(1);
        let ipc = insts as f64 / cyc as f64;
        println!("==========================================================");
        println!("CORE {} STATISTICS", self.proc_id);
        println!("==========================================================");
        println!("sim_cycles               {cycles}");
        println!("sim_insts                {insts}");
        println!("sim_uops                 {uops}");
        println!("sim_ipc                  {ipc:.4}");
        println!("----------------------------------------------------------");
        println!("FETCH");
        println!("  ops.fetched            {}", self.get(Stat::OpsFetched));
        println!("  ops.fetched_off_path   {}", self.get(Stat::OpsFetchedOffPath));
        let ic_hits = self.get(Stat::IcacheHit);
        let ic_miss = self.get(Stat::IcacheMiss);
        let ic_total = (ic_hits + ic_miss).max(1);
        println!(
            "  icache.miss_rate       {:.2}% ({ic_miss}/{})",
            100.0 * ic_miss as f64 / ic_total as f64,
            ic_hits + ic_miss
        );
        println!("----------------------------------------------------------");
        println!("BRANCH PREDICTION");
        let cbr_ok = self.get(Stat::CbrOnPathCorrect);
        let cbr_bad = self.get(Stat::CbrOnPathMispred);
        let cbr_total = (cbr_ok + cbr_bad).max(1);
        println!(
            "  cbr.accuracy           {:.2}% ({cbr_ok}/{})",
            100.0 * cbr_ok as f64 / cbr_total as f64,
            cbr_ok + cbr_bad
        );
        println!("  bp.mispredicts         {}", self.get(Stat::BpMispred));
        println!("  bp.misfetches          {}", self.get(Stat::BpMisfetch));
        let btb_hit = self.get(Stat::BtbHit);
        let btb_miss = self.get(Stat::BtbMiss);
        println!(
            "  btb.miss_rate          {:.2}% ({btb_miss}/{})",
            100.0 * btb_miss as f64 / (btb_hit + btb_miss).max(1) as f64,
            btb_hit + btb_miss
        );
        println!("  recoveries             {}", self.get(Stat::Recoveries));
        println!("  recoveries.late_bp     {}", self.get(Stat::LateBpRecoveries));
        println!("  redirects              {}", self.get(Stat::Redirects));
        println!("----------------------------------------------------------");
        println!("BACKEND");
        println!("  ops.issued             {}", self.get(Stat::OpsIssued));
        println!("  ops.retired            {}", self.get(Stat::OpsRetired));
        println!("  stalls.full_window     {}", self.get(Stat::FullWindowStalls));
        println!(
            "  stalls.retire          other:{} recovery:{} redirect:{} l1:{} mem:{} dc:{}",
            self.get(Stat::RetStallOther),
            self.get(Stat::RetStallWaitForRecovery),
            self.get(Stat::RetStallWaitForRedirect),
            self.get(Stat::RetStallWaitForL1Miss),
            self.get(Stat::RetStallWaitForMemory),
            self.get(Stat::RetStallWaitForDcMiss),
        );
        let dc_hits = self.get(Stat::DcacheHit);
        let dc_miss = self.get(Stat::DcacheMiss);
        println!(
            "  dcache.miss_rate       {:.2}% ({dc_miss}/{})",
            100.0 * dc_miss as f64 / (dc_hits + dc_miss).max(1) as f64,
            dc_hits + dc_miss
        );
        println!("  mem.blocked_cycles     {}", self.get(Stat::MemBlockedCycles));
        println!("==========================================================");
    }

    /// Writes the flat `name value` dump for this core into `dir`.
    pub fn dump_flat(&self, dir: &Path, cycles: u64, insts: u64, uops: u64) -> SimResult<()> {
        let path = dir.join(format!("core{}.stat.out", self.proc_id));
        let mut out = std::fs::File::create(path)?;
        writeln!(out, "CYCLES {cycles}")?;
        writeln!(out, "INST_COUNT {insts}")?;
        writeln!(out, "UOP_COUNT {uops}")?;
        for (i, name) in STAT_NAMES.iter().enumerate() {
            writeln!(out, "{name} {}", self.values[i])?;
        }
        Ok(())
    }

    /// Writes the JSON dump for this core into `dir`.
    pub fn dump_json(&self, dir: &Path, cycles: u64, insts: u64, uops: u64) -> SimResult<()> {
        let path = dir.join(format!("core{}.stat.json", self.proc_id));
        let mut doc = serde_json::Map::new();
        doc.insert("CYCLES".into(), cycles.into());
        doc.insert("INST_COUNT".into(), insts.into());
        doc.insert("UOP_COUNT".into(), uops.into());
        for (i, name) in STAT_NAMES.iter().enumerate() {
            doc.insert((*name).into(), self.values[i].into());
        }
        let text = serde_json::to_string_pretty(&serde_json::Value::Object(doc))
            .map_err(|e| crate::common::FatalError::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_counting() {
        let mut s = CoreStats::new(0);
        s.event(Stat::IcacheHit);
        s.add(Stat::IcacheHit, 2);
        assert_eq!(s.get(Stat::IcacheHit), 3);
        assert_eq!(s.get(Stat::IcacheMiss), 0);
    }

    #[test]
    fn test_frozen_stats_drop_events() {
        let mut s = CoreStats::new(0);
        s.event(Stat::OpsRetired);
        s.freeze();
        s.event(Stat::OpsRetired);
        s.add(Stat::OpsRetired, 10);
        assert_eq!(s.get(Stat::OpsRetired), 1);
    }

    #[test]
    fn test_stall_reason_recording() {
        let mut s = CoreStats::new(0);
        s.rob_stall_reason = RobStallReason::WaitForL1Miss;
        s.rob_block_issue_reason = RobBlockIssueReason::Full;
        s.record_stall_reasons();
        assert_eq!(s.get(Stat::RetStallWaitForL1Miss), 1);
        assert_eq!(s.get(Stat::FullWindowStalls), 1);
    }

    #[test]
    fn test_dump_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = CoreStats::new(2);
        s.event(Stat::Recoveries);
        s.dump_flat(dir.path(), 100, 50, 60).unwrap();
        s.dump_json(dir.path(), 100, 50, 60).unwrap();
        let flat = std::fs::read_to_string(dir.path().join("core2.stat.out")).unwrap();
        assert!(flat.contains("Recoveries 1"));
        assert!(flat.contains("CYCLES 100"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("core2.stat.json")).unwrap())
                .unwrap();
        assert_eq!(json["Recoveries"], 1);
    }
}

//! Configuration system for the simulator.
//!
//! This module defines all parameter structures used to configure a run. It
//! provides:
//! 1. **Defaults:** baseline machine constants (pipeline widths, predictor
//!    geometry, cache geometry, watchdog limits).
//! 2. **Structures:** hierarchical parameters for general control, core
//!    topology, branch prediction, and the memory stand-in.
//! 3. **Resolution:** the layered `--key value` sources — process
//!    environment (`CMPSIM_<KEY>`), a `PARAMS.in` file in the working
//!    directory, then command-line arguments; later sources win.
//!
//! The structures also derive `serde::Deserialize` so a whole [`Params`] can
//! be ingested from JSON by the CLI.

use std::path::Path;

use serde::Deserialize;

use crate::common::{FatalError, SimResult};

/// Default parameter values.
mod defaults {
    /// Simulated core count.
    pub const NUM_CORES: usize = 1;

    /// Ops fetched/decoded/mapped per cycle.
    pub const ISSUE_WIDTH: usize = 4;

    /// Reorder buffer capacity per core.
    pub const NODE_TABLE_SIZE: usize = 256;

    /// Ops retired per cycle from the ROB head.
    pub const NODE_RET_WIDTH: usize = 4;

    /// Retired macro-instructions between front-end retire notifications.
    pub const NODE_RETIRE_RATE: u64 = 1;

    /// Depth of the decode shift register.
    pub const DECODE_CYCLES: usize = 2;

    /// Depth of the map (rename) shift register.
    pub const MAP_CYCLES: usize = 2;

    /// Reservation-station sizes, one per RS (`0` would mean unbounded,
    /// which the emptiest-RS issuer rejects).
    pub const RS_SIZES: &str = "16,16,16,16";

    /// FU-connection bitmask per RS (bit *i* connects FU *i*).
    pub const RS_CONNECTIONS: &str = "x1,x2,x4,x8";

    /// Op-type bitmask per FU (`0` = executes every op type).
    pub const FU_TYPES: &str = "0,0,0,0";

    /// Control-flow ops admitted into one fetch packet.
    pub const CFS_PER_CYCLE: u64 = 1;

    /// Branch-predictor global history length in bits.
    pub const GLOBAL_HIST_LENGTH: u32 = 32;

    /// Direction-predictor pattern table entries.
    pub const GSHARE_ENTRIES: usize = 16384;

    /// Branch target buffer entries / associativity.
    pub const BTB_ENTRIES: usize = 4096;
    /// BTB ways per set.
    pub const BTB_ASSOC: usize = 4;

    /// Indirect-target predictor table entries.
    pub const IBTB_ENTRIES: usize = 4096;

    /// Call-return stack entries.
    pub const CRS_ENTRIES: usize = 32;

    /// Confidence table index bits.
    pub const BPC_BITS: u32 = 12;
    /// Confidence saturating-counter bits.
    pub const BPC_CTR_BITS: u32 = 3;

    /// Cycles between late-predictor disagreement and recovery.
    pub const LATE_BP_LATENCY: u64 = 3;

    /// I-cache geometry (bytes / ways / line bytes).
    pub const ICACHE_SIZE: usize = 32768;
    /// I-cache ways per set.
    pub const ICACHE_ASSOC: usize = 4;
    /// I-cache line bytes.
    pub const ICACHE_LINE_SIZE: u64 = 64;

    /// D-cache geometry (bytes / ways / line bytes).
    pub const DCACHE_SIZE: usize = 32768;
    /// D-cache ways per set.
    pub const DCACHE_ASSOC: usize = 8;
    /// D-cache line bytes.
    pub const DCACHE_LINE_SIZE: u64 = 64;
    /// D-cache hit latency in cycles.
    pub const DCACHE_CYCLES: u64 = 3;
    /// Loads the D-cache accepts per cycle.
    pub const DCACHE_PORTS: usize = 2;

    /// Flat miss-to-fill latency of the memory stand-in.
    pub const MEM_LATENCY: u64 = 100;
    /// Outstanding-request buffer entries in the memory stand-in.
    pub const MEM_REQ_BUFFER_ENTRIES: usize = 32;

    /// Deadlock watchdog: max cycles without a retirement.
    pub const FORWARD_PROGRESS_LIMIT: u64 = 100_000;
    /// Deadlock watchdog: cycles between checks.
    pub const FORWARD_PROGRESS_INTERVAL: u64 = 1_000_000;

    /// Retired instructions of core 0 between heartbeat lines.
    pub const HEARTBEAT_INTERVAL: u64 = 1_000_000;
}

/// General run control.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralParams {
    /// Simulated core count (1..=32).
    pub num_cores: usize,
    /// Per-core retired-instruction cap: `"N"` (all cores) or `"N,N,…"`.
    /// Empty disables the cap.
    pub inst_limit: String,
    /// Global stop trigger: `none` | `i[k]:N` | `c[k]:N` | `t:N`.
    pub sim_limit: String,
    /// Trigger at which statistics are reset mid-run.
    pub clear_stats: String,
    /// Uop-mode warmup instruction count before full simulation.
    pub warmup: u64,
    /// Retired instructions of core 0 between heartbeat lines (0 disables).
    pub heartbeat_interval: u64,
    /// Max cycles a core may go without retiring before the watchdog fires.
    pub forward_progress_limit: u64,
    /// Cycles between watchdog checks.
    pub forward_progress_interval: u64,
    /// Directory for stats dumps and trace files.
    pub output_dir: String,
    /// Emit a per-op timing trace to `pipeview.out`.
    pub pipeview: bool,
}

impl Default for GeneralParams {
    fn default() -> Self {
        Self {
            num_cores: defaults::NUM_CORES,
            inst_limit: String::new(),
            sim_limit: "none".into(),
            clear_stats: "none".into(),
            warmup: 0,
            heartbeat_interval: defaults::HEARTBEAT_INTERVAL,
            forward_progress_limit: defaults::FORWARD_PROGRESS_LIMIT,
            forward_progress_interval: defaults::FORWARD_PROGRESS_INTERVAL,
            output_dir: ".".into(),
            pipeview: false,
        }
    }
}

/// Pipeline widths and execution topology.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreParams {
    /// Ops per fetch packet / decode row / map row.
    pub issue_width: usize,
    /// Reorder buffer capacity.
    pub node_table_size: usize,
    /// Retirement width per cycle.
    pub node_ret_width: usize,
    /// Retired macro-instructions between front-end retire notifications.
    pub node_retire_rate: u64,
    /// Decode pipeline depth.
    pub decode_cycles: usize,
    /// Map (rename) pipeline depth.
    pub map_cycles: usize,
    /// Comma-separated RS sizes; the list length sets the RS count.
    pub rs_sizes: String,
    /// Comma-separated FU-connection masks, one per RS (`x`/`b` prefixes
    /// for hex/binary).
    pub rs_connections: String,
    /// Comma-separated op-type masks, one per FU (`0` = all types).
    pub fu_types: String,
    /// Max RS fills per cycle (0 = unbounded).
    pub rs_fill_width: usize,
    /// Control-flow ops per fetch packet.
    pub cfs_per_cycle: u64,
    /// Master switch for the packet-breaking conditions.
    pub enable_icache_packet_breaking: bool,
    /// Break the packet when the per-FU-type budget is exhausted.
    pub packet_break_on_fus: bool,
    /// Limit loads+stores per fetch packet (0 disables).
    pub num_load_store_per_packet: u64,
    /// Allow one packet to span an I-cache line boundary.
    pub fetch_across_cache_lines: bool,
    /// Keep fetching down the wrong path after a detected mispredict.
    pub fetch_off_path_ops: bool,
    /// End the packet after a predicted-taken branch.
    pub fetch_break_on_taken: bool,
    /// Fetch bubble after a taken-branch packet break.
    pub fetch_taken_bubble_cycles: u64,
    /// Uniform FU latency override (0 = per-op-type table).
    pub uniform_op_delay: u64,
}

impl Default for CoreParams {
    fn default() -> Self {
        Self {
            issue_width: defaults::ISSUE_WIDTH,
            node_table_size: defaults::NODE_TABLE_SIZE,
            node_ret_width: defaults::NODE_RET_WIDTH,
            node_retire_rate: defaults::NODE_RETIRE_RATE,
            decode_cycles: defaults::DECODE_CYCLES,
            map_cycles: defaults::MAP_CYCLES,
            rs_sizes: defaults::RS_SIZES.into(),
            rs_connections: defaults::RS_CONNECTIONS.into(),
            fu_types: defaults::FU_TYPES.into(),
            rs_fill_width: 0,
            cfs_per_cycle: defaults::CFS_PER_CYCLE,
            enable_icache_packet_breaking: true,
            packet_break_on_fus: false,
            num_load_store_per_packet: 0,
            fetch_across_cache_lines: false,
            fetch_off_path_ops: true,
            fetch_break_on_taken: false,
            fetch_taken_bubble_cycles: 0,
            uniform_op_delay: 0,
        }
    }
}

/// Branch prediction subsystem parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BpParams {
    /// Main direction predictor, by registry name.
    pub bp_mech: String,
    /// Late (multi-cycle) direction predictor; `none` disables late BP.
    pub late_bp_mech: String,
    /// BTB implementation, by registry name.
    pub btb_mech: String,
    /// Indirect-target predictor, by registry name.
    pub ibtb_mech: String,
    /// Confidence estimator, by registry name.
    pub conf_mech: String,
    /// Direction-predictor pattern table entries.
    pub gshare_entries: usize,
    /// Global history register length (bits, at most 32).
    pub global_hist_length: u32,
    /// BTB entries.
    pub btb_entries: usize,
    /// BTB ways per set.
    pub btb_assoc: usize,
    /// Indirect-target table entries.
    pub ibtb_entries: usize,
    /// Enable the call-return stack.
    pub enable_crs: bool,
    /// Realistic (pollutable circular) CRS vs ideal save/restore CRS.
    pub crs_realistic: bool,
    /// Call-return stack entries.
    pub crs_entries: usize,
    /// Enable the indirect-target predictor.
    pub enable_ibp: bool,
    /// Enable the confidence estimator.
    pub enable_bp_conf: bool,
    /// Confidence table index bits.
    pub bpc_bits: u32,
    /// Confidence saturating-counter bits.
    pub bpc_ctr_bits: u32,
    /// Extra cycles added to the mispredict recovery latency.
    pub extra_recovery_cycles: u64,
    /// Extra cycles added to the BTB-miss redirect latency.
    pub extra_redirect_cycles: u64,
    /// Extra redirect cycles for system-call ops.
    pub extra_callsys_cycles: u64,
    /// Cycles between a late-predictor disagreement and its recovery.
    pub late_bp_latency: u64,
    /// Train predictors on wrong-path resolutions.
    pub update_bp_off_path: bool,
    /// Allow wrong-path writes into the indirect-target predictor.
    pub ibtb_off_path_writes: bool,
    /// Move resolve/target-known predictor updates to retirement.
    pub bp_update_at_retire: bool,
    /// Oracle direction predictor (no mispredicts on conditionals).
    pub perfect_bp: bool,
    /// Oracle BTB for conditional branches.
    pub perfect_cbr_btb: bool,
    /// Oracle BTB for predicted-not-taken conditionals.
    pub perfect_nt_btb: bool,
}

impl Default for BpParams {
    fn default() -> Self {
        Self {
            bp_mech: "gshare".into(),
            late_bp_mech: "none".into(),
            btb_mech: "generic".into(),
            ibtb_mech: "tc_tagless".into(),
            conf_mech: "counter".into(),
            gshare_entries: defaults::GSHARE_ENTRIES,
            global_hist_length: defaults::GLOBAL_HIST_LENGTH,
            btb_entries: defaults::BTB_ENTRIES,
            btb_assoc: defaults::BTB_ASSOC,
            ibtb_entries: defaults::IBTB_ENTRIES,
            enable_crs: true,
            crs_realistic: true,
            crs_entries: defaults::CRS_ENTRIES,
            enable_ibp: true,
            enable_bp_conf: false,
            bpc_bits: defaults::BPC_BITS,
            bpc_ctr_bits: defaults::BPC_CTR_BITS,
            extra_recovery_cycles: 0,
            extra_redirect_cycles: 0,
            extra_callsys_cycles: 0,
            late_bp_latency: defaults::LATE_BP_LATENCY,
            update_bp_off_path: false,
            ibtb_off_path_writes: true,
            bp_update_at_retire: false,
            perfect_bp: false,
            perfect_cbr_btb: false,
            perfect_nt_btb: false,
        }
    }
}

/// Cache geometry and the fixed-latency memory stand-in.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryParams {
    /// I-cache bytes.
    pub icache_size: usize,
    /// I-cache ways per set.
    pub icache_assoc: usize,
    /// I-cache line bytes.
    pub icache_line_size: u64,
    /// All I-cache accesses hit.
    pub perfect_icache: bool,
    /// On an I-cache miss, also prefetch the opposite-parity neighbour line.
    pub one_more_cache_line_enable: bool,
    /// D-cache bytes.
    pub dcache_size: usize,
    /// D-cache ways per set.
    pub dcache_assoc: usize,
    /// D-cache line bytes.
    pub dcache_line_size: u64,
    /// D-cache hit latency in cycles.
    pub dcache_cycles: u64,
    /// Loads accepted by the D-cache per cycle.
    pub dcache_ports: usize,
    /// Flat miss-to-fill latency.
    pub mem_latency: u64,
    /// Outstanding-request buffer entries.
    pub mem_req_buffer_entries: usize,
}

impl Default for MemoryParams {
    fn default() -> Self {
        Self {
            icache_size: defaults::ICACHE_SIZE,
            icache_assoc: defaults::ICACHE_ASSOC,
            icache_line_size: defaults::ICACHE_LINE_SIZE,
            perfect_icache: false,
            one_more_cache_line_enable: false,
            dcache_size: defaults::DCACHE_SIZE,
            dcache_assoc: defaults::DCACHE_ASSOC,
            dcache_line_size: defaults::DCACHE_LINE_SIZE,
            dcache_cycles: defaults::DCACHE_CYCLES,
            dcache_ports: defaults::DCACHE_PORTS,
            mem_latency: defaults::MEM_LATENCY,
            mem_req_buffer_entries: defaults::MEM_REQ_BUFFER_ENTRIES,
        }
    }
}

/// Root parameter set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Params {
    /// General run control.
    pub general: GeneralParams,
    /// Pipeline widths and execution topology.
    pub core: CoreParams,
    /// Branch prediction parameters.
    pub bp: BpParams,
    /// Cache and memory parameters.
    pub memory: MemoryParams,
}

fn parse_bool(key: &str, value: &str) -> SimResult<bool> {
    match value {
        "1" | "true" | "TRUE" => Ok(true),
        "0" | "false" | "FALSE" => Ok(false),
        _ => Err(FatalError::Config(format!("--{key}: expected flag, got '{value}'"))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> SimResult<T> {
    value
        .parse()
        .map_err(|_| FatalError::Config(format!("--{key}: expected number, got '{value}'")))
}

/// Parses one element of a comma-separated mask/size list. An `x` prefix is
/// hexadecimal, a `b` prefix binary, anything else decimal.
pub fn parse_list_elt(key: &str, elt: &str) -> SimResult<u64> {
    let bad = || FatalError::Config(format!("--{key}: bad list element '{elt}'"));
    if let Some(hex) = elt.strip_prefix('x') {
        u64::from_str_radix(hex, 16).map_err(|_| bad())
    } else if let Some(bin) = elt.strip_prefix('b') {
        u64::from_str_radix(bin, 2).map_err(|_| bad())
    } else {
        elt.parse().map_err(|_| bad())
    }
}

/// Parses a whole comma-separated mask/size list.
pub fn parse_list(key: &str, list: &str) -> SimResult<Vec<u64>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_list_elt(key, s.trim()))
        .collect()
}

impl Params {
    /// Applies a single `--key value` pair.
    pub fn apply_kv(&mut self, key: &str, value: &str) -> SimResult<()> {
        let g = &mut self.general;
        let c = &mut self.core;
        let b = &mut self.bp;
        let m = &mut self.memory;
        match key {
            "num_cores" => g.num_cores = parse_num(key, value)?,
            "inst_limit" => g.inst_limit = value.into(),
            "sim_limit" => g.sim_limit = value.into(),
            "clear_stats" => g.clear_stats = value.into(),
            "warmup" => g.warmup = parse_num(key, value)?,
            "heartbeat_interval" => g.heartbeat_interval = parse_num(key, value)?,
            "forward_progress_limit" => g.forward_progress_limit = parse_num(key, value)?,
            "forward_progress_interval" => g.forward_progress_interval = parse_num(key, value)?,
            "output_dir" => g.output_dir = value.into(),
            "pipeview" => g.pipeview = parse_bool(key, value)?,

            "issue_width" => c.issue_width = parse_num(key, value)?,
            "node_table_size" => c.node_table_size = parse_num(key, value)?,
            "node_ret_width" => c.node_ret_width = parse_num(key, value)?,
            "node_retire_rate" => c.node_retire_rate = parse_num(key, value)?,
            "decode_cycles" => c.decode_cycles = parse_num(key, value)?,
            "map_cycles" => c.map_cycles = parse_num(key, value)?,
            "rs_sizes" => c.rs_sizes = value.into(),
            "rs_connections" => c.rs_connections = value.into(),
            "fu_types" => c.fu_types = value.into(),
            "rs_fill_width" => c.rs_fill_width = parse_num(key, value)?,
            "cfs_per_cycle" => c.cfs_per_cycle = parse_num(key, value)?,
            "enable_icache_packet_breaking" => {
                c.enable_icache_packet_breaking = parse_bool(key, value)?;
            }
            "packet_break_on_fus" => c.packet_break_on_fus = parse_bool(key, value)?,
            "num_load_store_per_packet" => c.num_load_store_per_packet = parse_num(key, value)?,
            "fetch_across_cache_lines" => c.fetch_across_cache_lines = parse_bool(key, value)?,
            "fetch_off_path_ops" => c.fetch_off_path_ops = parse_bool(key, value)?,
            "fetch_break_on_taken" => c.fetch_break_on_taken = parse_bool(key, value)?,
            "fetch_taken_bubble_cycles" => c.fetch_taken_bubble_cycles = parse_num(key, value)?,
            "uniform_op_delay" => c.uniform_op_delay = parse_num(key, value)?,

            "bp_mech" => b.bp_mech = value.into(),
            "late_bp_mech" => b.late_bp_mech = value.into(),
            "btb_mech" => b.btb_mech = value.into(),
            "ibtb_mech" => b.ibtb_mech = value.into(),
            "conf_mech" => b.conf_mech = value.into(),
            "gshare_entries" => b.gshare_entries = parse_num(key, value)?,
            "global_hist_length" => b.global_hist_length = parse_num(key, value)?,
            "btb_entries" => b.btb_entries = parse_num(key, value)?,
            "btb_assoc" => b.btb_assoc = parse_num(key, value)?,
            "ibtb_entries" => b.ibtb_entries = parse_num(key, value)?,
            "enable_crs" => b.enable_crs = parse_bool(key, value)?,
            "crs_realistic" => b.crs_realistic = parse_bool(key, value)?,
            "crs_entries" => b.crs_entries = parse_num(key, value)?,
            "enable_ibp" => b.enable_ibp = parse_bool(key, value)?,
            "enable_bp_conf" => b.enable_bp_conf = parse_bool(key, value)?,
            "bpc_bits" => b.bpc_bits = parse_num(key, value)?,
            "bpc_ctr_bits" => b.bpc_ctr_bits = parse_num(key, value)?,
            "extra_recovery_cycles" => b.extra_recovery_cycles = parse_num(key, value)?,
            "extra_redirect_cycles" => b.extra_redirect_cycles = parse_num(key, value)?,
            "extra_callsys_cycles" => b.extra_callsys_cycles = parse_num(key, value)?,
            "late_bp_latency" => b.late_bp_latency = parse_num(key, value)?,
            "update_bp_off_path" => b.update_bp_off_path = parse_bool(key, value)?,
            "ibtb_off_path_writes" => b.ibtb_off_path_writes = parse_bool(key, value)?,
            "bp_update_at_retire" => b.bp_update_at_retire = parse_bool(key, value)?,
            "perfect_bp" => b.perfect_bp = parse_bool(key, value)?,
            "perfect_cbr_btb" => b.perfect_cbr_btb = parse_bool(key, value)?,
            "perfect_nt_btb" => b.perfect_nt_btb = parse_bool(key, value)?,

            "icache_size" => m.icache_size = parse_num(key, value)?,
            "icache_assoc" => m.icache_assoc = parse_num(key, value)?,
            "icache_line_size" => m.icache_line_size = parse_num(key, value)?,
            "perfect_icache" => m.perfect_icache = parse_bool(key, value)?,
            "one_more_cache_line_enable" => {
                m.one_more_cache_line_enable = parse_bool(key, value)?;
            }
            "dcache_size" => m.dcache_size = parse_num(key, value)?,
            "dcache_assoc" => m.dcache_assoc = parse_num(key, value)?,
            "dcache_line_size" => m.dcache_line_size = parse_num(key, value)?,
            "dcache_cycles" => m.dcache_cycles = parse_num(key, value)?,
            "dcache_ports" => m.dcache_ports = parse_num(key, value)?,
            "mem_latency" => m.mem_latency = parse_num(key, value)?,
            "mem_req_buffer_entries" => m.mem_req_buffer_entries = parse_num(key, value)?,

            _ => {
                return Err(FatalError::Config(format!("unknown parameter '--{key}'")));
            }
        }
        Ok(())
    }

    /// Applies `--key value` argument pairs in order.
    pub fn apply_args(&mut self, args: &[String]) -> SimResult<()> {
        let mut it = args.iter();
        while let Some(arg) = it.next() {
            let key = arg.strip_prefix("--").ok_or_else(|| {
                FatalError::Config(format!("expected --key, got '{arg}'"))
            })?;
            let value = it.next().ok_or_else(|| {
                FatalError::Config(format!("--{key}: missing value"))
            })?;
            self.apply_kv(key, value)?;
        }
        Ok(())
    }

    /// Applies a parameter file: one `--key value` pair per line, `#`
    /// comments, blank lines ignored.
    pub fn apply_params_file(&mut self, path: &Path) -> SimResult<()> {
        let text = std::fs::read_to_string(path)?;
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(keyarg), Some(value)) = (parts.next(), parts.next()) else {
                return Err(FatalError::Config(format!(
                    "{}:{}: malformed parameter line",
                    path.display(),
                    lineno + 1
                )));
            };
            let key = keyarg.strip_prefix("--").ok_or_else(|| {
                FatalError::Config(format!(
                    "{}:{}: expected --key, got '{keyarg}'",
                    path.display(),
                    lineno + 1
                ))
            })?;
            self.apply_kv(key, value)?;
        }
        Ok(())
    }

    /// Resolves parameters from all layered sources: defaults, then
    /// environment pairs, then an optional `PARAMS.in`, then argv pairs.
    pub fn resolve(
        env: impl Iterator<Item = (String, String)>,
        params_file: Option<&Path>,
        args: &[String],
    ) -> SimResult<Self> {
        let mut params = Self::default();
        for (name, value) in env {
            if let Some(key) = name.strip_prefix("CMPSIM_") {
                params.apply_kv(&key.to_lowercase(), &value)?;
            }
        }
        if let Some(path) = params_file
            && path.exists()
        {
            params.apply_params_file(path)?;
        }
        params.apply_args(args)?;
        params.validate()?;
        Ok(params)
    }

    /// Cross-field validation. Called by [`Params::resolve`]; call directly
    /// after programmatic construction.
    pub fn validate(&self) -> SimResult<()> {
        let err = |msg: String| Err(FatalError::Config(msg));
        if self.general.num_cores == 0 || self.general.num_cores > 32 {
            return err(format!(
                "num_cores must be 1..=32, got {}",
                self.general.num_cores
            ));
        }
        if self.core.issue_width == 0 {
            return err("issue_width must be nonzero".into());
        }
        if self.core.decode_cycles == 0 || self.core.map_cycles == 0 {
            return err("decode_cycles and map_cycles must be nonzero".into());
        }
        if self.core.node_table_size == 0 || self.core.node_ret_width == 0 {
            return err("node_table_size and node_ret_width must be nonzero".into());
        }
        if self.core.node_retire_rate == 0 {
            return err("node_retire_rate must be nonzero".into());
        }
        if self.bp.global_hist_length == 0 || self.bp.global_hist_length > 32 {
            return err("global_hist_length must be 1..=32".into());
        }
        let sizes = parse_list("rs_sizes", &self.core.rs_sizes)?;
        let conns = parse_list("rs_connections", &self.core.rs_connections)?;
        let fus = parse_list("fu_types", &self.core.fu_types)?;
        if sizes.is_empty() || fus.is_empty() {
            return err("rs_sizes and fu_types must be non-empty lists".into());
        }
        if sizes.len() != conns.len() {
            return err(format!(
                "rs_sizes has {} entries but rs_connections has {}",
                sizes.len(),
                conns.len()
            ));
        }
        for (i, &mask) in conns.iter().enumerate() {
            if mask == 0 || (mask >> fus.len()) != 0 {
                return err(format!(
                    "rs_connections[{i}] = {mask:#x} does not select a valid FU subset"
                ));
            }
        }
        if !self.general.inst_limit.is_empty() {
            let limits = parse_list("inst_limit", &self.general.inst_limit)?;
            if limits.len() != 1 && limits.len() != self.general.num_cores {
                return err(format!(
                    "inst_limit needs 1 or {} entries, got {}",
                    self.general.num_cores,
                    limits.len()
                ));
            }
        }
        Ok(())
    }

    /// Per-core retired-instruction caps; `None` when no cap is configured.
    /// A single value is replicated across all cores.
    pub fn inst_limits(&self) -> SimResult<Option<Vec<u64>>> {
        if self.general.inst_limit.is_empty() {
            return Ok(None);
        }
        let mut limits = parse_list("inst_limit", &self.general.inst_limit)?;
        if limits.len() == 1 {
            limits = vec![limits[0]; self.general.num_cores];
        }
        Ok(Some(limits))
    }

    /// Whether a late direction predictor is configured.
    #[inline]
    pub fn use_late_bp(&self) -> bool {
        self.bp.late_bp_mech != "none"
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Params::default().validate().is_ok());
    }

    #[test]
    fn test_apply_args_overrides() {
        let mut p = Params::default();
        let args: Vec<String> = ["--issue_width", "8", "--bp_mech", "static"]
            .iter()
            .map(ToString::to_string)
            .collect();
        p.apply_args(&args).ok();
        assert_eq!(p.core.issue_width, 8);
        assert_eq!(p.bp.bp_mech, "static");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut p = Params::default();
        assert!(p.apply_kv("no_such_knob", "1").is_err());
    }

    #[test]
    fn test_params_file_with_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap_or_else(|e| panic!("{e}"));
        writeln!(file, "# machine shape").ok();
        writeln!(file, "--node_table_size 128  # ROB").ok();
        writeln!(file).ok();
        writeln!(file, "--num_cores 2").ok();
        let mut p = Params::default();
        assert!(p.apply_params_file(file.path()).is_ok());
        assert_eq!(p.core.node_table_size, 128);
        assert_eq!(p.general.num_cores, 2);
    }

    #[test]
    fn test_resolution_order_later_sources_win() {
        let mut file = tempfile::NamedTempFile::new().unwrap_or_else(|e| panic!("{e}"));
        writeln!(file, "--issue_width 2").ok();
        let env = vec![("CMPSIM_ISSUE_WIDTH".to_string(), "1".to_string())];
        let args: Vec<String> = ["--issue_width", "6"].iter().map(ToString::to_string).collect();
        let p = Params::resolve(env.into_iter(), Some(file.path()), &args)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(p.core.issue_width, 6);
    }

    #[test]
    fn test_list_parsing_radixes() {
        assert_eq!(
            parse_list("k", "x1f,b101,9").unwrap_or_else(|e| panic!("{e}")),
            vec![0x1f, 5, 9]
        );
    }

    #[test]
    fn test_validate_rejects_mismatched_rs_lists() {
        let mut p = Params::default();
        p.core.rs_sizes = "16,16".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_core_count() {
        let mut p = Params::default();
        p.general.num_cores = 33;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_inst_limit_replication() {
        let mut p = Params::default();
        p.general.num_cores = 3;
        p.general.inst_limit = "5000".into();
        let limits = p.inst_limits().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(limits, Some(vec![5000, 5000, 5000]));
    }

    #[test]
    fn test_json_ingestion() {
        let p: Params = serde_json::from_str(
            r#"{"general": {"num_cores": 4}, "bp": {"late_bp_mech": "gshare"}}"#,
        )
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(p.general.num_cores, 4);
        assert!(p.use_late_bp());
        assert_eq!(p.core.issue_width, defaults::ISSUE_WIDTH);
    }
}

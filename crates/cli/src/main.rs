//! Trace-driven CMP simulator CLI.
//!
//! Runs one or more recorded uop traces through the cycle-accurate core
//! model. Parameters resolve in layers: an optional JSON config file, then
//! the process environment (`CMPSIM_<KEY>`), then `PARAMS.in` in the
//! working directory, then trailing `--key value` arguments — later
//! sources win.
//!
//! Exit codes: 0 on clean termination, 15 on a fatal invariant violation,
//! 1 on configuration or input errors.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cmpsim_core::common::{FATAL_EXIT_CODE, FatalError};
use cmpsim_core::frontend::TraceFrontend;
use cmpsim_core::frontend::trace::TraceRecord;
use cmpsim_core::{FixedLatencyMemory, Params, SimLoop};

#[derive(Parser, Debug)]
#[command(
    name = "cmpsim",
    author,
    version,
    about = "Cycle-accurate trace-driven out-of-order CMP simulator",
    long_about = "Run recorded uop traces through the cycle-accurate core model.\n\n\
        Examples:\n  cmpsim --trace traces/qsort.json\n  \
        cmpsim --trace t.json --num_cores 2 --node_table_size 128\n  \
        cmpsim --config machine.json --trace t.json --sim_limit i:1m"
)]
struct Cli {
    /// JSON trace file: an array with one recorded uop stream per core.
    #[arg(short, long)]
    trace: String,

    /// JSON parameter file applied below env/PARAMS.in/argv overrides.
    #[arg(long)]
    config: Option<String>,

    /// Parameter overrides as `--key value` pairs (highest precedence).
    #[arg(allow_hyphen_values = true, trailing_var_arg = true)]
    params: Vec<String>,
}

fn resolve_params(cli: &Cli) -> Result<Params, FatalError> {
    let mut params = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text)
                .map_err(|e| FatalError::Config(format!("{path}: {e}")))?
        }
        None => Params::default(),
    };
    for (name, value) in std::env::vars() {
        if let Some(key) = name.strip_prefix("CMPSIM_") {
            params.apply_kv(&key.to_lowercase(), &value)?;
        }
    }
    let params_file = Path::new("PARAMS.in");
    if params_file.exists() {
        params.apply_params_file(params_file)?;
    }
    params.apply_args(&cli.params)?;
    params.validate()?;
    Ok(params)
}

fn load_trace(path: &str, num_cores: usize) -> Result<Vec<Vec<TraceRecord>>, FatalError> {
    let text = std::fs::read_to_string(path)?;
    let programs: Vec<Vec<TraceRecord>> =
        serde_json::from_str(&text).map_err(|e| FatalError::Config(format!("{path}: {e}")))?;
    if programs.len() != num_cores {
        return Err(FatalError::Config(format!(
            "{path}: trace has {} programs but num_cores is {num_cores}",
            programs.len()
        )));
    }
    if programs.iter().any(Vec::is_empty) {
        return Err(FatalError::Config(format!("{path}: empty per-core program")));
    }
    Ok(programs)
}

fn run(cli: &Cli) -> Result<(), FatalError> {
    let params = resolve_params(cli)?;
    let programs = load_trace(&cli.trace, params.general.num_cores)?;

    println!(
        "cmpsim: {} core(s), ROB {}, width {}, bp {}{}",
        params.general.num_cores,
        params.core.node_table_size,
        params.core.issue_width,
        params.bp.bp_mech,
        if params.use_late_bp() {
            format!(" (+late {})", params.bp.late_bp_mech)
        } else {
            String::new()
        }
    );

    let frontend = Box::new(TraceFrontend::new(programs));
    let memory = Box::new(FixedLatencyMemory::new(
        params.memory.mem_latency,
        params.memory.mem_req_buffer_entries,
    ));

    let mut sim = SimLoop::new(params, frontend, memory)?;
    let summary = sim.run()?;

    println!();
    println!(
        "done: {} cycles, {} insts, {} uops ({:.1} ps simulated)",
        summary.cycles,
        summary.inst_counts.iter().sum::<u64>(),
        summary.uop_counts.iter().sum::<u64>(),
        summary.sim_time_fs as f64 / 1000.0,
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ (FatalError::Invariant { .. } | FatalError::ForwardProgress { .. })) => {
            eprintln!("FATAL: {err}");
            ExitCode::from(FATAL_EXIT_CODE as u8)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

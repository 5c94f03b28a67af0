//! Pipeview: per-op timing trace.
//!
//! When enabled, every op leaving the machine (retired or flushed) writes
//! one line with its cycle stamps to `pipeview.out`. The file must be
//! opened before the first cycle and finalised exactly once at sim end —
//! a missed finalise truncates the file, so the writer flushes itself on
//! drop and warns if nobody finalised it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::warn;

use crate::common::{MAX_CTR, SimResult};
use crate::uop::Op;

/// Timing-trace writer shared by all cores.
#[derive(Debug)]
pub struct Pipeview {
    writer: BufWriter<File>,
    finalized: bool,
}

fn stamp(c: u64) -> i64 {
    if c == MAX_CTR { -1 } else { c as i64 }
}

impl Pipeview {
    /// Opens `pipeview.out` in `dir` and writes the header.
    pub fn open(dir: &Path) -> SimResult<Self> {
        let file = File::create(dir.join("pipeview.out"))?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "# proc op_num unique addr off_path fetch map issue sched exec done retire"
        )?;
        Ok(Self {
            writer,
            finalized: false,
        })
    }

    /// Records one op leaving the machine.
    pub fn record(&mut self, op: &Op) {
        let _ = writeln!(
            self.writer,
            "{} {} {} {:#x} {} {} {} {} {} {} {} {}",
            op.proc_id,
            op.op_num,
            op.unique_num,
            op.inst.addr,
            op.off_path as u8,
            stamp(op.fetch_cycle),
            stamp(op.map_cycle),
            stamp(op.issue_cycle),
            stamp(op.sched_cycle),
            stamp(op.exec_cycle),
            stamp(op.done_cycle),
            stamp(op.retire_cycle),
        );
    }

    /// Flushes and closes the trace. Must be called exactly once.
    pub fn finalize(&mut self) -> SimResult<()> {
        self.writer.flush()?;
        self.finalized = true;
        Ok(())
    }
}

impl Drop for Pipeview {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(target: "pipeview", "trace dropped without finalize; flushing");
            let _ = self.writer.flush();
        }
    }
}

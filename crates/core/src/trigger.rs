//! Run-control triggers.
//!
//! A trigger names a point in the simulation — an instruction count, a
//! cycle count or a simulated time — and fires exactly once when the point
//! is crossed. The `sim_limit` trigger ends the run; the `clear_stats`
//! trigger resets the counters mid-run.
//!
//! Syntax: `none`, `i:N` (instructions, core 0), `i<k>:N` (instructions,
//! core *k*), `c:N` / `c<k>:N` (cycles), `t:N` (femtoseconds). `N` accepts
//! `k`/`m`/`b` decimal suffixes.

use crate::common::{Counter, FatalError, ProcId, SimResult};

/// What a trigger watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSpec {
    /// Never fires.
    None,
    /// Retired instructions of one core reach a count.
    Inst {
        /// Watched core.
        core: ProcId,
        /// Firing threshold.
        count: Counter,
    },
    /// Global cycles reach a count.
    Cycle {
        /// Firing threshold.
        count: Counter,
    },
    /// Simulated time reaches a femtosecond value.
    Time {
        /// Firing threshold in femtoseconds.
        fs: u64,
    },
}

/// A fire-once run-control trigger.
#[derive(Debug)]
pub struct Trigger {
    name: &'static str,
    spec: TriggerSpec,
    fired: bool,
}

fn parse_count(name: &str, text: &str) -> SimResult<Counter> {
    let (digits, mult) = match text.as_bytes().last() {
        Some(b'k') => (&text[..text.len() - 1], 1_000),
        Some(b'm') => (&text[..text.len() - 1], 1_000_000),
        Some(b'b') => (&text[..text.len() - 1], 1_000_000_000),
        _ => (text, 1),
    };
    let base: Counter = digits
        .parse()
        .map_err(|_| FatalError::Config(format!("{name}: bad count '{text}'")))?;
    Ok(base * mult)
}

impl Trigger {
    /// Parses a trigger specification.
    pub fn parse(name: &'static str, text: &str) -> SimResult<Self> {
        let spec = Self::parse_spec(name, text)?;
        Ok(Self {
            name,
            spec,
            fired: false,
        })
    }

    fn parse_spec(name: &str, text: &str) -> SimResult<TriggerSpec> {
        if text == "none" || text.is_empty() {
            return Ok(TriggerSpec::None);
        }
        let (head, count) = text.split_once(':').ok_or_else(|| {
            FatalError::Config(format!("{name}: expected '<kind>:<count>', got '{text}'"))
        })?;
        if head.is_empty() {
            return Err(FatalError::Config(format!(
                "{name}: missing trigger kind in '{text}'"
            )));
        }
        let count = parse_count(name, count)?;
        let parse_core = |core: &str| -> SimResult<ProcId> {
            if core.is_empty() {
                Ok(0)
            } else {
                core.parse()
                    .map_err(|_| FatalError::Config(format!("{name}: bad core index '{core}'")))
            }
        };
        match head.split_at(1) {
            ("i", core) => Ok(TriggerSpec::Inst {
                core: parse_core(core)?,
                count,
            }),
            // cycles share one clock domain; a core suffix is accepted
            // and validated but selects the same counter
            ("c", core) => {
                let _ = parse_core(core)?;
                Ok(TriggerSpec::Cycle { count })
            }
            ("t", "") => Ok(TriggerSpec::Time { fs: count }),
            _ => Err(FatalError::Config(format!(
                "{name}: unsupported trigger '{text}' (expected none|i[k]:N|c[k]:N|t:N)"
            ))),
        }
    }

    /// Whether the trigger has fired.
    #[inline]
    pub fn fired(&self) -> bool {
        self.fired
    }

    /// Checks the trigger against the current counters. Returns true on
    /// the single call where it fires.
    pub fn check(&mut self, cycle: Counter, inst_counts: &[Counter], time_fs: u64) -> bool {
        if self.fired {
            return false;
        }
        let hit = match self.spec {
            TriggerSpec::None => false,
            TriggerSpec::Inst { core, count } => {
                inst_counts.get(core).is_some_and(|&insts| insts >= count)
            }
            TriggerSpec::Cycle { count } => cycle >= count,
            TriggerSpec::Time { fs } => time_fs >= fs,
        };
        if hit {
            tracing::info!(target: "sim", trigger = self.name, "trigger fired");
            self.fired = true;
        }
        hit
    }

    /// Fraction of the way to the firing point, for progress reporting.
    pub fn progress(&self, cycle: Counter, inst_counts: &[Counter], time_fs: u64) -> f64 {
        let frac = match self.spec {
            TriggerSpec::None => 0.0,
            TriggerSpec::Inst { core, count } => {
                inst_counts.get(core).copied().unwrap_or(0) as f64 / count.max(1) as f64
            }
            TriggerSpec::Cycle { count } => cycle as f64 / count.max(1) as f64,
            TriggerSpec::Time { fs } => time_fs as f64 / fs.max(1) as f64,
        };
        frac.min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_fires() {
        let mut t = Trigger::parse("SIM_LIMIT", "none").unwrap();
        assert!(!t.check(u64::MAX, &[u64::MAX], u64::MAX));
    }

    #[test]
    fn test_inst_trigger_with_core_index() {
        let mut t = Trigger::parse("SIM_LIMIT", "i1:100").unwrap();
        assert!(!t.check(0, &[500, 99], 0));
        assert!(t.check(0, &[500, 100], 0));
        // fires only once
        assert!(!t.check(0, &[500, 200], 0));
        assert!(t.fired());
    }

    #[test]
    fn test_cycle_trigger_with_suffix() {
        let mut t = Trigger::parse("SIM_LIMIT", "c:2k").unwrap();
        assert!(!t.check(1999, &[], 0));
        assert!(t.check(2000, &[], 0));
    }

    #[test]
    fn test_time_trigger() {
        let mut t = Trigger::parse("SIM_LIMIT", "t:500").unwrap();
        assert!(!t.check(0, &[], 499));
        assert!(t.check(0, &[], 500));
    }

    #[test]
    fn test_bad_specs_rejected() {
        assert!(Trigger::parse("SIM_LIMIT", "x:5").is_err());
        assert!(Trigger::parse("SIM_LIMIT", "i:").is_err());
        assert!(Trigger::parse("SIM_LIMIT", "branch_mispredicts:100").is_err());
        assert!(Trigger::parse("SIM_LIMIT", "ifoo:100").is_err());
    }

    #[test]
    fn test_progress_reporting() {
        let t = Trigger::parse("SIM_LIMIT", "i:1000").unwrap();
        let p = t.progress(0, &[250], 0);
        assert!((p - 0.25).abs() < 1e-9);
    }
}

//! Branch confidence estimation.
//!
//! A table of per-(history, PC) entries scores how trustworthy the
//! direction prediction of a conditional branch is. Two scoring rules exist
//! behind one type: a resetting saturating counter (confident only at
//! saturation) and a majority vote over a bit vector of recent outcomes.

use crate::uop::Op;

use super::ConfEstimator;

/// Scoring rule of the confidence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfMech {
    /// Saturating counter, reset on mispredict; confident at saturation.
    Counter,
    /// Majority vote over the correctness bits shifted into the entry.
    MajorityVote,
}

/// Confidence estimator over a cooked-history x cooked-PC table.
#[derive(Debug)]
pub struct ConfTable {
    mech: ConfMech,
    table: Vec<u32>,
    index_bits: u32,
    ctr_bits: u32,
}

/// Majority-vote threshold in percent.
const MAJORITY_THRESHOLD_PCT: u32 = 50;

impl ConfTable {
    /// Creates a table of `1 << index_bits` entries with `ctr_bits`-wide
    /// counters (or vote vectors).
    pub fn new(mech: ConfMech, index_bits: u32, ctr_bits: u32) -> Self {
        let init = match mech {
            ConfMech::Counter => 0,
            ConfMech::MajorityVote => (1 << ctr_bits) - 1,
        };
        Self {
            mech,
            table: vec![init; 1 << index_bits],
            index_bits,
            ctr_bits,
        }
    }

    fn index(&self, ghist: u32, addr: u64) -> usize {
        let cooked_hist = ghist >> (32 - self.index_bits);
        let cooked_addr = (addr >> 2) as u32 & ((1u32 << self.index_bits) - 1);
        (cooked_hist ^ cooked_addr) as usize
    }
}

impl ConfEstimator for ConfTable {
    fn predict(&mut self, ghist: u32, op: &mut Op) {
        let index = self.index(ghist, op.inst.addr);
        let entry = self.table[index];
        let max = (1u32 << self.ctr_bits) - 1;
        let conf = match self.mech {
            ConfMech::Counter => entry == max,
            ConfMech::MajorityVote => {
                entry.count_ones() * 100 > self.ctr_bits * MAJORITY_THRESHOLD_PCT
            }
        };
        op.pred.pred_conf_index = index;
        op.pred.pred_conf = conf;
    }

    fn update(&mut self, op: &Op) {
        let entry = &mut self.table[op.pred.pred_conf_index];
        let mispred = op.pred.mispred || op.pred.misfetch;
        let max = (1u32 << self.ctr_bits) - 1;
        match self.mech {
            ConfMech::Counter => {
                if mispred {
                    *entry = 0;
                } else if *entry < max {
                    *entry += 1;
                }
            }
            ConfMech::MajorityVote => {
                *entry = ((*entry << 1) | u32::from(!mispred)) & max;
            }
        }
    }

    fn recover(&mut self) {}
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::uop::{InstInfo, OpPool};

    use super::*;

    fn cbr(pool: &mut OpPool, addr: u64) -> crate::uop::OpId {
        let id = pool.alloc(1, 1, 1).unwrap();
        pool.get_mut(id).inst = Rc::new(InstInfo {
            addr,
            size: 4,
            ..InstInfo::default()
        });
        id
    }

    #[test]
    fn test_counter_confident_only_at_saturation() {
        let mut pool = OpPool::new(0);
        let mut conf = ConfTable::new(ConfMech::Counter, 10, 2);
        let id = cbr(&mut pool, 0x1000);
        conf.predict(0, pool.get_mut(id));
        assert!(!pool.get(id).pred.pred_conf);
        for _ in 0..3 {
            conf.update(pool.get(id));
        }
        conf.predict(0, pool.get_mut(id));
        assert!(pool.get(id).pred.pred_conf);
        // one mispredict resets confidence
        pool.get_mut(id).pred.mispred = true;
        conf.update(pool.get(id));
        pool.get_mut(id).pred.mispred = false;
        conf.predict(0, pool.get_mut(id));
        assert!(!pool.get(id).pred.pred_conf);
    }

    #[test]
    fn test_majority_vote_degrades_gradually() {
        let mut pool = OpPool::new(0);
        let mut conf = ConfTable::new(ConfMech::MajorityVote, 10, 4);
        let id = cbr(&mut pool, 0x1000);
        // starts all-ones: confident
        conf.predict(0, pool.get_mut(id));
        assert!(pool.get(id).pred.pred_conf);
        // one mispredict leaves the majority intact
        pool.get_mut(id).pred.mispred = true;
        conf.update(pool.get(id));
        pool.get_mut(id).pred.mispred = false;
        conf.predict(0, pool.get_mut(id));
        assert!(pool.get(id).pred.pred_conf);
        // a run of mispredicts flips it
        pool.get_mut(id).pred.mispred = true;
        for _ in 0..3 {
            conf.update(pool.get(id));
        }
        pool.get_mut(id).pred.mispred = false;
        conf.predict(0, pool.get_mut(id));
        assert!(!pool.get(id).pred.pred_conf);
    }
}

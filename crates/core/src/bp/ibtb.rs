//! Tagless target-cache predictor for indirect branches.
//!
//! Indirect branches are indexed by a hash of the branch PC and the target
//! history register (a fold of recently seen indirect targets), so the same
//! indirect branch arriving through different call chains maps to different
//! table slots. The table is tagless: aliasing is possible and acceptable.
//!
//! The target history itself is speculative state owned by the prediction
//! subsystem; training recomputes the prediction-time index from the
//! history snapshot carried in the op's recovery info.

use crate::common::Addr;
use crate::uop::{Op, RecoveryInfo};

use super::IbtbModel;

/// Bits of each target folded into the target history.
pub const TARG_HIST_FOLD_BITS: u32 = 4;

/// Tagless indirect-target cache.
#[derive(Debug)]
pub struct TcTagless {
    table: Vec<Addr>,
}

impl TcTagless {
    /// Creates a predictor with `entries` slots (power of two).
    pub fn new(entries: usize) -> Self {
        debug_assert!(entries.is_power_of_two());
        Self {
            table: vec![0; entries],
        }
    }

    fn index(&self, targ_hist: u32, addr: Addr) -> usize {
        ((targ_hist as usize) ^ ((addr >> 2) as usize)) & (self.table.len() - 1)
    }
}

impl IbtbModel for TcTagless {
    fn predict(&mut self, targ_hist: u32, op: &Op) -> Option<Addr> {
        let target = self.table[self.index(targ_hist, op.inst.addr)];
        (target != 0).then_some(target)
    }

    fn update(&mut self, op: &Op) {
        // train the slot the prediction-time history selected
        let idx = self.index(op.recovery_info.targ_hist, op.inst.addr);
        self.table[idx] = op.oracle.target;
    }

    fn recover(&mut self, _info: &RecoveryInfo) {}
}

/// Speculatively folds a predicted target into the history register.
#[inline]
pub fn fold_target(targ_hist: u32, target: Addr) -> u32 {
    let fold = (target >> 2) as u32 & ((1 << TARG_HIST_FOLD_BITS) - 1);
    (targ_hist << TARG_HIST_FOLD_BITS) | fold
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::uop::{InstInfo, OpPool};

    use super::*;

    fn ibr(pool: &mut OpPool, addr: Addr, target: Addr, targ_hist: u32) -> crate::uop::OpId {
        let id = pool.alloc(1, 1, 1).unwrap();
        let op = pool.get_mut(id);
        op.inst = Rc::new(InstInfo {
            addr,
            size: 4,
            ..InstInfo::default()
        });
        op.oracle.target = target;
        op.recovery_info.targ_hist = targ_hist;
        id
    }

    #[test]
    fn test_train_then_predict() {
        let mut pool = OpPool::new(0);
        let mut ibtb = TcTagless::new(256);
        let id = ibr(&mut pool, 0x1000, 0x4000, 0x5);
        assert!(ibtb.predict(0x5, pool.get(id)).is_none());
        ibtb.update(pool.get(id));
        assert_eq!(ibtb.predict(0x5, pool.get(id)), Some(0x4000));
    }

    #[test]
    fn test_history_separates_call_chains() {
        let mut pool = OpPool::new(0);
        let mut ibtb = TcTagless::new(256);
        let via_a = ibr(&mut pool, 0x1000, 0x4000, 0x1);
        let via_b = ibr(&mut pool, 0x1000, 0x8000, 0x2);
        ibtb.update(pool.get(via_a));
        ibtb.update(pool.get(via_b));
        assert_eq!(ibtb.predict(0x1, pool.get(via_a)), Some(0x4000));
        assert_eq!(ibtb.predict(0x2, pool.get(via_b)), Some(0x8000));
    }

    #[test]
    fn test_fold_target_shifts_history() {
        let h1 = fold_target(0, 0x4000);
        let h2 = fold_target(h1, 0x8004);
        assert_ne!(h1, h2);
        assert_eq!(h2 & ((1 << TARG_HIST_FOLD_BITS) - 1), (0x8004 >> 2) & 0xf);
    }
}

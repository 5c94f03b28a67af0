//! Generic branch target buffer.
//!
//! A set-associative cache from branch PC to predicted target. A miss does
//! not stop the branch from being predicted — it marks the op `btb_miss`
//! and the pipeline pays the redirect penalty once the true target
//! resolves, at which point the entry is written.

use crate::common::Addr;
use crate::libs::cache::Cache;
use crate::uop::{Op, RecoveryInfo};

use super::BtbModel;

#[derive(Debug, Clone, Copy, Default)]
struct BtbEntry {
    target: Addr,
}

/// Set-associative PC-to-target buffer.
#[derive(Debug)]
pub struct GenericBtb {
    btb: Cache<BtbEntry>,
}

impl GenericBtb {
    /// Creates a BTB with `entries` total slots and `assoc` ways per set.
    pub fn new(entries: usize, assoc: usize) -> Self {
        Self {
            // 4-byte granularity: one slot per branch address
            btb: Cache::new("BTB", entries, assoc, 4),
        }
    }
}

impl BtbModel for GenericBtb {
    fn predict(&mut self, op: &Op) -> Option<Addr> {
        self.btb.access(op.inst.addr, true).map(|e| e.target)
    }

    fn update(&mut self, op: &Op) {
        let _ = self.btb.insert(
            op.inst.addr,
            BtbEntry {
                target: op.oracle.target,
            },
        );
    }

    fn recover(&mut self, _info: &RecoveryInfo) {}
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::uop::{InstInfo, OpPool};

    use super::*;

    fn br(pool: &mut OpPool, addr: Addr, target: Addr) -> crate::uop::OpId {
        let id = pool.alloc(1, 1, 1).unwrap();
        let op = pool.get_mut(id);
        op.inst = Rc::new(InstInfo {
            addr,
            size: 4,
            ..InstInfo::default()
        });
        op.oracle.target = target;
        id
    }

    #[test]
    fn test_miss_then_hit_after_update() {
        let mut pool = OpPool::new(0);
        let mut btb = GenericBtb::new(64, 4);
        let id = br(&mut pool, 0x1000, 0x9000);
        assert!(btb.predict(pool.get(id)).is_none());
        btb.update(pool.get(id));
        assert_eq!(btb.predict(pool.get(id)), Some(0x9000));
    }

    #[test]
    fn test_distinct_branches_do_not_alias() {
        let mut pool = OpPool::new(0);
        let mut btb = GenericBtb::new(64, 4);
        let a = br(&mut pool, 0x1000, 0x9000);
        let b = br(&mut pool, 0x1004, 0x7000);
        btb.update(pool.get(a));
        btb.update(pool.get(b));
        assert_eq!(btb.predict(pool.get(a)), Some(0x9000));
        assert_eq!(btb.predict(pool.get(b)), Some(0x7000));
    }

    #[test]
    fn test_retarget_overwrites() {
        let mut pool = OpPool::new(0);
        let mut btb = GenericBtb::new(64, 4);
        let a = br(&mut pool, 0x1000, 0x9000);
        btb.update(pool.get(a));
        pool.get_mut(a).oracle.target = 0x5000;
        btb.update(pool.get(a));
        assert_eq!(btb.predict(pool.get(a)), Some(0x5000));
    }
}

//! Set-associative cache array with true-LRU replacement.
//!
//! This is the backing store for every tag-indexed structure in the model:
//! the branch target buffer, the I-cache, and the D-cache tag array. It is a
//! timing structure only — it records presence and per-line payloads, never
//! instruction bytes or data values.

use crate::common::{Addr, Counter};

#[derive(Debug, Clone)]
struct Line<V> {
    valid: bool,
    tag: Addr,
    data: V,
    last_access: Counter,
    inserted: Counter,
}

/// A set-associative array of `V` payloads indexed by address.
///
/// `entries` is the total line count; `assoc` ways per set; `line_bytes`
/// the bytes covered per line (the low bits ignored during tagging). All
/// three must be powers of two.
#[derive(Debug)]
pub struct Cache<V> {
    name: &'static str,
    assoc: usize,
    sets: usize,
    line_bytes: u64,
    set_shift: u32,
    lines: Vec<Line<V>>,
    access_count: Counter,
}

impl<V: Clone + Default> Cache<V> {
    /// Creates a cache with `entries` total lines, `assoc` ways per set and
    /// `line_bytes` bytes per line.
    ///
    /// # Panics
    ///
    /// Panics if any geometry parameter is zero or not a power of two, or if
    /// `assoc > entries`. Geometry comes from validated configuration, so a
    /// violation here is a construction bug, not a runtime condition.
    pub fn new(name: &'static str, entries: usize, assoc: usize, line_bytes: u64) -> Self {
        assert!(entries.is_power_of_two() && entries > 0);
        assert!(assoc.is_power_of_two() && assoc > 0 && assoc <= entries);
        assert!(line_bytes.is_power_of_two() && line_bytes > 0);
        let sets = entries / assoc;
        Self {
            name,
            assoc,
            sets,
            line_bytes,
            set_shift: line_bytes.trailing_zeros(),
            lines: vec![
                Line {
                    valid: false,
                    tag: 0,
                    data: V::default(),
                    last_access: 0,
                    inserted: 0,
                };
                entries
            ],
            access_count: 0,
        }
    }

    /// Name given at construction (used in diagnostics).
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The address of the line containing `addr`.
    #[inline]
    pub fn line_addr(&self, addr: Addr) -> Addr {
        addr & !(self.line_bytes - 1)
    }

    #[inline]
    fn set_index(&self, addr: Addr) -> usize {
        ((addr >> self.set_shift) as usize) & (self.sets - 1)
    }

    fn set_range(&self, addr: Addr) -> std::ops::Range<usize> {
        let set = self.set_index(addr);
        set * self.assoc..(set + 1) * self.assoc
    }

    /// Looks up `addr`. On a hit returns the payload; `update_repl` controls
    /// whether the replacement state is touched (probes pass `false`).
    pub fn access(&mut self, addr: Addr, update_repl: bool) -> Option<&mut V> {
        let tag = self.line_addr(addr);
        self.access_count += 1;
        let stamp = self.access_count;
        let range = self.set_range(addr);
        let line = self.lines[range].iter_mut().find(|l| l.valid && l.tag == tag)?;
        if update_repl {
            line.last_access = stamp;
        }
        Some(&mut line.data)
    }

    /// Read-only probe; never perturbs replacement state.
    pub fn probe(&self, addr: Addr) -> Option<&V> {
        let tag = self.line_addr(addr);
        let range = self.set_range(addr);
        self.lines[range]
            .iter()
            .find(|l| l.valid && l.tag == tag)
            .map(|l| &l.data)
    }

    /// Installs `data` for the line containing `addr`, evicting the LRU way
    /// if the set is full. Returns the address of the evicted line, if any.
    /// An already-present line is overwritten in place.
    pub fn insert(&mut self, addr: Addr, data: V) -> Option<Addr> {
        let tag = self.line_addr(addr);
        self.access_count += 1;
        let stamp = self.access_count;
        let range = self.set_range(addr);

        // overwrite on re-insert
        if let Some(line) = self.lines[range.clone()]
            .iter_mut()
            .find(|l| l.valid && l.tag == tag)
        {
            line.data = data;
            line.last_access = stamp;
            return None;
        }

        let victim_idx = range
            .clone()
            .min_by_key(|&i| {
                let l = &self.lines[i];
                // invalid ways first, then LRU
                (l.valid, l.last_access)
            })
            .unwrap_or(range.start);

        let victim = &mut self.lines[victim_idx];
        let evicted = victim.valid.then_some(victim.tag);
        victim.valid = true;
        victim.tag = tag;
        victim.data = data;
        victim.last_access = stamp;
        victim.inserted = stamp;
        evicted
    }

    /// Drops the line containing `addr`, returning its payload if present.
    pub fn invalidate(&mut self, addr: Addr) -> Option<V> {
        let tag = self.line_addr(addr);
        let range = self.set_range(addr);
        let line = self.lines[range].iter_mut().find(|l| l.valid && l.tag == tag)?;
        line.valid = false;
        Some(std::mem::take(&mut line.data))
    }

    /// Invalidates every line.
    pub fn clear(&mut self) {
        for line in &mut self.lines {
            line.valid = false;
            line.data = V::default();
        }
    }
}

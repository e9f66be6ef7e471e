//! A Rust-side engine for the sanitizer-coverage ABI, for drivers built on `LibAFL`
//! instead of libFuzzer.
//!
//! Registered counter ranges are kept the way `libafl_targets` keeps its
//! `COUNTERS_MAPS` and observed through a `MultiMapObserver`. Registered PC tables
//! are paired with them in registration order, which is what libFuzzer does with
//! its modules as well. A coverage query folds in whatever the counters hold at
//! that moment, so the observed set is current without a driver in the loop.
use std::collections::BTreeSet;

use libafl::observers::MultiMapObserver;
use libafl_bolts::ownedref::OwnedMutSlice;

use crate::sanitizer_coverage::{PcTableEntry, SanitizerCoverage};

#[derive(Debug, Default)]
pub struct InProcessCoverage {
    counters: Vec<OwnedMutSlice<'static, u8>>,
    pcs: Vec<&'static [PcTableEntry]>,
    observed: BTreeSet<usize>,
}

// All registered memory is process-lifetime; see `SanitizerCoverage`.
unsafe impl Send for InProcessCoverage {}

impl InProcessCoverage {
    pub const fn new() -> Self {
        Self {
            counters: Vec::new(),
            pcs: Vec::new(),
            observed: BTreeSet::new(),
        }
    }

    /// Total number of registered counters.
    pub fn num_counters(&self) -> usize {
        self.counters.iter().map(|map| map.len()).sum()
    }

    /// Number of registered PC table entries.
    pub fn num_pcs(&self) -> usize {
        self.pcs.iter().map(|table| table.len()).sum()
    }

    /// Fold the current counters into the observed set: every PC whose counter is
    /// non-zero has been covered. The set only ever grows. Returns the number of
    /// newly observed PCs.
    pub fn update_observed_pcs(&mut self) -> usize {
        let before = self.observed.len();
        for (counters, pcs) in self.counters.iter().zip(&self.pcs) {
            for (&hits, entry) in counters.iter().zip(pcs.iter()) {
                if hits != 0 {
                    self.observed.insert(entry.pc);
                }
            }
        }
        self.observed.len() - before
    }

    /// A `MultiMapObserver` spanning every registered counter range, in
    /// registration order. `None` until something has been registered.
    ///
    /// # Safety
    /// The observer aliases memory written by instrumented code and must not be
    /// used for ranges registered after it was built.
    pub unsafe fn counters_observer(
        &self,
        name: &'static str,
    ) -> Option<MultiMapObserver<'static, u8, false>> {
        let maps: Vec<OwnedMutSlice<'static, u8>> = self
            .counters
            .iter()
            .filter(|map| !map.is_empty())
            .map(|map| unsafe {
                OwnedMutSlice::from_raw_parts_mut(map.as_ptr().cast_mut(), map.len())
            })
            .collect();
        (!maps.is_empty()).then(|| MultiMapObserver::new(name, maps))
    }

    fn assert_disjoint(&self, start: usize, end: usize) {
        for map in &self.counters {
            let map_start = map.as_ptr() as usize;
            let map_end = map_start + map.len();
            assert!(
                end <= map_start || start >= map_end,
                "counter range {start:#x}..{end:#x} overlaps a registered range"
            );
        }
    }
}

impl SanitizerCoverage for InProcessCoverage {
    type ObservedPcs<'a> = Vec<usize>;

    unsafe fn counters_init(&mut self, start: *mut u8, end: *mut u8) {
        self.assert_disjoint(start as usize, end as usize);
        let len = unsafe { end.offset_from(start) } as usize;
        self.counters
            .push(unsafe { OwnedMutSlice::from_raw_parts_mut(start, len) });
    }

    unsafe fn pcs_init(&mut self, start: *const PcTableEntry, end: *const PcTableEntry) {
        let len = unsafe { end.offset_from(start) } as usize;
        self.pcs
            .push(unsafe { core::slice::from_raw_parts(start, len) });
    }

    fn observed_pcs(&mut self) -> Vec<usize> {
        self.update_observed_pcs();
        self.observed.iter().copied().collect()
    }
}

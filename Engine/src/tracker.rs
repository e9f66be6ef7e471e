//! Process-wide coverage state shared between the managed runtime and the native
//! fuzzing engine.
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::{
    EdgeId,
    config::TrackerConfig,
    counters::CounterRegion,
    error::{ProtocolViolation, Result},
    pc_table::SyntheticPcTable,
    recorder::CoverageRecorder,
    sanitizer_coverage::SanitizerCoverage,
};

/// Ties the managed runtime's counter buffer to a native engine `E`.
///
/// Growth and queries mutate shared tables and must be serialised by the caller;
/// the C ABI does so with a process-wide lock.
#[derive(Debug)]
pub struct CoverageTracker<E> {
    counters: Option<CounterRegion>,
    table: SyntheticPcTable,
    coverage_report: Option<PathBuf>,
    engine: E,
}

impl<E> CoverageTracker<E>
where
    E: SanitizerCoverage,
{
    pub const fn new(engine: E) -> Self {
        Self {
            counters: None,
            table: SyntheticPcTable::new(),
            coverage_report: None,
            engine,
        }
    }

    /// Bind the counter buffer. Must happen exactly once.
    ///
    /// # Safety
    /// `counters` must point to `config.max_num_counters` writable bytes that live
    /// as long as the process.
    pub unsafe fn initialize(&mut self, counters: *mut u8, config: &TrackerConfig) -> Result<()> {
        if self.counters.is_some() {
            return Err(ProtocolViolation::AlreadyInitialized.into());
        }
        let region = unsafe { CounterRegion::bind(counters, config.max_num_counters) }?;
        info!(
            "Coverage counters bound at {:p} (capacity {})",
            region.base(),
            region.capacity()
        );
        self.counters = Some(region);
        self.coverage_report.clone_from(&config.coverage_report);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.counters.is_some()
    }

    /// Base address of the counter buffer.
    pub fn coverage_counters(&self) -> Result<*mut u8> {
        Ok(self.region()?.base())
    }

    /// Number of counters registered with the engine so far.
    pub fn num_counters(&self) -> usize {
        self.table.len()
    }

    pub fn synthetic_pcs(&self) -> &SyntheticPcTable {
        &self.table
    }

    pub fn coverage_report_path(&self) -> Option<&Path> {
        self.coverage_report.as_deref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    fn region(&self) -> Result<&CounterRegion, ProtocolViolation> {
        self.counters.as_ref().ok_or(ProtocolViolation::NotInitialized)
    }

    /// Hand counters `[old, new)` and their synthetic PCs to the engine.
    ///
    /// Only the new slice is registered; the engine must never see a range twice.
    pub fn register_new_counters(&mut self, old: usize, new: usize) -> Result<()> {
        let region = *self.region()?;
        if new < old {
            return Err(ProtocolViolation::CountDecreased { old, new }.into());
        }
        if new == old {
            return Ok(());
        }

        let (counters_start, counters_end) = region.sub_range(old, new)?;
        let (pcs_start, pcs_end) = self.table.extend(old, new, region.capacity())?;
        unsafe {
            self.engine.counters_init(counters_start, counters_end);
            self.engine.pcs_init(pcs_start, pcs_end);
        }
        debug!("Registered counters {old}..{new}");
        Ok(())
    }

    /// Edge ids of every synthetic PC the engine has observed as covered.
    pub fn covered_edge_ids(&mut self) -> Result<Vec<EdgeId>> {
        if self.table.is_empty() {
            return Err(ProtocolViolation::EmptyTable.into());
        }
        let covered = {
            let observed = self.engine.observed_pcs();
            observed
                .as_ref()
                .iter()
                .map(|&pc| self.table.edge_id_of(pc))
                .collect::<Result<Vec<_>, _>>()?
        };
        debug!(
            "{} of {} edges observed as covered",
            covered.len(),
            self.table.len()
        );
        Ok(covered)
    }

    /// File-level coverage report for everything observed so far.
    pub fn compute_coverage<R>(&mut self, recorder: &mut R) -> Result<String>
    where
        R: CoverageRecorder + ?Sized,
    {
        let covered = self.covered_edge_ids()?;
        recorder.build_report(&covered)
    }

    /// Write [`Self::compute_coverage`] to `path`.
    pub fn dump_coverage_report<R>(&mut self, recorder: &mut R, path: &Path) -> Result<()>
    where
        R: CoverageRecorder + ?Sized,
    {
        let report = self.compute_coverage(recorder)?;
        std::fs::write(path, report)?;
        info!("Coverage report written to {}", path.display());
        Ok(())
    }

    pub fn record_initial_coverage<R>(&self, recorder: &mut R) -> Result<()>
    where
        R: CoverageRecorder + ?Sized,
    {
        self.region()?;
        recorder.snapshot_baseline()
    }

    pub fn replay_initial_coverage<R>(&self, recorder: &mut R) -> Result<()>
    where
        R: CoverageRecorder + ?Sized,
    {
        self.region()?;
        recorder.restore_baseline()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{error::CoverageError, in_process::InProcessCoverage};

    const CAPACITY: usize = 64;

    fn counter_buffer() -> &'static mut [u8] {
        Box::leak(vec![0u8; CAPACITY].into_boxed_slice())
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            max_num_counters: CAPACITY,
            coverage_report: None,
        }
    }

    fn tracker(counters: &mut [u8]) -> CoverageTracker<InProcessCoverage> {
        let mut tracker = CoverageTracker::new(InProcessCoverage::new());
        unsafe { tracker.initialize(counters.as_mut_ptr(), &config()) }.unwrap();
        tracker
    }

    fn violation(result: Result<impl core::fmt::Debug>) -> ProtocolViolation {
        result.unwrap_err().protocol().cloned().unwrap()
    }

    /// Stand-in for the managed runtime: tracks covered ids, renders them per edge,
    /// and keeps a baseline.
    #[derive(Default)]
    struct Recorder {
        covered: BTreeSet<EdgeId>,
        baseline: BTreeSet<EdgeId>,
        requests: Vec<Vec<EdgeId>>,
        fail_with: Option<&'static str>,
    }

    impl CoverageRecorder for Recorder {
        fn build_report(&mut self, covered: &[EdgeId]) -> Result<String> {
            if let Some(diagnostic) = self.fail_with {
                return Err(CoverageError::cross_boundary("build_report", diagnostic));
            }
            self.requests.push(covered.to_vec());
            self.covered.extend(covered);
            Ok(self
                .covered
                .iter()
                .map(|id| format!("Edge.java:{id}\n"))
                .collect())
        }

        fn snapshot_baseline(&mut self) -> Result<()> {
            self.baseline = self.covered.clone();
            Ok(())
        }

        fn restore_baseline(&mut self) -> Result<()> {
            self.covered.extend(&self.baseline);
            Ok(())
        }
    }

    #[test]
    fn initialize_twice_keeps_first_buffer() {
        let first = counter_buffer();
        let second = counter_buffer();
        let mut tracker = tracker(first);
        let result = unsafe { tracker.initialize(second.as_mut_ptr(), &config()) };
        assert_eq!(violation(result), ProtocolViolation::AlreadyInitialized);
        assert_eq!(tracker.coverage_counters().unwrap(), first.as_mut_ptr());
    }

    #[test]
    fn growth_requires_initialization() {
        let mut tracker = CoverageTracker::new(InProcessCoverage::new());
        assert_eq!(
            violation(tracker.register_new_counters(0, 4)),
            ProtocolViolation::NotInitialized
        );
        assert_eq!(
            violation(tracker.coverage_counters()),
            ProtocolViolation::NotInitialized
        );
    }

    #[test]
    fn shrinking_growth_is_rejected_without_mutation() {
        let mut tracker = tracker(counter_buffer());
        tracker.register_new_counters(0, 5).unwrap();
        assert_eq!(
            violation(tracker.register_new_counters(5, 3)),
            ProtocolViolation::CountDecreased { old: 5, new: 3 }
        );
        assert_eq!(tracker.num_counters(), 5);
        assert_eq!(tracker.engine().num_counters(), 5);
    }

    #[test]
    fn empty_growth_is_a_noop() {
        let mut tracker = tracker(counter_buffer());
        tracker.register_new_counters(0, 0).unwrap();
        assert_eq!(tracker.num_counters(), 0);
        assert_eq!(tracker.engine().num_counters(), 0);
    }

    #[test]
    fn growth_registers_only_new_slices() {
        let counters = counter_buffer();
        let mut tracker = tracker(counters);
        tracker.register_new_counters(0, 3).unwrap();
        tracker.register_new_counters(3, 3).unwrap();
        tracker.register_new_counters(3, 10).unwrap();
        assert_eq!(tracker.engine().num_counters(), 10);
        assert_eq!(tracker.engine().num_pcs(), 10);

        let pcs = tracker.synthetic_pcs();
        for id in 0..10 {
            let pc = pcs.address_of(id).unwrap();
            assert_eq!(pcs.edge_id_of(pc), Ok(id));
        }
        assert!(unsafe { tracker.engine().counters_observer("managed-edges") }.is_some());
    }

    #[test]
    fn growth_beyond_buffer_is_rejected() {
        let mut tracker = tracker(counter_buffer());
        assert_eq!(
            violation(tracker.register_new_counters(0, CAPACITY + 1)),
            ProtocolViolation::CapacityExceeded {
                requested: CAPACITY + 1,
                capacity: CAPACITY
            }
        );
        assert_eq!(tracker.num_counters(), 0);
    }

    #[test]
    fn query_before_growth_is_rejected() {
        let mut tracker = tracker(counter_buffer());
        let mut recorder = Recorder::default();
        assert_eq!(
            violation(tracker.compute_coverage(&mut recorder)),
            ProtocolViolation::EmptyTable
        );
        assert!(recorder.requests.is_empty());
    }

    #[test]
    fn observed_pcs_map_back_to_edge_ids() {
        let counters = counter_buffer();
        let mut tracker = tracker(counters);
        tracker.register_new_counters(0, 10).unwrap();
        counters[2] = 1;
        counters[7] = 4;

        let mut recorder = Recorder::default();
        let report = tracker.compute_coverage(&mut recorder).unwrap();
        assert_eq!(recorder.requests, vec![vec![2, 7]]);
        assert_eq!(report, "Edge.java:2\nEdge.java:7\n");
    }

    #[test]
    fn coverage_spans_growth_steps() {
        let counters = counter_buffer();
        let mut tracker = tracker(counters);
        tracker.register_new_counters(0, 4).unwrap();
        counters[1] = 1;
        tracker.register_new_counters(4, 12).unwrap();
        counters[9] = 1;
        assert_eq!(tracker.covered_edge_ids().unwrap(), vec![1, 9]);
    }

    #[test]
    fn record_then_replay_leaves_report_unchanged() {
        let counters = counter_buffer();
        let mut tracker = tracker(counters);
        tracker.register_new_counters(0, 8).unwrap();
        counters[3] = 1;

        let mut plain = Recorder::default();
        let expected = tracker.compute_coverage(&mut plain).unwrap();

        let mut round_trip = Recorder::default();
        tracker.compute_coverage(&mut round_trip).unwrap();
        tracker.record_initial_coverage(&mut round_trip).unwrap();
        tracker.replay_initial_coverage(&mut round_trip).unwrap();
        assert_eq!(tracker.compute_coverage(&mut round_trip).unwrap(), expected);
    }

    #[test]
    fn recorder_failures_propagate() {
        let mut tracker = tracker(counter_buffer());
        tracker.register_new_counters(0, 2).unwrap();
        let mut recorder = Recorder {
            fail_with: Some("ClassNotFoundException"),
            ..Recorder::default()
        };
        let err = tracker.compute_coverage(&mut recorder).unwrap_err();
        assert!(matches!(err, CoverageError::CrossBoundary { hook: "build_report", .. }));
    }

    #[test]
    fn report_is_dumped_to_file() {
        let counters = counter_buffer();
        let mut tracker = tracker(counters);
        tracker.register_new_counters(0, 4).unwrap();
        counters[0] = 1;

        let path =
            std::env::temp_dir().join(format!("edge_bridge_report_{}.txt", std::process::id()));
        let mut recorder = Recorder::default();
        tracker.dump_coverage_report(&mut recorder, &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Edge.java:0\n");
        std::fs::remove_file(&path).unwrap();
    }
}

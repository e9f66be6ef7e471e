/// Harness builders that run managed-code targets under LibAFL.
use libafl::executors::ExitKind;
use libafl::inputs::{BytesInput, HasTargetBytes};
use libafl_bolts::AsSlice;
use log::debug;
use spin::Mutex;

use crate::in_process::InProcessCoverage;
use crate::tracker::CoverageTracker;

/// Entry point into the managed runtime: runs the fuzz target on one input.
pub type ManagedTargetFn = unsafe extern "C" fn(*const u8, usize);

/// Build a harness that runs `target_fn` and then folds the counters it touched
/// into the tracker's observed PCs.
pub fn observing_harness(
    tracker: &Mutex<CoverageTracker<InProcessCoverage>>,
    target_fn: ManagedTargetFn,
) -> impl FnMut(&BytesInput) -> ExitKind + '_ {
    move |input: &BytesInput| {
        let target = input.target_bytes();
        let buf = target.as_slice();

        // The target may load and instrument new code, which registers counters
        // through the same tracker, so it runs without the lock held.
        unsafe {
            target_fn(buf.as_ptr(), buf.len());
        }

        let newly_observed = tracker.lock().engine_mut().update_observed_pcs();
        if newly_observed > 0 {
            debug!("Input covered {newly_observed} new edges");
        }

        ExitKind::Ok
    }
}

//! C ABI consumed by the managed runtime.
//!
//! The tracker is a process singleton that is never torn down: the native engine
//! keeps pointers into its tables until exit. Every failure here is a bug in the
//! caller or in the runtime's hooks and aborts the process. Calls are serialised
//! by the runtime, so a lock that is already held means a hook re-entered the
//! bridge; that fails instead of spinning.
use core::ffi::{CStr, c_char};
use std::ffi::CString;
use std::path::PathBuf;

use log::error;
use spin::{Mutex, MutexGuard};

use crate::{
    config::{CoverageConfig, TrackerConfig},
    error::{CoverageError, ProtocolViolation, Result},
    recorder::{HookRecorder, RecorderHooks},
    tracker::CoverageTracker,
};

#[cfg(feature = "libfuzzer")]
pub type NativeEngine = crate::sanitizer_coverage::LibFuzzer;
#[cfg(not(feature = "libfuzzer"))]
pub type NativeEngine = crate::in_process::InProcessCoverage;

/// The process-wide tracker behind the C ABI. Lock order: `TRACKER`, then `RECORDER`.
pub static TRACKER: Mutex<CoverageTracker<NativeEngine>> =
    Mutex::new(CoverageTracker::new(NativeEngine::new()));

static RECORDER: Mutex<Option<HookRecorder>> = Mutex::new(None);

fn or_abort<T>(operation: &str, result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            error!("{operation}: {err}");
            panic!("{operation}: {err}");
        }
    }
}

fn acquire<'a, T>(mutex: &'a Mutex<T>, operation: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex
        .try_lock()
        .ok_or_else(|| ProtocolViolation::Reentrant { operation }.into())
}

fn count(raw: i32) -> Result<usize> {
    usize::try_from(raw).map_err(|_| ProtocolViolation::NegativeCount { count: raw.into() }.into())
}

fn with_recorder<T>(
    hook: &'static str,
    f: impl FnOnce(&mut HookRecorder) -> Result<T>,
) -> Result<T> {
    let mut recorder = acquire(&RECORDER, hook)?;
    let recorder = recorder
        .as_mut()
        .ok_or_else(|| CoverageError::cross_boundary(hook, "no recorder hooks registered"))?;
    f(recorder)
}

/// Bind the counter buffer. `config` may be null for defaults.
///
/// # Safety
/// `counters` must point to `max_num_counters` bytes that live for the rest of the
/// process; `config`, if not null, must point to a valid [`CoverageConfig`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn edge_bridge_initialize(counters: *mut u8, config: *const CoverageConfig) {
    let config = if config.is_null() {
        TrackerConfig::default()
    } else {
        TrackerConfig::from(unsafe { &*config })
    };
    let result = acquire(&TRACKER, "edge_bridge_initialize")
        .and_then(|mut tracker| unsafe { tracker.initialize(counters, &config) });
    or_abort("edge_bridge_initialize", result);
}

/// Register the counters `[old_num_counters, new_num_counters)`.
#[unsafe(no_mangle)]
pub extern "C" fn edge_bridge_register_new_counters(old_num_counters: i32, new_num_counters: i32) {
    let result = count(old_num_counters).and_then(|old| {
        let new = count(new_num_counters)?;
        acquire(&TRACKER, "edge_bridge_register_new_counters")?
            .register_new_counters(old, new)
    });
    or_abort("edge_bridge_register_new_counters", result);
}

#[unsafe(no_mangle)]
pub extern "C" fn edge_bridge_coverage_counters() -> *mut u8 {
    const OPERATION: &str = "edge_bridge_coverage_counters";
    or_abort(
        OPERATION,
        acquire(&TRACKER, OPERATION).and_then(|tracker| tracker.coverage_counters()),
    )
}

/// Install the managed runtime's coverage recorder. A later call replaces it.
///
/// # Safety
/// `hooks` must point to a valid [`RecorderHooks`] whose context and callbacks
/// stay valid for the rest of the process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn edge_bridge_set_recorder(hooks: *const RecorderHooks) {
    let hooks = or_abort(
        "edge_bridge_set_recorder",
        unsafe { hooks.as_ref() }
            .copied()
            .ok_or_else(|| CoverageError::cross_boundary("set_recorder", "hooks must not be null")),
    );
    let mut recorder = or_abort(
        "edge_bridge_set_recorder",
        acquire(&RECORDER, "edge_bridge_set_recorder"),
    );
    *recorder = Some(unsafe { HookRecorder::new(hooks) });
}

/// Coverage report for all edges covered so far. Free it with
/// [`edge_bridge_free_report`].
#[unsafe(no_mangle)]
pub extern "C" fn edge_bridge_compute_coverage() -> *mut c_char {
    const OPERATION: &str = "edge_bridge_compute_coverage";
    let result = acquire(&TRACKER, OPERATION)
        .and_then(|mut tracker| {
            with_recorder("build_report", |recorder| tracker.compute_coverage(recorder))
        })
        .and_then(|report| {
            CString::new(report)
                .map_err(|err| CoverageError::cross_boundary("build_report", err.to_string()))
        });
    or_abort(OPERATION, result).into_raw()
}

/// # Safety
/// `report` must come from [`edge_bridge_compute_coverage`] and not be freed twice.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn edge_bridge_free_report(report: *mut c_char) {
    if !report.is_null() {
        drop(unsafe { CString::from_raw(report) });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn edge_bridge_record_initial_coverage() {
    const OPERATION: &str = "edge_bridge_record_initial_coverage";
    let result = acquire(&TRACKER, OPERATION).and_then(|tracker| {
        with_recorder("snapshot_baseline", |recorder| {
            tracker.record_initial_coverage(recorder)
        })
    });
    or_abort(OPERATION, result);
}

#[unsafe(no_mangle)]
pub extern "C" fn edge_bridge_replay_initial_coverage() {
    const OPERATION: &str = "edge_bridge_replay_initial_coverage";
    let result = acquire(&TRACKER, OPERATION).and_then(|tracker| {
        with_recorder("restore_baseline", |recorder| {
            tracker.replay_initial_coverage(recorder)
        })
    });
    or_abort(OPERATION, result);
}

/// Write the coverage report to `path`, or to the configured report path when
/// `path` is null. Returns whether a report was written.
///
/// # Safety
/// `path`, if not null, must be a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn edge_bridge_dump_coverage_report(path: *const c_char) -> bool {
    const OPERATION: &str = "edge_bridge_dump_coverage_report";
    let mut tracker = or_abort(OPERATION, acquire(&TRACKER, OPERATION));
    let path = if path.is_null() {
        tracker.coverage_report_path().map(PathBuf::from)
    } else {
        let path = unsafe { CStr::from_ptr(path) };
        Some(PathBuf::from(path.to_string_lossy().into_owned()))
    };
    let Some(path) = path else {
        return false;
    };
    let result = with_recorder("build_report", |recorder| {
        tracker.dump_coverage_report(recorder, &path)
    });
    or_abort(OPERATION, result);
    true
}

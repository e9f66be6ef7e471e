//! Hooks into the managed runtime that owns edge -> source mappings.
use core::ffi::{CStr, c_char, c_int, c_void};

use crate::{
    EdgeId,
    error::{CoverageError, Result},
};

/// What the bridge needs from the managed runtime's coverage recorder.
pub trait CoverageRecorder {
    /// Render the file-level coverage report for the given covered edges.
    fn build_report(&mut self, covered: &[EdgeId]) -> Result<String>;

    /// Remember the currently covered edges as the baseline.
    fn snapshot_baseline(&mut self) -> Result<()>;

    /// Re-apply the recorded baseline.
    fn restore_baseline(&mut self) -> Result<()>;
}

pub type BuildReportFn = unsafe extern "C" fn(
    context: *mut c_void,
    covered: *const EdgeId,
    len: usize,
    report: *mut *const c_char,
) -> c_int;
pub type ReleaseReportFn = unsafe extern "C" fn(context: *mut c_void, report: *const c_char);
pub type BaselineFn = unsafe extern "C" fn(context: *mut c_void) -> c_int;
pub type LastErrorFn = unsafe extern "C" fn(context: *mut c_void) -> *const c_char;

/// Callback table registered by the managed runtime.
///
/// Every callback returns 0 on success. A report produced by `build_report` stays
/// owned by the runtime until the bridge hands it back to `release_report`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RecorderHooks {
    pub context: *mut c_void,
    pub build_report: Option<BuildReportFn>,
    pub release_report: Option<ReleaseReportFn>,
    pub snapshot_baseline: Option<BaselineFn>,
    pub restore_baseline: Option<BaselineFn>,
    /// Optional. Describes the last failure, e.g. a pending exception.
    pub last_error: Option<LastErrorFn>,
}

/// [`CoverageRecorder`] over a [`RecorderHooks`] table.
#[derive(Debug, Clone, Copy)]
pub struct HookRecorder {
    hooks: RecorderHooks,
}

// The runtime promises its hooks may be called from whichever thread drives the bridge.
unsafe impl Send for HookRecorder {}

impl HookRecorder {
    /// # Safety
    /// `hooks.context` and the callbacks must stay valid while the recorder is in use.
    pub unsafe fn new(hooks: RecorderHooks) -> Self {
        Self { hooks }
    }

    fn failure(&self, hook: &'static str, status: c_int) -> CoverageError {
        let described = self.hooks.last_error.and_then(|last_error| {
            let message = unsafe { last_error(self.hooks.context) };
            (!message.is_null())
                .then(|| unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned())
        });
        CoverageError::cross_boundary(
            hook,
            described.unwrap_or_else(|| format!("returned status {status}")),
        )
    }

    fn call_baseline(&self, hook: &'static str, callback: Option<BaselineFn>) -> Result<()> {
        let callback =
            callback.ok_or_else(|| CoverageError::cross_boundary(hook, "hook not registered"))?;
        match unsafe { callback(self.hooks.context) } {
            0 => Ok(()),
            status => Err(self.failure(hook, status)),
        }
    }
}

/// Gives a runtime-owned report back on every exit path.
struct ReportGuard<'a> {
    hooks: &'a RecorderHooks,
    report: *const c_char,
}

impl Drop for ReportGuard<'_> {
    fn drop(&mut self) {
        if let (Some(release), false) = (self.hooks.release_report, self.report.is_null()) {
            unsafe { release(self.hooks.context, self.report) };
        }
    }
}

impl CoverageRecorder for HookRecorder {
    fn build_report(&mut self, covered: &[EdgeId]) -> Result<String> {
        const HOOK: &str = "build_report";
        let build = self
            .hooks
            .build_report
            .ok_or_else(|| CoverageError::cross_boundary(HOOK, "hook not registered"))?;

        let mut report = core::ptr::null();
        let status =
            unsafe { build(self.hooks.context, covered.as_ptr(), covered.len(), &mut report) };
        let guard = ReportGuard {
            hooks: &self.hooks,
            report,
        };
        if status != 0 {
            return Err(self.failure(HOOK, status));
        }
        if guard.report.is_null() {
            return Err(CoverageError::cross_boundary(HOOK, "no report returned"));
        }
        let text = unsafe { CStr::from_ptr(guard.report) };
        text.to_str().map(str::to_owned).map_err(|err| {
            CoverageError::cross_boundary(HOOK, format!("report is not UTF-8: {err}"))
        })
    }

    fn snapshot_baseline(&mut self) -> Result<()> {
        self.call_baseline("snapshot_baseline", self.hooks.snapshot_baseline)
    }

    fn restore_baseline(&mut self) -> Result<()> {
        self.call_baseline("restore_baseline", self.hooks.restore_baseline)
    }
}

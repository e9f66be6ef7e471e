/// Configuration types for the edge bridge C ABI boundary.
use std::path::PathBuf;

/// Default number of counters the managed runtime reserves up front.
pub const DEFAULT_MAX_NUM_COUNTERS: usize = 1 << 20;

#[repr(C)]
pub struct CoverageConfig {
    /// Size of the counter buffer handed to `edge_bridge_initialize`. 0 = default (1 << 20).
    pub max_num_counters: u32,
    /// Path the file-level coverage report is dumped to. Null = no dump.
    pub coverage_report: *const core::ffi::c_char,
}

impl CoverageConfig {
    pub fn max_num_counters_or_default(&self) -> usize {
        if self.max_num_counters == 0 {
            DEFAULT_MAX_NUM_COUNTERS
        } else {
            self.max_num_counters as usize
        }
    }

    pub fn coverage_report_or_default(&self) -> Option<PathBuf> {
        if self.coverage_report.is_null() {
            None
        } else {
            let path = unsafe { core::ffi::CStr::from_ptr(self.coverage_report) };
            Some(PathBuf::from(path.to_string_lossy().into_owned()))
        }
    }
}

/// Owned, validated form of [`CoverageConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub max_num_counters: usize,
    pub coverage_report: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_num_counters: DEFAULT_MAX_NUM_COUNTERS,
            coverage_report: None,
        }
    }
}

impl From<&CoverageConfig> for TrackerConfig {
    fn from(config: &CoverageConfig) -> Self {
        Self {
            max_num_counters: config.max_num_counters_or_default(),
            coverage_report: config.coverage_report_or_default(),
        }
    }
}

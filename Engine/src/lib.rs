//! Edge bridge - hands managed-code edge coverage to a native fuzzing engine.
//!
//! The managed runtime owns a buffer of 8-bit counters, one per instrumented edge.
//! This crate registers that buffer with a `SanitizerCoverage` engine (libFuzzer, or
//! the in-process engine for LibAFL drivers), backs every counter with a synthetic
//! PC so the engine's PC table bookkeeping works, and maps the PCs the engine
//! observed back to edge ids when the runtime asks for a coverage report.
//!
//! Provides a C ABI for the managed runtime in [`ffi`].

pub mod config;
pub mod counters;
pub mod error;
pub mod ffi;
pub mod harness;
pub mod in_process;
pub mod pc_table;
pub mod recorder;
pub mod sanitizer_coverage;
pub mod tracker;

/// Dense edge identifier assigned by the instrumentor. Edge `i` owns counter byte `i`.
pub type EdgeId = u32;

pub use error::{CoverageError, ProtocolViolation};
pub use in_process::InProcessCoverage;
pub use recorder::{CoverageRecorder, HookRecorder, RecorderHooks};
pub use sanitizer_coverage::{PcTableEntry, SanitizerCoverage};
pub use tracker::CoverageTracker;

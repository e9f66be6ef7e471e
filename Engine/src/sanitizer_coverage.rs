//! The slice of the `SanitizerCoverage` ABI the bridge talks to: inline 8-bit
//! counters, the PC table and the observed-PC query.

/// One entry of the PC table passed to `__sanitizer_cov_pcs_init`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcTableEntry {
    pub pc: usize,
    pub flags: usize,
}

/// A native engine consuming counters and PC tables.
///
/// Ranges are half-open and must never overlap anything registered before.
pub trait SanitizerCoverage {
    /// Buffer of observed PCs, released when dropped.
    type ObservedPcs<'a>: AsRef<[usize]>
    where
        Self: 'a;

    /// # Safety
    /// `[start, end)` must stay valid and writable for the rest of the process.
    unsafe fn counters_init(&mut self, start: *mut u8, end: *mut u8);

    /// # Safety
    /// `[start, end)` must stay valid for the rest of the process and match the
    /// counters registered alongside it.
    unsafe fn pcs_init(&mut self, start: *const PcTableEntry, end: *const PcTableEntry);

    /// Every PC observed as covered since the process started.
    fn observed_pcs(&mut self) -> Self::ObservedPcs<'_>;
}

#[cfg(feature = "libfuzzer")]
pub use self::libfuzzer::{LibFuzzer, LibFuzzerObservedPcs};

#[cfg(feature = "libfuzzer")]
mod libfuzzer {
    use super::{PcTableEntry, SanitizerCoverage};

    unsafe extern "C" {
        fn __sanitizer_cov_8bit_counters_init(start: *mut u8, end: *mut u8);
        fn __sanitizer_cov_pcs_init(pcs_beg: *const usize, pcs_end: *const usize);
        fn __sanitizer_cov_get_observed_pcs(pc_entries: *mut *mut usize) -> usize;
    }

    /// The libFuzzer linked into this process.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LibFuzzer;

    impl LibFuzzer {
        pub const fn new() -> Self {
            Self
        }
    }

    /// Array handed over by `__sanitizer_cov_get_observed_pcs`; we own it until drop.
    #[derive(Debug)]
    pub struct LibFuzzerObservedPcs {
        pcs: *mut usize,
        len: usize,
    }

    impl AsRef<[usize]> for LibFuzzerObservedPcs {
        fn as_ref(&self) -> &[usize] {
            if self.pcs.is_null() {
                &[]
            } else {
                unsafe { core::slice::from_raw_parts(self.pcs, self.len) }
            }
        }
    }

    impl Drop for LibFuzzerObservedPcs {
        fn drop(&mut self) {
            if !self.pcs.is_null() {
                // libFuzzer allocates this with `new uintptr_t[]`. Releasing it with
                // `free` assumes the C++ runtime's array `new` is backed by `malloc`,
                // which holds for libstdc++ and libc++ but is not guaranteed.
                unsafe { libc::free(self.pcs.cast()) };
            }
        }
    }

    impl SanitizerCoverage for LibFuzzer {
        type ObservedPcs<'a> = LibFuzzerObservedPcs;

        unsafe fn counters_init(&mut self, start: *mut u8, end: *mut u8) {
            unsafe { __sanitizer_cov_8bit_counters_init(start, end) }
        }

        unsafe fn pcs_init(&mut self, start: *const PcTableEntry, end: *const PcTableEntry) {
            unsafe { __sanitizer_cov_pcs_init(start.cast(), end.cast()) }
        }

        fn observed_pcs(&mut self) -> LibFuzzerObservedPcs {
            let mut pcs = core::ptr::null_mut();
            let len = unsafe { __sanitizer_cov_get_observed_pcs(&mut pcs) };
            LibFuzzerObservedPcs { pcs, len }
        }
    }
}

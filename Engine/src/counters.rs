//! The 8-bit counter buffer lent to us by the managed runtime.
use core::ptr::NonNull;

use crate::error::ProtocolViolation;

/// One byte per edge, `[base, base + capacity)`, owned by the managed runtime for
/// the whole process lifetime. The bridge never frees or moves it.
#[derive(Debug, Clone, Copy)]
pub struct CounterRegion {
    base: NonNull<u8>,
    capacity: usize,
}

// The region is a passive memory range; instrumented code bumps the bytes without
// synchronisation and we only ever hand out pointers or short-lived reads.
unsafe impl Send for CounterRegion {}

impl CounterRegion {
    /// Bind to the buffer at `base`.
    ///
    /// # Safety
    /// `base` must point to at least `capacity` writable bytes that stay valid for
    /// the rest of the process.
    pub unsafe fn bind(base: *mut u8, capacity: usize) -> Result<Self, ProtocolViolation> {
        let base = NonNull::new(base).ok_or(ProtocolViolation::NullCounters)?;
        Ok(Self { base, capacity })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Half-open pointer pair covering counters `[old, new)`.
    pub fn sub_range(&self, old: usize, new: usize) -> Result<(*mut u8, *mut u8), ProtocolViolation> {
        if new > self.capacity {
            return Err(ProtocolViolation::CapacityExceeded {
                requested: new,
                capacity: self.capacity,
            });
        }
        debug_assert!(old <= new);
        unsafe { Ok((self.base().add(old), self.base().add(new))) }
    }

    /// Snapshot view of the first `len` counters.
    ///
    /// # Safety
    /// Instrumented code may write these bytes concurrently; the caller must not
    /// rely on the values staying put.
    pub unsafe fn counters(&self, len: usize) -> &[u8] {
        let len = len.min(self.capacity);
        unsafe { core::slice::from_raw_parts(self.base(), len) }
    }
}

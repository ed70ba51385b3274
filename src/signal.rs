//! Interrupt-to-main-loop hand-off.
//!
//! Radio and IMU interrupt top-halves do exactly two things: set a flag and
//! stamp a time. Both live here, behind release/acquire pairs, so drivers
//! never share raw mutable statics with the poll loop. The ISR side is the
//! single writer, the main loop the single reader; neither side ever touches
//! the codec or the persistence layer from interrupt context.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// One pending-event latch with a microsecond timestamp.
///
/// Lives in a `static` shared between the ISR and the owner of the MAC
/// handle; the tracker consumes its IMU data-ready line through one of
/// these (see `Tracker::attach_imu_latch`), and radio drivers use the same
/// shape to carry the RX timestamp into [`crate::hal::RxMeta`].
///
/// The timestamp is split into two 32-bit words because targets this runs on
/// have no 64-bit atomics; the flag's release/acquire pair orders both words,
/// and `take` only reads them after observing the flag set.
pub struct IrqLatch {
    pending: AtomicBool,
    stamp_lo: AtomicU32,
    stamp_hi: AtomicU32,
}

impl IrqLatch {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            stamp_lo: AtomicU32::new(0),
            stamp_hi: AtomicU32::new(0),
        }
    }

    /// ISR side: record the event time and raise the flag.
    pub fn raise(&self, timestamp_us: u64) {
        self.stamp_lo.store(timestamp_us as u32, Ordering::Relaxed);
        self.stamp_hi.store((timestamp_us >> 32) as u32, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Main-loop side: consume the event, returning its timestamp.
    pub fn take(&self) -> Option<u64> {
        if !self.pending.swap(false, Ordering::Acquire) {
            return None;
        }
        let lo = self.stamp_lo.load(Ordering::Relaxed) as u64;
        let hi = self.stamp_hi.load(Ordering::Relaxed) as u64;
        Some((hi << 32) | lo)
    }

    /// Peek without consuming; for idle-loop wake decisions.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl Default for IrqLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes() {
        let latch = IrqLatch::new();
        assert_eq!(latch.take(), None);
        latch.raise(0x1_0000_0042);
        assert!(latch.is_pending());
        assert_eq!(latch.take(), Some(0x1_0000_0042));
        assert_eq!(latch.take(), None);
    }
}

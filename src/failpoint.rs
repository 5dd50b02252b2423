//! Summary: Failure injection points for crash safety testing.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Only compiled with the `failpoint` feature. Tests arm a single
//! process-global, one-shot failure site between the commit steps (data
//! write, data sync, meta write, meta sync); the next commit that reaches
//! the armed site fails with an injected I/O error, exercising the revert
//! and sticky-failure paths without a real crash.

use std::sync::atomic::{AtomicU8, Ordering};

/// Commit steps where a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FailPoint {
    None = 0,
    /// Before the data pages are written.
    BeforeDataWrite = 1,
    /// After the data pages are written, before the data fsync.
    BeforeDataSync = 2,
    /// After the data fsync, before the meta page is written.
    BeforeMetaWrite = 3,
    /// After the meta page is written, before the meta fsync.
    BeforeMetaSync = 4,
}

static ARMED: AtomicU8 = AtomicU8::new(0);

/// Arms a one-shot failure at the given commit step.
pub fn arm(point: FailPoint) {
    ARMED.store(point as u8, Ordering::SeqCst);
}

/// Disarms any pending failure.
pub fn disarm() {
    ARMED.store(FailPoint::None as u8, Ordering::SeqCst);
}

/// Consumes the armed failure if it matches `point`.
pub(crate) fn hit(point: FailPoint) -> bool {
    ARMED
        .compare_exchange(
            point as u8,
            FailPoint::None as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_armed_point_fires_once() {
        disarm();
        arm(FailPoint::BeforeMetaWrite);
        assert!(!hit(FailPoint::BeforeDataSync));
        assert!(hit(FailPoint::BeforeMetaWrite));
        assert!(!hit(FailPoint::BeforeMetaWrite), "one-shot");
        disarm();
    }
}

//! Millisecond deadlines on a 32-bit wrapping counter.
//!
//! The controller clock is a `u32` millisecond count that rolls over every
//! ~49.7 days. Deadlines are computed and compared in the same fixed width:
//! a deadline has passed when the signed difference `now - deadline` is
//! non-negative. This stays correct across the rollover for any span shorter
//! than half the counter period.

/// Longest span that [`deadline_passed`] can order correctly.
pub const MAX_DEADLINE_SPAN_MS: u32 = i32::MAX as u32;

pub fn deadline_after(now_ms: u32, duration_ms: u32) -> u32 {
    now_ms.wrapping_add(duration_ms)
}

pub fn deadline_passed(now_ms: u32, deadline_ms: u32) -> bool {
    (now_ms.wrapping_sub(deadline_ms) as i32) >= 0
}

/// Milliseconds until `deadline_ms`, or 0 once it has passed.
pub fn remaining_ms(now_ms: u32, deadline_ms: u32) -> u32 {
    if deadline_passed(now_ms, deadline_ms) {
        0
    } else {
        deadline_ms.wrapping_sub(now_ms)
    }
}

/// Milliseconds elapsed since `deadline_ms`, or 0 if it is still ahead.
pub fn overdue_ms(now_ms: u32, deadline_ms: u32) -> u32 {
    if deadline_passed(now_ms, deadline_ms) {
        now_ms.wrapping_sub(deadline_ms)
    } else {
        0
    }
}

/// Truncates a monotonic millisecond count to the wrapping clock.
pub fn wrap_ms(monotonic_ms: u128) -> u32 {
    monotonic_ms as u32
}

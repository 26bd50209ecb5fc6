//! Comparisons over the 32-bit sequence space, which wraps modulo 2^32.
//! All of the state machine's sequence tests go through these helpers; a
//! naked `<` on sequence numbers is wrong as soon as a connection strays
//! near the wrap point.

/// a < b under modular arithmetic. Implemented as the sign of the wrapped
/// difference, so `a` is "less" when it sits in the half of the ring behind
/// `b`.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// a <= b under modular arithmetic.
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// a > b under modular arithmetic.
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// Whether `seq` falls within the window `[lo, lo + len)` under modular
/// arithmetic. A zero-length window contains nothing.
pub fn seq_in_window(seq: u32, lo: u32, len: u32) -> bool {
    seq.wrapping_sub(lo) < len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modular_comparison() {
        assert!(seq_lt(10, 20));
        assert!(!seq_lt(20, 10));
        assert!(seq_lt(2_000_000_000, 3_000_000_000));
        assert!(!seq_lt(3_000_000_000, 2_000_000_000));
        // Comparisons hold across the wrap point
        assert!(seq_lt(4_000_000_000, 705_032_704));
        assert!(!seq_lt(705_032_704, 4_000_000_000));

        assert!(!seq_lt(5, 5));
        assert!(seq_le(5, 5));

        assert!(seq_gt(20, 10));
        assert!(!seq_gt(5, 5));
    }

    #[test]
    fn window_membership() {
        assert!(seq_in_window(10, 10, 5));
        assert!(seq_in_window(14, 10, 5));
        assert!(!seq_in_window(15, 10, 5));
        assert!(!seq_in_window(9, 10, 5));
        assert!(!seq_in_window(10, 10, 0));

        // Windows spanning the wrap point
        assert!(seq_in_window(2, u32::MAX - 1, 10));
        assert!(seq_in_window(u32::MAX, u32::MAX - 1, 10));
        assert!(!seq_in_window(u32::MAX - 2, u32::MAX - 1, 10));
    }
}

//! Integer helpers for size classes and page rounding.

/// `floor(log2(value))`; `value` must be non-zero.
#[inline]
#[must_use]
pub const fn floor_log2(value: usize) -> u32 {
    debug_assert!(value != 0);
    usize::BITS - 1 - value.leading_zeros()
}

/// `ceil(log2(value))`, with `ceil_log2(0) == ceil_log2(1) == 0`.
#[inline]
#[must_use]
pub const fn ceil_log2(value: usize) -> u32 {
    if value <= 1 {
        0
    } else {
        usize::BITS - (value - 1).leading_zeros()
    }
}

/// Round `value` up to a multiple of `multiple` (any non-zero multiple).
/// Saturates instead of overflowing.
#[inline]
#[must_use]
pub const fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    match value % multiple {
        0 => value,
        rem => value.saturating_add(multiple - rem),
    }
}

/// Round `value` down to a multiple of `multiple`.
#[inline]
#[must_use]
pub const fn round_down(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value - value % multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_log2() {
        let cases = [
            (1, 0),
            (2, 1),
            (3, 2),
            (4, 2),
            (5, 3),
            (7, 3),
            (8, 3),
            (9, 4),
            (4096, 12),
            (4097, 13),
        ];
        for (value, expected) in cases {
            assert_eq!(ceil_log2(value), expected, "ceil_log2({value})");
        }
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(usize::MAX), usize::BITS);
    }

    #[test]
    fn test_floor_log2() {
        let cases = [(1, 0), (2, 1), (3, 1), (4, 2), (7, 2), (8, 3), (15, 3), (4096, 12)];
        for (value, expected) in cases {
            assert_eq!(floor_log2(value), expected, "floor_log2({value})");
        }
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(10, 3), 12);
        assert_eq!(round_up(10, 0), 10);
        assert_eq!(round_up(usize::MAX, 4096), usize::MAX);

        assert_eq!(round_down(4095, 4096), 0);
        assert_eq!(round_down(8191, 4096), 4096);
        assert_eq!(round_down(8192, 4096), 8192);
    }
}

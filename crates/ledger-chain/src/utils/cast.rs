//! Lossy numeric conversions used when reporting sizes and counts as metrics.

/// Convert a `usize` to `f64`, losing precision above 2^53.
#[must_use]
pub fn lossy_usize_to_f64(value: usize) -> f64 {
    lossy_u64_to_f64(u64::try_from(value).unwrap_or(u64::MAX))
}

/// Convert a `u64` to `f64` by recombining its 32-bit halves.
#[must_use]
pub fn lossy_u64_to_f64(value: u64) -> f64 {
    let high = u32::try_from(value >> 32).unwrap_or(0);
    let low = u32::try_from(value & 0xFFFF_FFFF).unwrap_or(0);
    f64::from(high) * 4_294_967_296.0 + f64::from(low)
}

/// Saturating `usize` to `u64`.
#[must_use]
pub fn usize_to_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_are_exact() {
        assert_eq!(lossy_u64_to_f64(0), 0.0);
        assert_eq!(lossy_u64_to_f64(1 << 40), 1_099_511_627_776.0);
        assert_eq!(lossy_usize_to_f64(12_345), 12_345.0);
    }

    #[test]
    fn u64_max_is_finite() {
        assert!(lossy_u64_to_f64(u64::MAX).is_finite());
        assert_eq!(usize_to_u64(usize::MAX), u64::MAX);
    }
}

//! Power-of-two alignment arithmetic.
//!
//! All alignments handled by the stack are powers of two, so checks reduce to masking with
//! `alignment - 1`. Non power-of-two values are rejected when a stage is configured and are
//! never passed to these functions.

/// Returns true if `value` is a multiple of `alignment`.
#[inline]
pub fn is_aligned(value: u64, alignment: u64) -> bool {
    debug_assert!(alignment.is_power_of_two());
    value & (alignment - 1) == 0
}

/// Returns true if the memory address is a multiple of `alignment`.
#[inline]
pub fn is_address_aligned(address: usize, alignment: usize) -> bool {
    debug_assert!(alignment.is_power_of_two());
    address & (alignment - 1) == 0
}

/// Rounds `value` down to the previous multiple of `alignment`.
#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Rounds `value` up to the next multiple of `alignment`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + (alignment - 1)) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 512, true)]
    #[case(512, 512, true)]
    #[case(513, 512, false)]
    #[case(7, 1, true)]
    #[case(4094, 4096, false)]
    fn aligned_values(#[case] value: u64, #[case] alignment: u64, #[case] expected: bool) {
        assert_eq!(is_aligned(value, alignment), expected);
    }

    #[rstest]
    #[case(0, 4096, 0, 0)]
    #[case(1, 4096, 0, 4096)]
    #[case(4096, 4096, 4096, 4096)]
    #[case(5000, 512, 4608, 5120)]
    #[case(13, 1, 13, 13)]
    fn rounding(
        #[case] value: u64,
        #[case] alignment: u64,
        #[case] down: u64,
        #[case] up: u64,
    ) {
        assert_eq!(align_down(value, alignment), down);
        assert_eq!(align_up(value, alignment), up);
    }

    #[test]
    fn addresses() {
        assert!(is_address_aligned(0x1000, 64));
        assert!(!is_address_aligned(0x1001, 2));
    }
}

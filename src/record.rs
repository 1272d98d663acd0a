//! Fixed-width unsigned integer records.

use std::fmt::Debug;

/// A fixed-width unsigned integer record.
///
/// The record is its own sort key; two records are equal iff they are
/// byte-equal. The on-disk representation is the packed little-endian
/// encoding of the integer with no header or padding, so a chunk file of
/// `n` records is exactly `n * SIZE` bytes long.
pub trait Record: bytemuck::Pod + Ord + Send + Sync + Default + Debug {
    /// Record width in bytes. Always a power of two.
    const SIZE: usize;

    /// The record value widened to `u64`, used by the radix sort passes.
    fn sort_key(self) -> u64;
}

macro_rules! impl_record {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Record for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn sort_key(self) -> u64 {
                    self as u64
                }
            }
        )*
    };
}

impl_record!(u8, u16, u32, u64);

/// Rounds `n` down to a multiple of `m`.
pub(crate) fn round_down(n: u64, m: u64) -> u64 {
    (n / m) * m
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{round_down, Record};

    #[test]
    fn test_record_sizes() {
        assert_eq!(<u8 as Record>::SIZE, 1);
        assert_eq!(<u16 as Record>::SIZE, 2);
        assert_eq!(<u32 as Record>::SIZE, 4);
        assert_eq!(<u64 as Record>::SIZE, 8);
    }

    #[test]
    fn test_sort_key_preserves_order() {
        let mut values = vec![7u32, u32::MAX, 0, 42];
        values.sort_unstable();
        let mut keys: Vec<u64> = values.iter().map(|v| v.sort_key()).collect();
        let sorted = keys.clone();
        keys.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[rstest]
    #[case(0, 4, 0)]
    #[case(3, 4, 0)]
    #[case(4, 4, 4)]
    #[case(1023, 4, 1020)]
    #[case(1024, 8, 1024)]
    fn test_round_down(#[case] n: u64, #[case] m: u64, #[case] expected: u64) {
        assert_eq!(round_down(n, m), expected);
    }
}

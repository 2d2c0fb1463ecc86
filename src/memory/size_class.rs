//! Power-of-two size classes for segregated free lists.
//!
//! Index `i` covers requests in `(2^(i-1), 2^i]`; index 0 covers exactly 1 byte.
//! The ladder tops out at [`MAX_CLASS_SIZE`]; larger requests have no class.

/// Capacity of the top size class, `2^(BITS-1)`.
pub const MAX_CLASS_SIZE: usize = 1 << (usize::BITS - 1);

/// Smallest `i` with `2^i >= size`, i.e. `ceil(log2(size))`.
///
/// # Panics
/// If `size == 0` or `size > MAX_CLASS_SIZE`.
#[inline]
#[must_use]
pub const fn index_from_size(size: usize) -> usize {
    assert!(size != 0, "size must not be zero");
    assert!(size <= MAX_CLASS_SIZE, "size exceeds the largest size class");
    (usize::BITS - (size - 1).leading_zeros()) as usize
}

/// Capacity of size class `index`, i.e. `2^index`.
///
/// # Panics
/// If `2^index` does not fit in a `usize`.
#[inline]
#[must_use]
pub const fn size_from_index(index: usize) -> usize {
    assert!(index < usize::BITS as usize, "size class index out of range");
    1 << index
}

/// Maps request sizes onto a ladder of buckets.
///
/// Implementations must be exact inverses at bucket capacities and monotonic
/// in `size`.
pub trait SizeClassPolicy {
    fn index_from_size(size: usize) -> usize;
    fn size_from_index(index: usize) -> usize;

    /// Buckets needed to cover requests up to and including `max_size`.
    fn bucket_count(max_size: usize) -> usize {
        Self::index_from_size(max_size) + 1
    }
}

/// The power-of-two ladder.
#[derive(Clone, Copy, Debug, Default)]
pub struct Log2Policy;

impl SizeClassPolicy for Log2Policy {
    #[inline]
    fn index_from_size(size: usize) -> usize {
        index_from_size(size)
    }

    #[inline]
    fn size_from_index(index: usize) -> usize {
        size_from_index(index)
    }
}

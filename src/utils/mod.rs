mod idalloc;
pub use idalloc::IdAlloc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of a resource. Barriers and native operations name resources by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ResourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Rounds `value` up to a multiple of `alignment`, which must be a power of two.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Exponent of the smallest power of two that holds `size` bytes. `size` must not be zero.
///
/// Sizes above `2^63` have no such power and map to `u32::MAX`.
pub fn size_class(size: u64) -> u32 {
    debug_assert!(size > 0);
    size.checked_next_power_of_two().map_or(u32::MAX, u64::trailing_zeros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes() {
        assert_eq!(size_class(1), 0);
        assert_eq!(size_class(2), 1);
        assert_eq!(size_class(3), 2);
        assert_eq!(size_class(4096), 12);
        assert_eq!(size_class(4097), 13);
        assert_eq!(size_class(1 << 63), 63);
        assert_eq!(size_class((1 << 63) + 1), u32::MAX);
        assert_eq!(size_class(u64::MAX), u32::MAX);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn resource_ids_are_unique() {
        assert_ne!(ResourceId::next(), ResourceId::next());
    }
}

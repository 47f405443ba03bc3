//! Alignment arithmetic shared by the allocators.

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This method is used to round request sizes up to the arena granularity,
/// backing block sizes up to [`crate::kernel::page_size`] and block addresses
/// up to the alignment the caller asked for.
#[inline]
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Bytes between `addr` and the first `aligment`-aligned address that leaves
/// at least `header_size` bytes in front of it.
///
/// ```text
/// addr                      addr + padding
///  |<--- slack --->|<- header ->|<---- user data ...
/// ```
///
/// The result is always `>= header_size`, so subtracting it from the user
/// pointer gives back `addr`.
#[inline]
pub fn padding_with_header(addr: usize, aligment: usize, header_size: usize) -> usize {
    align(addr + header_size, aligment) - addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn align_pointer_size() {
        let aligments = vec![(1..8, 8), (9..16, 16), (17..24, 24), (25..32, 32)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, mem::size_of::<usize>()));
            }
        }
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096
        let aligments = vec![(1..4096, 4096), (4097..8192, 8192)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, 4096))
            }
        }
    }

    #[test]
    fn padding_fits_header_and_aligns() {
        for addr in 0x1000..0x1040 {
            for aligment in [8, 16, 32, 64] {
                let padding = padding_with_header(addr, aligment, 16);

                assert!(padding >= 16);
                assert!(padding < 16 + aligment);
                assert_eq!((addr + padding) % aligment, 0);
            }
        }
    }
}

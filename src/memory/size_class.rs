//! Size-class resolution for the slab engine.
//!
//! Requests below [`ZONE_LIMIT`] map onto one of [`NZONES`] classes; each
//! class is served by 64 KiB zones carved into equal chunks of the class's
//! rounded size.  The mapping is a pure function of the request size and is
//! stable across calls.

use super::vm::PAGE_SIZE;

/// Max allocation handled by the slab engine; everything at or above this
/// goes to the big-allocation path.
pub(crate) const ZONE_LIMIT: usize = 16 * 1024;

/// Zone size and alignment.  Zones are aligned to their size so the owning
/// zone of any chunk is recoverable by masking the low bits.
pub(crate) const ZONE_SIZE: usize = 64 * 1024;
pub(crate) const ZONE_MASK: usize = ZONE_SIZE - 1;
pub(crate) const ZONE_PAGE_COUNT: usize = ZONE_SIZE / PAGE_SIZE;

/// "slab" — sanity sentinel in every zone header.
pub(crate) const SLAB_MAGIC: u32 = 0x736c_6162;

/// Number of size classes for `ZONE_LIMIT` = 16 KiB.  A handful of indices
/// (2, 11–14) are holes left by the band formulas; they never host zones.
pub(crate) const NZONES: usize = 72;

pub(crate) const MIN_CHUNK_SIZE: usize = 8;

/// Page-aligned requests up to this size stay in the slab engine (the zone
/// alignment rule makes power-of-two chunks self-aligned); larger
/// page-multiples go to the big path.
pub(crate) const MAX_SLAB_PAGEALIGN: usize = 2 * PAGE_SIZE;

// Magazine depth bounds: small classes get deep magazines, the largest
// classes shallow ones.  M_MAX_ROUNDS is chosen so the magazine struct
// (header + object slots) is exactly 4 KiB.
pub(crate) const M_MAX_ROUNDS: usize = 512 - 3;
pub(crate) const M_MIN_ROUNDS: usize = 16;
pub(crate) const M_ZONE_INIT_ROUNDS: usize = 64;
pub(crate) const M_ZONE_HYSTERESIS: usize = 32;

/// Max chunks pulled into the caller's magazine per zone-lock hold.
pub(crate) const CACHE_CHUNKS: usize = 32;

/// Result of [`classify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SizeClass {
    pub index: usize,
    /// Request rounded up to the class chunk size.
    pub rounded: usize,
    /// Rounding step for the band; chunk start addresses are aligned to at
    /// least this.
    pub chunking: usize,
}

/// Map an allocation size onto its class.
///
/// Bands: sizes below 16 use 8-byte chunks (two classes, index 2 unused);
/// below 256 use 16-byte chunks; then the step doubles per band (32, 64,
/// 128, 256, 512, 1024) up to `ZONE_LIMIT`.  An input that rounds up across
/// a band edge takes the destination band's first index.
///
/// Callers must route `size >= ZONE_LIMIT` to the big path first.
pub(crate) fn classify(size: usize) -> SizeClass {
    let n = size;

    // 16-byte alignment starts at 16 bytes: SIMD loads and compilers that
    // round struct sizes both assume it.  Below that, 8-byte chunks.
    if n < 16 {
        let rounded = (n + 7) & !7;
        return SizeClass {
            index: rounded / 8 - 1, // classes 0,1; class 2 unused
            rounded,
            chunking: 8,
        };
    }
    if n < 128 {
        let rounded = (n + 15) & !15;
        return SizeClass {
            index: rounded / 16 + 2, // classes 3-10, 11-15 unused
            rounded,
            chunking: 16,
        };
    }
    if n < 256 {
        let rounded = (n + 15) & !15;
        return SizeClass {
            index: rounded / 16 + 7,
            rounded,
            chunking: 16,
        };
    }
    if n < 512 {
        let rounded = (n + 31) & !31;
        return SizeClass {
            index: rounded / 32 + 15,
            rounded,
            chunking: 32,
        };
    }
    if n < 1024 {
        let rounded = (n + 63) & !63;
        return SizeClass {
            index: rounded / 64 + 23,
            rounded,
            chunking: 64,
        };
    }
    if n < 2048 {
        let rounded = (n + 127) & !127;
        return SizeClass {
            index: rounded / 128 + 31,
            rounded,
            chunking: 128,
        };
    }
    if n < 4096 {
        let rounded = (n + 255) & !255;
        return SizeClass {
            index: rounded / 256 + 39,
            rounded,
            chunking: 256,
        };
    }
    if n < 8192 {
        let rounded = (n + 511) & !511;
        return SizeClass {
            index: rounded / 512 + 47,
            rounded,
            chunking: 512,
        };
    }
    if n < 16384 {
        let rounded = (n + 1023) & !1023;
        return SizeClass {
            index: rounded / 1024 + 55,
            rounded,
            chunking: 1024,
        };
    }

    super::mpanic!("classify: unexpected byte count {n}");
}

/// Magazine depth for a class: decreases linearly from [`M_MAX_ROUNDS`] at
/// class 0 down to [`M_MIN_ROUNDS`] at the top class.
pub(crate) fn magazine_capacity(zi: usize) -> usize {
    (NZONES - zi) * (M_MAX_ROUNDS - M_MIN_ROUNDS) / NZONES + M_MIN_ROUNDS
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_classify_anchors() {
        // The worked example that pins the band formulas: 24 bytes lands in
        // class 4, rounded to 32, 16-byte chunking.
        assert_eq!(
            classify(24),
            SizeClass {
                index: 4,
                rounded: 32,
                chunking: 16
            }
        );
        assert_eq!(classify(1).index, 0);
        assert_eq!(classify(8).index, 0);
        assert_eq!(classify(9).index, 1);
        assert_eq!(classify(15).index, 1);
        assert_eq!(classify(16).index, 3);
        assert_eq!(classify(128).index, 15);
        assert_eq!(classify(4096).index, 55);
        assert_eq!(classify(16383).index, NZONES - 1);
    }

    #[test]
    fn test_classify_holes_never_used() {
        let mut used = [false; NZONES];
        for size in 1..ZONE_LIMIT {
            used[classify(size).index] = true;
        }
        assert!(!used[2], "class 2 is a hole");
        for zi in 11..=14 {
            assert!(!used[zi], "class {zi} is a hole");
        }
    }

    #[test]
    fn test_classify_invariants_exhaustive() {
        let mut prev_rounded = 0;
        for size in 1..ZONE_LIMIT {
            let sc = classify(size);
            assert!(sc.index < NZONES, "index out of range for {size}");
            assert!(sc.rounded >= size, "rounded below request for {size}");
            assert!(
                sc.rounded.is_multiple_of(sc.chunking),
                "rounded {} not a multiple of chunking {} for {size}",
                sc.rounded,
                sc.chunking
            );
            assert!(sc.rounded - size < sc.chunking, "over-rounded {size}");
            assert!(sc.rounded >= prev_rounded, "rounding not monotone at {size}");
            prev_rounded = sc.rounded;
            // Stability: same input, same answer.
            assert_eq!(classify(size), sc);
        }
    }

    #[test]
    fn test_classify_same_class_same_chunk() {
        // Two sizes with the same rounded size share a class.
        for (a, b) in [(17, 32), (100, 112), (513, 576), (9000, 9216)] {
            assert_eq!(classify(a).index, classify(b).index);
            assert_eq!(classify(a).rounded, classify(b).rounded);
        }
    }

    #[test]
    fn test_classify_chunking_bands() {
        assert_eq!(classify(7).chunking, 8);
        assert_eq!(classify(100).chunking, 16);
        assert_eq!(classify(200).chunking, 16);
        assert_eq!(classify(300).chunking, 32);
        assert_eq!(classify(700).chunking, 64);
        assert_eq!(classify(1500).chunking, 128);
        assert_eq!(classify(3000).chunking, 256);
        assert_eq!(classify(5000).chunking, 512);
        assert_eq!(classify(10_000).chunking, 1024);
    }

    #[test]
    fn test_magazine_capacity_bounds() {
        assert!(magazine_capacity(0) <= M_MAX_ROUNDS);
        assert!(magazine_capacity(0) > magazine_capacity(NZONES - 1));
        assert!(magazine_capacity(NZONES - 1) >= M_MIN_ROUNDS);
        for zi in 1..NZONES {
            assert!(
                magazine_capacity(zi) <= magazine_capacity(zi - 1),
                "capacity must not grow with class index"
            );
        }
    }
}

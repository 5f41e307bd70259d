//! Width-agnostic bitmap operators.
//!
//! The sweep routines are written once against [`SimdOps`] and
//! instantiated with whichever backing the target offers: 256-bit AVX2,
//! 128-bit NEON, or plain 64-bit words. All lanes are 64-bit; masks are
//! one bit per lane.

/// `x & (x - 1)`: clear the lowest set bit.
#[inline]
pub fn reset_lowest64(x: u64) -> u64 {
    x & x.wrapping_sub(1)
}

/// `x & (x - 1)` for 32-bit words.
#[inline]
pub fn reset_lowest32(x: u32) -> u32 {
    x & x.wrapping_sub(1)
}

/// Number of contiguous low zero bits.
#[inline]
pub fn tzcount64(x: u64) -> u32 {
    x.trailing_zeros()
}

/// Population count.
#[inline]
pub fn popcount64(x: u64) -> u32 {
    x.count_ones()
}

/// The operator surface the bitmap sweeps are written against.
///
/// `LANES` 64-bit lanes per vector. Load/store addresses must be aligned
/// to the vector width (arena bitmaps are).
pub trait SimdOps: Copy {
    const LANES: usize;

    fn zero() -> Self;
    fn ones() -> Self;
    fn bcast8(v: u8) -> Self;
    /// # Safety
    /// `ptr` must be valid for `LANES` words and vector-aligned.
    unsafe fn loada(ptr: *const u64) -> Self;
    /// # Safety
    /// `ptr` must be valid for `LANES` words and vector-aligned.
    unsafe fn storea(self, ptr: *mut u64);
    fn and(self, o: Self) -> Self;
    fn or(self, o: Self) -> Self;
    fn xor(self, o: Self) -> Self;
    /// `self & !o`
    fn andnot(self, o: Self) -> Self;
    fn shl64<const N: i32>(self) -> Self;
    /// Broadcast each odd lane over its even neighbor (identity for a
    /// single lane).
    fn shuffle64_dup_odd(self) -> Self;
    /// One bit per lane: lanes where `self == o`.
    fn eq64_mask(self, o: Self) -> u64;
    /// One bit per lane: lanes where `self != o`.
    fn neq64_mask(self, o: Self) -> u64 {
        !self.eq64_mask(o) & ((1u64 << Self::LANES) - 1)
    }
    fn extract(self, lane: usize) -> u64;

    fn all_zero(self) -> bool {
        self.eq64_mask(Self::zero()) == (1u64 << Self::LANES) - 1
    }
}

/// Scalar 64-bit backing; always available and used as the reference
/// implementation in tests.
#[derive(Copy, Clone)]
pub struct ScalarWord(pub u64);

impl SimdOps for ScalarWord {
    const LANES: usize = 1;

    fn zero() -> Self {
        ScalarWord(0)
    }
    fn ones() -> Self {
        ScalarWord(!0)
    }
    fn bcast8(v: u8) -> Self {
        ScalarWord(0x0101_0101_0101_0101u64.wrapping_mul(v as u64))
    }
    unsafe fn loada(ptr: *const u64) -> Self {
        ScalarWord(*ptr)
    }
    unsafe fn storea(self, ptr: *mut u64) {
        *ptr = self.0;
    }
    fn and(self, o: Self) -> Self {
        ScalarWord(self.0 & o.0)
    }
    fn or(self, o: Self) -> Self {
        ScalarWord(self.0 | o.0)
    }
    fn xor(self, o: Self) -> Self {
        ScalarWord(self.0 ^ o.0)
    }
    fn andnot(self, o: Self) -> Self {
        ScalarWord(self.0 & !o.0)
    }
    fn shl64<const N: i32>(self) -> Self {
        ScalarWord(self.0 << N)
    }
    fn shuffle64_dup_odd(self) -> Self {
        self
    }
    fn eq64_mask(self, o: Self) -> u64 {
        (self.0 == o.0) as u64
    }
    fn extract(self, lane: usize) -> u64 {
        debug_assert_eq!(lane, 0);
        self.0
    }
}

#[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
mod avx2 {
    use super::SimdOps;
    use std::arch::x86_64::*;

    /// 256-bit AVX2 backing (four 64-bit lanes).
    #[derive(Copy, Clone)]
    pub struct Avx2Word(__m256i);

    impl SimdOps for Avx2Word {
        const LANES: usize = 4;

        fn zero() -> Self {
            Avx2Word(unsafe { _mm256_setzero_si256() })
        }
        fn ones() -> Self {
            let z = unsafe { _mm256_setzero_si256() };
            Avx2Word(unsafe { _mm256_cmpeq_epi64(z, z) })
        }
        fn bcast8(v: u8) -> Self {
            Avx2Word(unsafe { _mm256_set1_epi8(v as i8) })
        }
        unsafe fn loada(ptr: *const u64) -> Self {
            Avx2Word(_mm256_load_si256(ptr as *const __m256i))
        }
        unsafe fn storea(self, ptr: *mut u64) {
            _mm256_store_si256(ptr as *mut __m256i, self.0)
        }
        fn and(self, o: Self) -> Self {
            Avx2Word(unsafe { _mm256_and_si256(self.0, o.0) })
        }
        fn or(self, o: Self) -> Self {
            Avx2Word(unsafe { _mm256_or_si256(self.0, o.0) })
        }
        fn xor(self, o: Self) -> Self {
            Avx2Word(unsafe { _mm256_xor_si256(self.0, o.0) })
        }
        fn andnot(self, o: Self) -> Self {
            // andnot intrinsic computes !a & b
            Avx2Word(unsafe { _mm256_andnot_si256(o.0, self.0) })
        }
        fn shl64<const N: i32>(self) -> Self {
            Avx2Word(unsafe { _mm256_slli_epi64::<N>(self.0) })
        }
        fn shuffle64_dup_odd(self) -> Self {
            Avx2Word(unsafe {
                _mm256_castpd_si256(_mm256_permute_pd::<0xF>(_mm256_castsi256_pd(self.0)))
            })
        }
        fn eq64_mask(self, o: Self) -> u64 {
            unsafe {
                _mm256_movemask_pd(_mm256_castsi256_pd(_mm256_cmpeq_epi64(self.0, o.0))) as u64
            }
        }
        fn extract(self, lane: usize) -> u64 {
            unsafe {
                match lane {
                    0 => _mm256_extract_epi64::<0>(self.0) as u64,
                    1 => _mm256_extract_epi64::<1>(self.0) as u64,
                    2 => _mm256_extract_epi64::<2>(self.0) as u64,
                    _ => _mm256_extract_epi64::<3>(self.0) as u64,
                }
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use super::SimdOps;
    use std::arch::aarch64::*;

    /// 128-bit NEON backing (two 64-bit lanes).
    #[derive(Copy, Clone)]
    pub struct NeonWord(uint64x2_t);

    impl SimdOps for NeonWord {
        const LANES: usize = 2;

        fn zero() -> Self {
            NeonWord(unsafe { vdupq_n_u64(0) })
        }
        fn ones() -> Self {
            NeonWord(unsafe { vdupq_n_u64(!0) })
        }
        fn bcast8(v: u8) -> Self {
            NeonWord(unsafe { vreinterpretq_u64_u8(vdupq_n_u8(v)) })
        }
        unsafe fn loada(ptr: *const u64) -> Self {
            NeonWord(vld1q_u64(ptr))
        }
        unsafe fn storea(self, ptr: *mut u64) {
            vst1q_u64(ptr, self.0)
        }
        fn and(self, o: Self) -> Self {
            NeonWord(unsafe { vandq_u64(self.0, o.0) })
        }
        fn or(self, o: Self) -> Self {
            NeonWord(unsafe { vorrq_u64(self.0, o.0) })
        }
        fn xor(self, o: Self) -> Self {
            NeonWord(unsafe { veorq_u64(self.0, o.0) })
        }
        fn andnot(self, o: Self) -> Self {
            NeonWord(unsafe { vbicq_u64(self.0, o.0) })
        }
        fn shl64<const N: i32>(self) -> Self {
            NeonWord(unsafe { vshlq_n_u64::<N>(self.0) })
        }
        fn shuffle64_dup_odd(self) -> Self {
            NeonWord(unsafe { vdupq_laneq_u64::<1>(self.0) })
        }
        fn eq64_mask(self, o: Self) -> u64 {
            unsafe {
                let m = vceqq_u64(self.0, o.0);
                (vgetq_lane_u64::<0>(m) & 1) | ((vgetq_lane_u64::<1>(m) & 1) << 1)
            }
        }
        fn extract(self, lane: usize) -> u64 {
            unsafe {
                match lane {
                    0 => vgetq_lane_u64::<0>(self.0),
                    _ => vgetq_lane_u64::<1>(self.0),
                }
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))] {
        pub use avx2::Avx2Word;
        /// The widest backing the target offers.
        pub type DefaultSimd = Avx2Word;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use neon::NeonWord;
        /// The widest backing the target offers.
        pub type DefaultSimd = NeonWord;
    } else {
        /// The widest backing the target offers.
        pub type DefaultSimd = ScalarWord;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words() -> [u64; 8] {
        [
            0,
            !0,
            0x5555_5555_5555_5555,
            0xDEAD_BEEF_0123_4567,
            1,
            1 << 63,
            0x0F0F_0F0F_F0F0_F0F0,
            42,
        ]
    }

    #[repr(align(32))]
    struct Aligned([u64; 8]);

    fn check_backend<S: SimdOps>() {
        let src = Aligned(words());
        let mut dst = Aligned([0; 8]);
        let mut i = 0;
        while i + S::LANES <= 8 {
            let v = unsafe { S::loada(src.0.as_ptr().add(i)) };
            let w = unsafe { S::loada(src.0.as_ptr().add(8 - S::LANES)) };
            for l in 0..S::LANES {
                let a = src.0[i + l];
                let b = src.0[8 - S::LANES + l];
                assert_eq!(v.extract(l), a);
                assert_eq!(v.and(w).extract(l), a & b);
                assert_eq!(v.or(w).extract(l), a | b);
                assert_eq!(v.xor(w).extract(l), a ^ b);
                assert_eq!(v.andnot(w).extract(l), a & !b);
                assert_eq!(v.shl64::<1>().extract(l), a << 1);
                assert_eq!(S::ones().extract(l), !0);
                assert_eq!(S::bcast8(0x55).extract(l), 0x5555_5555_5555_5555);
            }
            let eq = v.eq64_mask(w);
            let neq = v.neq64_mask(w);
            assert_eq!(eq ^ neq, (1u64 << S::LANES) - 1);
            unsafe { v.storea(dst.0.as_mut_ptr().add(i)) };
            i += S::LANES;
        }
        assert_eq!(&dst.0[..i], &src.0[..i]);
        assert!(S::zero().all_zero());
        assert!(!S::ones().all_zero());
    }

    #[test]
    fn scalar_backend() {
        check_backend::<ScalarWord>();
    }

    #[test]
    fn default_backend_matches_scalar() {
        check_backend::<DefaultSimd>();
    }
}

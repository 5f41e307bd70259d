//! Geometry and pacing constants shared by the whole collector.

/// log2 of the number of bytes in an arena
pub const LOG_BYTES_IN_ARENA: usize = 16;
/// The number of bytes in an arena. Arenas are allocated at this alignment,
/// so masking a pointer with `!ARENA_OMASK` recovers its arena header.
pub const ARENA_SIZE: usize = 1 << LOG_BYTES_IN_ARENA;
/// Offset-within-arena mask.
pub const ARENA_OMASK: usize = ARENA_SIZE - 1;

/// The smallest slot size in any arena (a small-string cell).
pub const MIN_SLOT_SIZE: usize = 16;
/// Number of 64-bit words in a full-size arena bitmap, sized for the
/// smallest slot. Kinds with larger slots use a leading prefix.
pub const BITMAP_WORDS: usize = ARENA_SIZE / MIN_SLOT_SIZE / 64;

/// Byte budget accounted per incremental step unit.
pub const GCSTEPSIZE: usize = 1024;
/// Arenas swept per step in the primary sweep states.
pub const GCSWEEPMAX: u32 = 40;
/// Cost accounted for one bounded sweep slice.
pub const GCSWEEPCOST: usize = 10;
/// Cost accounted for one finalizer invocation.
pub const GCFINALIZECOST: usize = 100;

/// Sentinel cost that stalls the current step entirely (JIT trace live,
/// allocation threshold parked).
pub const GCMAXCOST: usize = usize::MAX / 2;

/// Blob pages whose live usage after mark falls below this are tagged for
/// move-on-next-mark compaction.
pub const BLOB_REAP_THRESHOLD: usize = ARENA_SIZE / 8;
/// Blobs larger than this get a dedicated huge page.
pub const BLOB_HUGE_THRESHOLD: usize = 3 * ARENA_SIZE / 4;
/// Strings longer than this leave the medium arenas for the huge list.
pub const HUGE_STR_THRESHOLD: usize = ARENA_SIZE / 4;
/// Strings at most this long are interned into the small-string arenas.
pub const SMALL_STR_MAX: usize = 15;

/// Initial/minimum size of the primary string table (entries).
pub const MIN_STRTAB: usize = 256;
/// Maximum number of secondary string-table arenas.
pub const STRTAB_SECONDARY_MAX: usize = 1 << 19;

/// Minimum element count when growing a raw vector.
pub const MIN_VECSZ: usize = 8;
/// Largest array part a table may carry.
pub const MAX_ASIZE: usize = (1 << 27) - 1;

// -- GC object flag byte --------------------------------------------------
// Two alternating black bits, a gray bit, weak-table bits, a finalized
// bit and two size-class bits for colocated payloads. SFIXED aliases a
// size-class bit; it is only ever set on threads, which are never
// colocated.

/// First black bit.
pub const GC_BLACK0: u8 = 0x01;
/// Second black bit.
pub const GC_BLACK1: u8 = 0x02;
/// Both black bits.
pub const GC_BLACKS: u8 = GC_BLACK0 | GC_BLACK1;
/// Gray flag (object-list kinds; strings while sweeping).
pub const GC_GRAY: u8 = 0x04;
/// All color bits.
pub const GC_COLORS: u8 = GC_BLACKS | GC_GRAY;
/// Weak-keyed table.
pub const GC_WEAKKEY: u8 = 0x08;
/// Weak-valued table.
pub const GC_WEAKVAL: u8 = 0x10;
/// Both weak bits.
pub const GC_WEAK: u8 = GC_WEAKKEY | GC_WEAKVAL;
/// Userdata already finalized. For cdata this bit means "finalizer
/// registered" instead.
pub const GC_FINALIZED: u8 = 0x20;
/// Cdata with a pending finalizer (alias, disjoint kinds).
pub const GC_CDATA_FIN: u8 = GC_FINALIZED;
/// Super-fixed: immune to every sweep, including shutdown (main thread).
pub const GC_SFIXED: u8 = 0x40;
/// Size-class bits for colocated payloads (1..=4 slots).
pub const GC_SIZE_BITS: u8 = 0xC0;

/// Encode a colocated allocation of `n` slots (1..=4) into flag bits.
pub const fn size2flags(n: usize) -> u8 {
    ((n - 1) as u8) << 6
}

/// Decode the slot count of a colocated allocation from flag bits.
pub const fn flags2size(flags: u8) -> usize {
    ((flags >> 6) as usize) + 1
}

/// Bitmap mask covering all slots of a colocated allocation headed at
/// bit `j` of its word. The run never crosses a word boundary: the
/// coalescing allocator finds runs inside a single free word.
pub fn flags2bitmask(flags: u8, j: u32) -> u64 {
    ((1u64 << flags2size(flags)) - 1) << j
}

// -- Arena header flag byte -----------------------------------------------

/// Sweep parity bit A.
pub const ARENA_SWEEP0: u8 = 0x01;
/// Sweep parity bit B.
pub const ARENA_SWEEP1: u8 = 0x02;
/// Both sweep parity bits; exactly one is ever set.
pub const ARENA_SWEEPS: u8 = ARENA_SWEEP0 | ARENA_SWEEP1;
/// Arena is linked on its kind's freelist.
pub const ARENA_ON_FREE_LIST: u8 = 0x04;
/// Small-string arena that filled up mid-cycle; its dead count is
/// recovered by popcount during sweep.
pub const ARENA_SWEEP_DIRTY: u8 = 0x08;

// -- Blob page flags ------------------------------------------------------

/// Blob page owns a dedicated huge allocation.
pub const BLOB_HUGE: u32 = 0x1;
/// Blob page is scheduled for move-on-next-mark compaction.
pub const BLOB_REAP: u32 = 0x2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_roundtrip() {
        for n in 1..=4 {
            assert_eq!(flags2size(size2flags(n)), n);
        }
        assert_eq!(size2flags(1), 0);
        assert_eq!(size2flags(4), GC_SIZE_BITS);
    }

    #[test]
    fn coalesced_bitmask() {
        assert_eq!(flags2bitmask(size2flags(2), 0), 0b11);
        assert_eq!(flags2bitmask(size2flags(3), 4), 0b111 << 4);
    }
}

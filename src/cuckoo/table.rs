use super::{masked_tag, SLOTS_PER_BUCKET};
use rand::Rng;
#[cfg(feature = "serde")]
use serde_crate::{Deserialize, Serialize};
use std::mem;

/// Outcome of offering a fingerprint to a single bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketInsert {
    /// The fingerprint was stored in a free slot.
    Stored,
    /// The bucket is full and eviction was not requested.
    Rejected,
    /// The fingerprint replaced a randomly chosen slot; the caller must relocate the previous
    /// occupant.
    Evicted(u64),
}

/// A table of buckets, each encoding up to four fingerprints at a width that depends on how many
/// slots are occupied.
///
/// A bucket is a single word of `4 * TAG_BITS` tag bits plus three flag bits at fixed positions.
/// The flag pattern selects one of five occupancy states; in states below four the unused slot
/// space is absorbed to lengthen the stored tags, so rare low-occupancy buckets keep longer,
/// more discriminating fingerprints. The fully occupied state stores four raw `TAG_BITS`-bit
/// lanes, and keeps lanes 1 through 3 sorted in descending order so that its bit pattern can
/// never alias one of the flagged states.
///
/// Implemented by [`TagTable8`], [`TagTable12`], and [`TagTable16`]; the width is chosen once,
/// through the filter's table type parameter.
pub trait TagTable {
    /// Number of bits of a full-width (four-slot) fingerprint.
    const TAG_BITS: u32;

    /// Constructs a table of `num_buckets` empty buckets. `num_buckets` must be a power of two.
    fn with_buckets(num_buckets: u64) -> Self;

    /// Returns the number of buckets.
    fn num_buckets(&self) -> u64;

    /// Returns the size of the bucket array in bytes.
    fn size_in_bytes(&self) -> usize;

    /// Returns the total number of fingerprint slots.
    fn size_in_tags(&self) -> u64 {
        self.num_buckets() * SLOTS_PER_BUCKET as u64
    }

    /// Resets every bucket to the empty state.
    fn clear(&mut self);

    /// Checks whether `unmasked_tag` possibly matches a fingerprint in bucket `index`. The tag
    /// is tested at every width at least as wide as the bucket's current encoding, so a
    /// fingerprint that was truncated by past occupancy changes still matches.
    fn find_tag(&self, index: u64, unmasked_tag: u64) -> bool;

    /// Offers `unmasked_tag` to bucket `index`, masked to whatever width the bucket's next state
    /// stores. A bucket below four slots always accepts; a full bucket rejects unless `kickout`
    /// is set, in which case the tag replaces a uniformly random slot and the evicted occupant
    /// is returned for relocation.
    fn insert_tag<R: Rng>(
        &mut self,
        index: u64,
        unmasked_tag: u64,
        kickout: bool,
        rng: &mut R,
    ) -> BucketInsert;

    /// Records in `best_index` and `best_width` the widest width at which `unmasked_tag`
    /// matches a fingerprint of bucket `index`, keeping whatever previous match is at least as
    /// wide. `best_width` of zero means no match so far.
    fn find_widest_match(
        &self,
        index: u64,
        unmasked_tag: u64,
        best_index: &mut u64,
        best_width: &mut u32,
    );

    /// Removes the fingerprint equal to `masked_tag` from bucket `index` and re-encodes the
    /// bucket one state down, zero-extending the surviving fingerprints to the wider width.
    /// `masked_tag` must already be masked to the width reported by
    /// [`find_widest_match`](TagTable::find_widest_match).
    ///
    /// # Panics
    ///
    /// Panics if the bucket is empty or holds no matching fingerprint.
    fn delete_tag(&mut self, index: u64, masked_tag: u64);

    /// Adds per-occupancy bucket counts to `counts`; `counts[n]` receives the number of buckets
    /// currently holding `n` fingerprints.
    fn count_occupancy(&self, counts: &mut [u64; 5]);
}

// Portable bit gather: compact the bits of `value` selected by `mask` into a contiguous low
// field. Inverse of `pdep`.
fn pext(value: u64, mut mask: u64) -> u64 {
    let mut out = 0;
    let mut offset = 0;
    while mask != 0 {
        let bit = mask & mask.wrapping_neg();
        if value & bit != 0 {
            out |= 1u64 << offset;
        }
        offset += 1;
        mask &= mask - 1;
    }
    out
}

// Portable bit scatter: spread the low bits of `value` onto the bit positions selected by
// `mask`.
fn pdep(value: u64, mut mask: u64) -> u64 {
    let mut out = 0;
    let mut offset = 0;
    while mask != 0 {
        let bit = mask & mask.wrapping_neg();
        if value & (1u64 << offset) != 0 {
            out |= bit;
        }
        offset += 1;
        mask &= mask - 1;
    }
    out
}

// SWAR equality scan: true when any lane of `lanes` equals `value`. `ones` has the lowest bit of
// every lane set, `highs` the highest.
#[inline]
fn has_value(lanes: u64, value: u64, ones: u64, highs: u64) -> bool {
    let x = lanes ^ ones.wrapping_mul(value);
    x.wrapping_sub(ones) & !x & highs != 0
}

#[inline]
fn lane(word: u64, index: u64, width: u32) -> u64 {
    (word >> (index * u64::from(width))) & ((1u64 << width) - 1)
}

// Lanes 1..=3 stay sorted in descending order; `keep_mask` preserves lane 0 and any bits above
// the four lanes.
fn sort_upper_lanes(word: u64, width: u32, keep_mask: u64) -> u64 {
    let mut tag1 = lane(word, 1, width);
    let mut tag2 = lane(word, 2, width);
    let mut tag3 = lane(word, 3, width);
    if tag3 > tag2 {
        mem::swap(&mut tag3, &mut tag2);
    }
    if tag3 > tag1 {
        mem::swap(&mut tag3, &mut tag1);
    }
    if tag2 > tag1 {
        mem::swap(&mut tag2, &mut tag1);
    }
    let width = u64::from(width);
    (word & keep_mask) | (tag3 << (3 * width)) | (tag2 << (2 * width)) | (tag1 << width)
}

const FLAG_MASK_8: u32 = 0x8080_8000;
const TAG_MASK_8: u32 = !FLAG_MASK_8;
const ZERO_SLOT_8: u32 = 0x0080_0000;
const ONE_SLOT_8: u32 = 0x8000_0000;
const TWO_SLOT_8: u32 = 0x8000_8000;
const THREE_SLOT_8: u32 = 0x8080_0000;

const ONES_29: u64 = 0x0000_0001;
const HIGHS_29: u64 = 0x1000_0000;
const ONES_14: u64 = 0x0000_4001;
const HIGHS_14: u64 = 0x0800_2000;
const ONES_9: u64 = 0x0004_0201;
const HIGHS_9: u64 = 0x0402_0100;
const ONES_8: u64 = 0x0101_0101;
const HIGHS_8: u64 = 0x8080_8080;

/// Bucket table for 8-bit full-width fingerprints: 4-byte buckets storing tags of 29, 14, 9, or
/// 8 bits depending on occupancy.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
pub struct TagTable8 {
    buckets: Vec<u32>,
}

impl TagTable for TagTable8 {
    const TAG_BITS: u32 = 8;

    fn with_buckets(num_buckets: u64) -> Self {
        assert!(num_buckets.is_power_of_two());
        TagTable8 {
            buckets: vec![ZERO_SLOT_8; num_buckets as usize],
        }
    }

    fn num_buckets(&self) -> u64 {
        self.buckets.len() as u64
    }

    fn size_in_bytes(&self) -> usize {
        self.buckets.len() * 4
    }

    fn clear(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = ZERO_SLOT_8;
        }
    }

    fn find_tag(&self, index: u64, unmasked_tag: u64) -> bool {
        let bucket = u64::from(self.buckets[index as usize]);
        match bucket as u32 & FLAG_MASK_8 {
            ZERO_SLOT_8 => false,
            ONE_SLOT_8 => {
                let tags = pext(bucket, u64::from(TAG_MASK_8));
                has_value(tags, masked_tag(unmasked_tag, 29), ONES_29, HIGHS_29)
                    || has_value(tags, masked_tag(unmasked_tag, 14), ONES_29, HIGHS_29)
                    || has_value(tags, masked_tag(unmasked_tag, 9), ONES_29, HIGHS_29)
                    || has_value(tags, masked_tag(unmasked_tag, 8), ONES_29, HIGHS_29)
            }
            TWO_SLOT_8 => {
                let tags = pext(bucket, u64::from(TAG_MASK_8));
                has_value(tags, masked_tag(unmasked_tag, 14), ONES_14, HIGHS_14)
                    || has_value(tags, masked_tag(unmasked_tag, 9), ONES_14, HIGHS_14)
                    || has_value(tags, masked_tag(unmasked_tag, 8), ONES_14, HIGHS_14)
            }
            THREE_SLOT_8 => {
                let tags = pext(bucket, u64::from(TAG_MASK_8));
                has_value(tags, masked_tag(unmasked_tag, 9), ONES_9, HIGHS_9)
                    || has_value(tags, masked_tag(unmasked_tag, 8), ONES_9, HIGHS_9)
            }
            _ => has_value(bucket, masked_tag(unmasked_tag, 8), ONES_8, HIGHS_8),
        }
    }

    fn insert_tag<R: Rng>(
        &mut self,
        index: u64,
        unmasked_tag: u64,
        kickout: bool,
        rng: &mut R,
    ) -> BucketInsert {
        let bucket = u64::from(self.buckets[index as usize]);
        match bucket as u32 & FLAG_MASK_8 {
            ZERO_SLOT_8 => {
                self.buckets[index as usize] =
                    pdep(unmasked_tag, u64::from(TAG_MASK_8)) as u32 | ONE_SLOT_8;
                BucketInsert::Stored
            }
            ONE_SLOT_8 => {
                // resident 29-bit tag truncates to the low 14 bits of the bucket
                let tags = pext(bucket, 0x0000_3fff) | masked_tag(unmasked_tag, 14) << 14;
                self.buckets[index as usize] =
                    pdep(tags, u64::from(TAG_MASK_8)) as u32 | TWO_SLOT_8;
                BucketInsert::Stored
            }
            TWO_SLOT_8 => {
                // low 9 bits of each resident 14-bit tag
                let tags = pext(bucket, 0x017f_41ff) | masked_tag(unmasked_tag, 9) << 18;
                self.buckets[index as usize] =
                    pdep(tags, u64::from(TAG_MASK_8)) as u32 | THREE_SLOT_8;
                BucketInsert::Stored
            }
            THREE_SLOT_8 => {
                // low 8 bits of each resident 9-bit tag
                let tags = pext(bucket, 0x0f7b_7eff) | masked_tag(unmasked_tag, 8) << 24;
                self.buckets[index as usize] = sort_upper_lanes(tags, 8, 0x0000_00ff) as u32;
                BucketInsert::Stored
            }
            _ => {
                if !kickout {
                    return BucketInsert::Rejected;
                }
                let slot = rng.gen_range(0, SLOTS_PER_BUCKET) as u64;
                let evicted = lane(bucket, slot, 8);
                let updated =
                    (bucket & !(0xffu64 << (slot * 8))) | masked_tag(unmasked_tag, 8) << (slot * 8);
                self.buckets[index as usize] = sort_upper_lanes(updated, 8, 0x0000_00ff) as u32;
                BucketInsert::Evicted(evicted)
            }
        }
    }

    fn find_widest_match(
        &self,
        index: u64,
        unmasked_tag: u64,
        best_index: &mut u64,
        best_width: &mut u32,
    ) {
        let bucket = u64::from(self.buckets[index as usize]);
        let (tags, widths, ones, highs): (u64, &[u32], u64, u64) = match bucket as u32 & FLAG_MASK_8
        {
            ZERO_SLOT_8 => return,
            ONE_SLOT_8 => (
                pext(bucket, u64::from(TAG_MASK_8)),
                &[29, 14, 9, 8],
                ONES_29,
                HIGHS_29,
            ),
            TWO_SLOT_8 => (
                pext(bucket, u64::from(TAG_MASK_8)),
                &[14, 9, 8],
                ONES_14,
                HIGHS_14,
            ),
            THREE_SLOT_8 => (
                pext(bucket, u64::from(TAG_MASK_8)),
                &[9, 8],
                ONES_9,
                HIGHS_9,
            ),
            _ => (bucket, &[8], ONES_8, HIGHS_8),
        };
        for &width in widths {
            if *best_width >= width {
                return;
            }
            if has_value(tags, masked_tag(unmasked_tag, width), ones, highs) {
                *best_index = index;
                *best_width = width;
                return;
            }
        }
    }

    fn delete_tag(&mut self, index: u64, masked_tag: u64) {
        let bucket = u64::from(self.buckets[index as usize]);
        match bucket as u32 & FLAG_MASK_8 {
            ZERO_SLOT_8 => unreachable!("delete from an empty bucket"),
            ONE_SLOT_8 => self.buckets[index as usize] = ZERO_SLOT_8,
            TWO_SLOT_8 => {
                const KEEP: [u64; 2] = [0x3f7f_4000, 0x0000_3fff];
                let tags = pext(bucket, u64::from(TAG_MASK_8));
                let slot = (0..2)
                    .find(|&slot| lane(tags, slot, 14) == masked_tag)
                    .expect("tag not present in bucket");
                self.buckets[index as usize] =
                    pdep(pext(bucket, KEEP[slot as usize]), u64::from(TAG_MASK_8)) as u32
                        | ONE_SLOT_8;
            }
            THREE_SLOT_8 => {
                const KEEP: [u64; 3] = [0x1f7f_7e00, 0x1f78_01ff, 0x0007_7fff];
                let tags = pext(bucket, u64::from(TAG_MASK_8));
                let slot = (0..3)
                    .find(|&slot| lane(tags, slot, 9) == masked_tag)
                    .expect("tag not present in bucket");
                self.buckets[index as usize] =
                    pdep(pext(bucket, KEEP[slot as usize]), 0x017f_41ff) as u32 | TWO_SLOT_8;
            }
            _ => {
                const KEEP: [u64; 4] = [0xffff_ff00, 0xffff_00ff, 0xff00_ffff, 0x00ff_ffff];
                let slot = (0..4)
                    .find(|&slot| lane(bucket, slot, 8) == masked_tag)
                    .expect("tag not present in bucket");
                self.buckets[index as usize] =
                    pdep(pext(bucket, KEEP[slot as usize]), 0x0f7b_7eff) as u32 | THREE_SLOT_8;
            }
        }
    }

    fn count_occupancy(&self, counts: &mut [u64; 5]) {
        for &bucket in &self.buckets {
            let state = match bucket & FLAG_MASK_8 {
                ZERO_SLOT_8 => 0,
                ONE_SLOT_8 => 1,
                TWO_SLOT_8 => 2,
                THREE_SLOT_8 => 3,
                _ => 4,
            };
            counts[state] += 1;
        }
    }
}

const FLAG_MASK_12: u64 = 0x0000_8008_0080_0000;
const TAG_MASK_12: u64 = 0x0000_7ff7_ff7f_ffff;
const ZERO_SLOT_12: u64 = 0x0000_0008_0000_0000;
const ONE_SLOT_12: u64 = 0x0000_8000_0000_0000;
const TWO_SLOT_12: u64 = 0x0000_8000_0080_0000;
const THREE_SLOT_12: u64 = 0x0000_8008_0000_0000;
// leading bytes of the following bucket, carried through every 8-byte load
const SCRATCH_MASK_12: u64 = 0xffff_0000_0000_0000;
const BYTES_PER_BUCKET_12: usize = 6;

const ONES_45: u64 = 0x0000_0000_0001;
const HIGHS_45: u64 = 0x1000_0000_0000;
const ONES_22: u64 = 0x0000_0040_0001;
const HIGHS_22: u64 = 0x0800_0020_0000;
const ONES_15: u64 = 0x0000_4000_8001;
const HIGHS_15: u64 = 0x1000_2000_4000;
const ONES_12: u64 = 0x0010_0100_1001;
const HIGHS_12: u64 = 0x8008_0080_0800;

/// Bucket table for 12-bit full-width fingerprints: 6-byte buckets storing tags of 45, 22, 15,
/// or 12 bits depending on occupancy.
///
/// Buckets straddle the natural word sizes, so every access loads 8 bytes and preserves the two
/// trailing bytes — the start of the next bucket — unchanged. The backing store carries two
/// bytes of padding past the last bucket.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
pub struct TagTable12 {
    buckets: Vec<u8>,
    num_buckets: u64,
}

impl TagTable12 {
    #[inline]
    fn load(&self, index: u64) -> u64 {
        let offset = index as usize * BYTES_PER_BUCKET_12;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buckets[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    #[inline]
    fn store(&mut self, index: u64, bucket: u64) {
        let offset = index as usize * BYTES_PER_BUCKET_12;
        self.buckets[offset..offset + 8].copy_from_slice(&bucket.to_le_bytes());
    }
}

impl TagTable for TagTable12 {
    const TAG_BITS: u32 = 12;

    fn with_buckets(num_buckets: u64) -> Self {
        assert!(num_buckets.is_power_of_two());
        let mut table = TagTable12 {
            buckets: vec![0; num_buckets as usize * BYTES_PER_BUCKET_12 + 2],
            num_buckets,
        };
        table.clear();
        table
    }

    fn num_buckets(&self) -> u64 {
        self.num_buckets
    }

    fn size_in_bytes(&self) -> usize {
        self.num_buckets as usize * BYTES_PER_BUCKET_12
    }

    fn clear(&mut self) {
        let empty = ZERO_SLOT_12.to_le_bytes();
        for index in 0..self.num_buckets as usize {
            let offset = index * BYTES_PER_BUCKET_12;
            self.buckets[offset..offset + BYTES_PER_BUCKET_12]
                .copy_from_slice(&empty[..BYTES_PER_BUCKET_12]);
        }
    }

    fn find_tag(&self, index: u64, unmasked_tag: u64) -> bool {
        let bucket = self.load(index);
        match bucket & FLAG_MASK_12 {
            ZERO_SLOT_12 => false,
            ONE_SLOT_12 => {
                let tags = pext(bucket, TAG_MASK_12);
                has_value(tags, masked_tag(unmasked_tag, 45), ONES_45, HIGHS_45)
                    || has_value(tags, masked_tag(unmasked_tag, 22), ONES_45, HIGHS_45)
                    || has_value(tags, masked_tag(unmasked_tag, 15), ONES_45, HIGHS_45)
                    || has_value(tags, masked_tag(unmasked_tag, 12), ONES_45, HIGHS_45)
            }
            TWO_SLOT_12 => {
                let tags = pext(bucket, TAG_MASK_12);
                has_value(tags, masked_tag(unmasked_tag, 22), ONES_22, HIGHS_22)
                    || has_value(tags, masked_tag(unmasked_tag, 15), ONES_22, HIGHS_22)
                    || has_value(tags, masked_tag(unmasked_tag, 12), ONES_22, HIGHS_22)
            }
            THREE_SLOT_12 => {
                let tags = pext(bucket, TAG_MASK_12);
                has_value(tags, masked_tag(unmasked_tag, 15), ONES_15, HIGHS_15)
                    || has_value(tags, masked_tag(unmasked_tag, 12), ONES_15, HIGHS_15)
            }
            _ => has_value(bucket, masked_tag(unmasked_tag, 12), ONES_12, HIGHS_12),
        }
    }

    fn insert_tag<R: Rng>(
        &mut self,
        index: u64,
        unmasked_tag: u64,
        kickout: bool,
        rng: &mut R,
    ) -> BucketInsert {
        let bucket = self.load(index);
        match bucket & FLAG_MASK_12 {
            ZERO_SLOT_12 => {
                let scratch = pext(bucket, SCRATCH_MASK_12);
                let tags = scratch << 45 | masked_tag(unmasked_tag, 45);
                self.store(index, pdep(tags, SCRATCH_MASK_12 | TAG_MASK_12) | ONE_SLOT_12);
                BucketInsert::Stored
            }
            ONE_SLOT_12 => {
                // resident tag truncated to 22 bits, plus the scratch bytes
                let tags =
                    pext(bucket, 0xffff_0000_003f_ffff) << 22 | masked_tag(unmasked_tag, 22);
                self.store(index, pdep(tags, 0xffff_3ff7_ff7f_ffff) | TWO_SLOT_12);
                BucketInsert::Stored
            }
            TWO_SLOT_12 => {
                // low 15 bits of each resident 22-bit tag, plus the scratch bytes
                let tags =
                    pext(bucket, 0xffff_0077_ff40_7fff) << 15 | masked_tag(unmasked_tag, 15);
                self.store(index, pdep(tags, SCRATCH_MASK_12 | TAG_MASK_12) | THREE_SLOT_12);
                BucketInsert::Stored
            }
            THREE_SLOT_12 => {
                // low 12 bits of each resident 15-bit tag, plus the scratch bytes
                let tags =
                    pext(bucket, 0xffff_0ff7_8f7f_8fff) << 12 | masked_tag(unmasked_tag, 12);
                self.store(index, sort_upper_lanes(tags, 12, 0xffff_0000_0000_0fff));
                BucketInsert::Stored
            }
            _ => {
                if !kickout {
                    return BucketInsert::Rejected;
                }
                let slot = rng.gen_range(0, SLOTS_PER_BUCKET) as u64;
                let evicted = lane(bucket, slot, 12);
                let updated = (bucket & !(0xfffu64 << (slot * 12)))
                    | masked_tag(unmasked_tag, 12) << (slot * 12);
                self.store(index, sort_upper_lanes(updated, 12, 0xffff_0000_0000_0fff));
                BucketInsert::Evicted(evicted)
            }
        }
    }

    fn find_widest_match(
        &self,
        index: u64,
        unmasked_tag: u64,
        best_index: &mut u64,
        best_width: &mut u32,
    ) {
        let bucket = self.load(index);
        let (tags, widths, ones, highs): (u64, &[u32], u64, u64) = match bucket & FLAG_MASK_12 {
            ZERO_SLOT_12 => return,
            ONE_SLOT_12 => (
                pext(bucket, TAG_MASK_12),
                &[45, 22, 15, 12],
                ONES_45,
                HIGHS_45,
            ),
            TWO_SLOT_12 => (pext(bucket, TAG_MASK_12), &[22, 15, 12], ONES_22, HIGHS_22),
            THREE_SLOT_12 => (pext(bucket, TAG_MASK_12), &[15, 12], ONES_15, HIGHS_15),
            _ => (bucket, &[12], ONES_12, HIGHS_12),
        };
        for &width in widths {
            if *best_width >= width {
                return;
            }
            if has_value(tags, masked_tag(unmasked_tag, width), ones, highs) {
                *best_index = index;
                *best_width = width;
                return;
            }
        }
    }

    fn delete_tag(&mut self, index: u64, masked_tag: u64) {
        let bucket = self.load(index);
        match bucket & FLAG_MASK_12 {
            ZERO_SLOT_12 => unreachable!("delete from an empty bucket"),
            ONE_SLOT_12 => self.store(index, (bucket & SCRATCH_MASK_12) | ZERO_SLOT_12),
            TWO_SLOT_12 => {
                const KEEP: [u64; 2] = [0xffff_3ff7_ff40_0000, 0xffff_0000_003f_ffff];
                let tags = pext(bucket, TAG_MASK_12);
                let slot = (0..2)
                    .find(|&slot| lane(tags, slot, 22) == masked_tag)
                    .expect("tag not present in bucket");
                self.store(
                    index,
                    pdep(pext(bucket, KEEP[slot as usize]), 0xffff_0000_003f_ffff) | ONE_SLOT_12,
                );
            }
            THREE_SLOT_12 => {
                const KEEP: [u64; 3] = [
                    0xffff_7ff7_ff7f_8000,
                    0xffff_7ff7_8000_7fff,
                    0xffff_0000_7f7f_ffff,
                ];
                let tags = pext(bucket, TAG_MASK_12);
                let slot = (0..3)
                    .find(|&slot| lane(tags, slot, 15) == masked_tag)
                    .expect("tag not present in bucket");
                self.store(
                    index,
                    pdep(pext(bucket, KEEP[slot as usize]), 0xffff_0077_ff40_7fff) | TWO_SLOT_12,
                );
            }
            _ => {
                const KEEP: [u64; 4] = [
                    0xffff_ffff_ffff_f000,
                    0xffff_ffff_ff00_0fff,
                    0xffff_fff0_00ff_ffff,
                    0xffff_000f_ffff_ffff,
                ];
                let slot = (0..4)
                    .find(|&slot| lane(bucket, slot, 12) == masked_tag)
                    .expect("tag not present in bucket");
                self.store(
                    index,
                    pdep(pext(bucket, KEEP[slot as usize]), 0xffff_0ff7_8f7f_8fff) | THREE_SLOT_12,
                );
            }
        }
    }

    fn count_occupancy(&self, counts: &mut [u64; 5]) {
        for index in 0..self.num_buckets {
            let state = match self.load(index) & FLAG_MASK_12 {
                ZERO_SLOT_12 => 0,
                ONE_SLOT_12 => 1,
                TWO_SLOT_12 => 2,
                THREE_SLOT_12 => 3,
                _ => 4,
            };
            counts[state] += 1;
        }
    }
}

const FLAG_MASK_16: u64 = 0x8000_8000_8000_0000;
const TAG_MASK_16: u64 = !FLAG_MASK_16;
const ZERO_SLOT_16: u64 = 0x0000_8000_0000_0000;
const ONE_SLOT_16: u64 = 0x8000_0000_0000_0000;
const TWO_SLOT_16: u64 = 0x8000_0000_8000_0000;
const THREE_SLOT_16: u64 = 0x8000_8000_0000_0000;

const ONES_61: u64 = 0x0000_0000_0000_0001;
const HIGHS_61: u64 = 0x1000_0000_0000_0000;
const ONES_30: u64 = 0x0000_0000_4000_0001;
const HIGHS_30: u64 = 0x0800_0000_2000_0000;
const ONES_20: u64 = 0x0000_0100_0010_0001;
const HIGHS_20: u64 = 0x0800_0080_0008_0000;
const ONES_16: u64 = 0x0001_0001_0001_0001;
const HIGHS_16: u64 = 0x8000_8000_8000_8000;

/// Bucket table for 16-bit full-width fingerprints: 8-byte buckets storing tags of 61, 30, 20,
/// or 16 bits depending on occupancy.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
pub struct TagTable16 {
    buckets: Vec<u64>,
}

impl TagTable for TagTable16 {
    const TAG_BITS: u32 = 16;

    fn with_buckets(num_buckets: u64) -> Self {
        assert!(num_buckets.is_power_of_two());
        TagTable16 {
            buckets: vec![ZERO_SLOT_16; num_buckets as usize],
        }
    }

    fn num_buckets(&self) -> u64 {
        self.buckets.len() as u64
    }

    fn size_in_bytes(&self) -> usize {
        self.buckets.len() * 8
    }

    fn clear(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = ZERO_SLOT_16;
        }
    }

    fn find_tag(&self, index: u64, unmasked_tag: u64) -> bool {
        let bucket = self.buckets[index as usize];
        match bucket & FLAG_MASK_16 {
            ZERO_SLOT_16 => false,
            ONE_SLOT_16 => {
                let tags = pext(bucket, TAG_MASK_16);
                has_value(tags, masked_tag(unmasked_tag, 61), ONES_61, HIGHS_61)
                    || has_value(tags, masked_tag(unmasked_tag, 30), ONES_61, HIGHS_61)
                    || has_value(tags, masked_tag(unmasked_tag, 20), ONES_61, HIGHS_61)
                    || has_value(tags, masked_tag(unmasked_tag, 16), ONES_61, HIGHS_61)
            }
            TWO_SLOT_16 => {
                let tags = pext(bucket, TAG_MASK_16);
                has_value(tags, masked_tag(unmasked_tag, 30), ONES_30, HIGHS_30)
                    || has_value(tags, masked_tag(unmasked_tag, 20), ONES_30, HIGHS_30)
                    || has_value(tags, masked_tag(unmasked_tag, 16), ONES_30, HIGHS_30)
            }
            THREE_SLOT_16 => {
                let tags = pext(bucket, TAG_MASK_16);
                has_value(tags, masked_tag(unmasked_tag, 20), ONES_20, HIGHS_20)
                    || has_value(tags, masked_tag(unmasked_tag, 16), ONES_20, HIGHS_20)
            }
            _ => has_value(bucket, masked_tag(unmasked_tag, 16), ONES_16, HIGHS_16),
        }
    }

    fn insert_tag<R: Rng>(
        &mut self,
        index: u64,
        unmasked_tag: u64,
        kickout: bool,
        rng: &mut R,
    ) -> BucketInsert {
        let bucket = self.buckets[index as usize];
        match bucket & FLAG_MASK_16 {
            ZERO_SLOT_16 => {
                self.buckets[index as usize] = pdep(unmasked_tag, TAG_MASK_16) | ONE_SLOT_16;
                BucketInsert::Stored
            }
            ONE_SLOT_16 => {
                // resident 61-bit tag truncates to the low 30 bits of the bucket
                let tags =
                    pext(bucket, 0x0000_0000_3fff_ffff) | masked_tag(unmasked_tag, 30) << 30;
                self.buckets[index as usize] = pdep(tags, TAG_MASK_16) | TWO_SLOT_16;
                BucketInsert::Stored
            }
            TWO_SLOT_16 => {
                // low 20 bits of each resident 30-bit tag
                let tags =
                    pext(bucket, 0x000f_7fff_400f_ffff) | masked_tag(unmasked_tag, 20) << 40;
                self.buckets[index as usize] = pdep(tags, TAG_MASK_16) | THREE_SLOT_16;
                BucketInsert::Stored
            }
            THREE_SLOT_16 => {
                // low 16 bits of each resident 20-bit tag
                let tags =
                    pext(bucket, 0x03ff_7e1f_7ff0_ffff) | masked_tag(unmasked_tag, 16) << 48;
                self.buckets[index as usize] = sort_upper_lanes(tags, 16, 0x0000_0000_0000_ffff);
                BucketInsert::Stored
            }
            _ => {
                if !kickout {
                    return BucketInsert::Rejected;
                }
                let slot = rng.gen_range(0, SLOTS_PER_BUCKET) as u64;
                let evicted = lane(bucket, slot, 16);
                let updated = (bucket & !(0xffffu64 << (slot * 16)))
                    | masked_tag(unmasked_tag, 16) << (slot * 16);
                self.buckets[index as usize] =
                    sort_upper_lanes(updated, 16, 0x0000_0000_0000_ffff);
                BucketInsert::Evicted(evicted)
            }
        }
    }

    fn find_widest_match(
        &self,
        index: u64,
        unmasked_tag: u64,
        best_index: &mut u64,
        best_width: &mut u32,
    ) {
        let bucket = self.buckets[index as usize];
        let (tags, widths, ones, highs): (u64, &[u32], u64, u64) = match bucket & FLAG_MASK_16 {
            ZERO_SLOT_16 => return,
            ONE_SLOT_16 => (
                pext(bucket, TAG_MASK_16),
                &[61, 30, 20, 16],
                ONES_61,
                HIGHS_61,
            ),
            TWO_SLOT_16 => (pext(bucket, TAG_MASK_16), &[30, 20, 16], ONES_30, HIGHS_30),
            THREE_SLOT_16 => (pext(bucket, TAG_MASK_16), &[20, 16], ONES_20, HIGHS_20),
            _ => (bucket, &[16], ONES_16, HIGHS_16),
        };
        for &width in widths {
            if *best_width >= width {
                return;
            }
            if has_value(tags, masked_tag(unmasked_tag, width), ones, highs) {
                *best_index = index;
                *best_width = width;
                return;
            }
        }
    }

    fn delete_tag(&mut self, index: u64, masked_tag: u64) {
        let bucket = self.buckets[index as usize];
        match bucket & FLAG_MASK_16 {
            ZERO_SLOT_16 => unreachable!("delete from an empty bucket"),
            ONE_SLOT_16 => self.buckets[index as usize] = ZERO_SLOT_16,
            TWO_SLOT_16 => {
                const KEEP: [u64; 2] = [0x3fff_7fff_4000_0000, 0x0000_0000_3fff_ffff];
                let tags = pext(bucket, TAG_MASK_16);
                let slot = (0..2)
                    .find(|&slot| lane(tags, slot, 30) == masked_tag)
                    .expect("tag not present in bucket");
                self.buckets[index as usize] =
                    pdep(pext(bucket, KEEP[slot as usize]), TAG_MASK_16) | ONE_SLOT_16;
            }
            THREE_SLOT_16 => {
                const KEEP: [u64; 3] = [
                    0x3fff_7fff_7ff0_0000,
                    0x3fff_7e00_000f_ffff,
                    0x0000_01ff_7fff_ffff,
                ];
                let tags = pext(bucket, TAG_MASK_16);
                let slot = (0..3)
                    .find(|&slot| lane(tags, slot, 20) == masked_tag)
                    .expect("tag not present in bucket");
                self.buckets[index as usize] =
                    pdep(pext(bucket, KEEP[slot as usize]), 0x000f_7fff_400f_ffff) | TWO_SLOT_16;
            }
            _ => {
                const KEEP: [u64; 4] = [
                    0xffff_ffff_ffff_0000,
                    0xffff_ffff_0000_ffff,
                    0xffff_0000_ffff_ffff,
                    0x0000_ffff_ffff_ffff,
                ];
                let slot = (0..4)
                    .find(|&slot| lane(bucket, slot, 16) == masked_tag)
                    .expect("tag not present in bucket");
                self.buckets[index as usize] =
                    pdep(pext(bucket, KEEP[slot as usize]), 0x03ff_7e1f_7ff0_ffff)
                        | THREE_SLOT_16;
            }
        }
    }

    fn count_occupancy(&self, counts: &mut [u64; 5]) {
        for &bucket in &self.buckets {
            let state = match bucket & FLAG_MASK_16 {
                ZERO_SLOT_16 => 0,
                ONE_SLOT_16 => 1,
                TWO_SLOT_16 => 2,
                THREE_SLOT_16 => 3,
                _ => 4,
            };
            counts[state] += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    fn occupancy<S: TagTable>(table: &S) -> [u64; 5] {
        let mut counts = [0; 5];
        table.count_occupancy(&mut counts);
        counts
    }

    fn widest<S: TagTable>(table: &S, index: u64, tag: u64) -> u32 {
        let mut best_index = 0;
        let mut best_width = 0;
        table.find_widest_match(index, tag, &mut best_index, &mut best_width);
        best_width
    }

    // tags with pairwise distinct low bits at every stored width
    const TAG_A: u64 = 0x0001_2345;
    const TAG_B: u64 = 0x0000_6789;
    const TAG_C: u64 = 0x0eff_4bd2;
    const TAG_D: u64 = 0x0000_0011;
    const TAG_E: u64 = 0x0000_0a9c;

    fn fill_and_drain<S: TagTable>() {
        let mut rng = XorShiftRng::seed_from_u64(7);
        let mut table = S::with_buckets(8);
        assert_eq!(occupancy(&table)[0], 8);
        assert!(!table.find_tag(0, TAG_A));

        for (count, &tag) in [TAG_A, TAG_B, TAG_C, TAG_D].iter().enumerate() {
            assert_eq!(
                table.insert_tag(0, tag, false, &mut rng),
                BucketInsert::Stored
            );
            assert_eq!(occupancy(&table)[count + 1], 1);
            for &stored in &[TAG_A, TAG_B, TAG_C, TAG_D][..=count] {
                assert!(table.find_tag(0, stored));
            }
        }

        // full bucket rejects without eviction
        assert_eq!(
            table.insert_tag(0, TAG_E, false, &mut rng),
            BucketInsert::Rejected
        );
        match table.insert_tag(0, TAG_E, true, &mut rng) {
            BucketInsert::Evicted(old) => {
                let full_width = [TAG_A, TAG_B, TAG_C, TAG_D]
                    .iter()
                    .any(|&tag| masked_tag(tag, S::TAG_BITS) == old);
                assert!(full_width);
            }
            outcome => panic!("expected eviction, got {:?}", outcome),
        }
        assert!(table.find_tag(0, TAG_E));

        table.clear();
        assert_eq!(occupancy(&table)[0], 8);
    }

    #[test]
    fn test_fill_and_drain_8() {
        fill_and_drain::<TagTable8>();
    }

    #[test]
    fn test_fill_and_drain_12() {
        fill_and_drain::<TagTable12>();
    }

    #[test]
    fn test_fill_and_drain_16() {
        fill_and_drain::<TagTable16>();
    }

    fn delete_downshifts<S: TagTable>() {
        let mut rng = XorShiftRng::seed_from_u64(11);
        let mut table = S::with_buckets(4);
        for &tag in &[TAG_A, TAG_B, TAG_C, TAG_D] {
            table.insert_tag(1, tag, false, &mut rng);
        }

        for (deleted, &tag) in [TAG_D, TAG_C, TAG_B].iter().enumerate() {
            let width = widest(&table, 1, tag);
            assert!(width > 0);
            table.delete_tag(1, masked_tag(tag, width));
            assert_eq!(occupancy(&table)[3 - deleted], 1);
        }
        let width = widest(&table, 1, TAG_A);
        assert!(width > 0);
        table.delete_tag(1, masked_tag(TAG_A, width));
        assert_eq!(occupancy(&table)[0], 4);
        assert!(!table.find_tag(1, TAG_A));
    }

    #[test]
    fn test_delete_downshifts_8() {
        delete_downshifts::<TagTable8>();
    }

    #[test]
    fn test_delete_downshifts_12() {
        delete_downshifts::<TagTable12>();
    }

    #[test]
    fn test_delete_downshifts_16() {
        delete_downshifts::<TagTable16>();
    }

    fn narrowed_tag_still_matches<S: TagTable>() {
        let mut rng = XorShiftRng::seed_from_u64(13);
        let mut table = S::with_buckets(2);
        table.insert_tag(0, TAG_A, false, &mut rng);
        // wide resident tag keeps matching as later inserts narrow the encoding
        for &tag in &[TAG_B, TAG_C, TAG_D] {
            table.insert_tag(0, tag, false, &mut rng);
            assert!(table.find_tag(0, TAG_A));
        }
    }

    #[test]
    fn test_narrowed_tag_still_matches_8() {
        narrowed_tag_still_matches::<TagTable8>();
    }

    #[test]
    fn test_narrowed_tag_still_matches_12() {
        narrowed_tag_still_matches::<TagTable12>();
    }

    #[test]
    fn test_narrowed_tag_still_matches_16() {
        narrowed_tag_still_matches::<TagTable16>();
    }

    #[test]
    fn test_full_bucket_lanes_sorted() {
        let mut rng = XorShiftRng::seed_from_u64(17);
        let mut table = TagTable8::with_buckets(2);
        for &tag in &[TAG_A, TAG_B, TAG_C, TAG_D] {
            table.insert_tag(0, tag, false, &mut rng);
        }
        let bucket = u64::from(table.buckets[0]);
        assert!(lane(bucket, 3, 8) <= lane(bucket, 2, 8));
        assert!(lane(bucket, 2, 8) <= lane(bucket, 1, 8));
    }

    #[test]
    fn test_adjacent_buckets_stay_independent() {
        let mut rng = XorShiftRng::seed_from_u64(19);
        let mut table = TagTable12::with_buckets(4);
        for &tag in &[TAG_A, TAG_B, TAG_C, TAG_D] {
            table.insert_tag(0, tag, false, &mut rng);
            table.insert_tag(1, tag.rotate_left(7), false, &mut rng);
        }
        for &tag in &[TAG_A, TAG_B, TAG_C, TAG_D] {
            assert!(table.find_tag(0, tag));
            assert!(table.find_tag(1, tag.rotate_left(7)));
        }

        let width = widest(&table, 1, TAG_A.rotate_left(7));
        table.delete_tag(1, masked_tag(TAG_A.rotate_left(7), width));
        for &tag in &[TAG_A, TAG_B, TAG_C, TAG_D] {
            assert!(table.find_tag(0, tag));
        }
        assert_eq!(occupancy(&table), [2, 0, 0, 1, 1]);
    }

    #[test]
    #[should_panic(expected = "delete from an empty bucket")]
    fn test_delete_from_empty_bucket() {
        let mut table = TagTable16::with_buckets(2);
        table.delete_tag(0, 1);
    }
}

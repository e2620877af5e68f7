//! Space-efficient probabilistic data structure for approximate membership queries in a set,
//! with remainders that occupy one or two slots.

use crate::bitstring_vec::BitstringVec;
use crate::util;
use crate::SipHasherBuilder;
#[cfg(feature = "serde")]
use serde_crate::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

const SHIFTED_MASK: u64 = 0b001;
const CONTINUATION_MASK: u64 = 0b010;
const OCCUPIED_MASK: u64 = 0b100;
const METADATA_MASK: u64 = 0b111;
const METADATA_BITS: u8 = 3;

const DEFAULT_TWO_SLOT_THRESHOLD: f64 = 0.2;

#[inline]
fn low_mask(size: u64) -> u64 {
    (1u64 << size) - 1
}

#[inline]
fn is_occupied(slot: u64) -> bool {
    slot & OCCUPIED_MASK != 0
}

#[inline]
fn is_continuation(slot: u64) -> bool {
    slot & CONTINUATION_MASK != 0
}

#[inline]
fn is_shifted(slot: u64) -> bool {
    slot & SHIFTED_MASK != 0
}

#[inline]
fn set_occupied(slot: u64) -> u64 {
    slot | OCCUPIED_MASK
}

#[inline]
fn set_continuation(slot: u64) -> u64 {
    slot | CONTINUATION_MASK
}

#[inline]
fn set_shifted(slot: u64) -> u64 {
    slot | SHIFTED_MASK
}

#[inline]
fn clear_occupied(slot: u64) -> u64 {
    slot & !OCCUPIED_MASK
}

#[inline]
fn clear_continuation(slot: u64) -> u64 {
    slot & !CONTINUATION_MASK
}

#[inline]
fn clear_shifted(slot: u64) -> u64 {
    slot & !SHIFTED_MASK
}

#[inline]
fn partial_remainder(slot: u64) -> u64 {
    slot >> METADATA_BITS
}

#[inline]
fn is_empty_slot(slot: u64) -> bool {
    slot & METADATA_MASK == 0
}

#[inline]
fn is_cluster_start(slot: u64) -> bool {
    is_occupied(slot) && !is_continuation(slot) && !is_shifted(slot)
}

#[inline]
fn is_run_start(slot: u64) -> bool {
    !is_continuation(slot) && (is_occupied(slot) || is_shifted(slot))
}

// continuation without shifted marks the second slot of a two-slot remainder; an ordinary
// continuation pushed out of its canonical slot always carries shifted as well
#[inline]
fn is_pair_continuation(slot: u64) -> bool {
    is_continuation(slot) && !is_shifted(slot)
}

#[inline]
fn is_cyclically_between(start: u64, middle: u64, end: u64) -> bool {
    (start < middle && middle < end)
        || (end < start && start < middle)
        || (middle < end && end < start)
}

/// A space-efficient probabilistic data structure to test for membership in a set, with the
/// ability to remove items.
///
/// A quotient filter is essentially a compact hash table. Each item is hashed to a fingerprint
/// whose top `q` bits (the quotient) select a canonical slot and whose remaining bits (the
/// remainder) are stored there. Items sharing a quotient form a run of contiguous slots sorted
/// by remainder; runs are ordered by canonical slot within maximal contiguous groups called
/// clusters. Three metadata bits per slot (`is_occupied`, `is_continuation`, `is_shifted`)
/// maintain this layout as entries shift to make room for each other.
///
/// Remainders in this filter are `2 * remainder_bits - 2` bits wide, while a slot stores only
/// `remainder_bits` of them. While the filter is emptier than the configurable threshold, new
/// items spread their full remainder across two adjacent slots: the first slot stores the low
/// bits under a set top bit, and the second slot carries the high bits with `is_continuation`
/// set but `is_shifted` clear, a metadata combination no ordinary continuation can have. Once
/// the filter fills up, new items store only the truncated one-slot form, and insertions into a
/// completely full slot array reclaim space by compacting an existing two-slot remainder back
/// to one slot.
///
/// # Examples
///
/// ```
/// use variable_filters::quotient::VariableQuotientFilter;
///
/// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
///
/// assert!(!filter.contains("foo"));
/// filter.insert("foo");
/// assert!(filter.contains("foo"));
///
/// filter.remove("foo");
/// assert!(!filter.contains("foo"));
///
/// assert_eq!(filter.quotient_bits(), 7);
/// assert_eq!(filter.remainder_bits(), 8);
/// ```
#[derive(Clone)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
pub struct VariableQuotientFilter<T, B = SipHasherBuilder> {
    quotient_bits: u8,
    remainder_bits: u8,
    index_mask: u64,
    slot_vec: BitstringVec,
    occupied_slot_count: u64,
    item_count: u64,
    two_slot_threshold: f64,
    hash_builder: B,
    _marker: PhantomData<T>,
}

impl<T> VariableQuotientFilter<T> {
    /// Constructs a new, empty `VariableQuotientFilter` with at least `max_key_count` slots and
    /// `remainder_bits` stored remainder bits per slot. The slot count is rounded up to a power
    /// of two.
    ///
    /// # Panics
    ///
    /// Panics if `max_key_count` is less than 2, if `remainder_bits` is less than 2 or greater
    /// than 31, or if the quotient and full remainder together exceed 64 bits.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let filter = VariableQuotientFilter::<String>::new(100, 8);
    /// ```
    pub fn new(max_key_count: usize, remainder_bits: u8) -> Self {
        Self::with_hasher(max_key_count, remainder_bits, SipHasherBuilder::from_entropy())
    }
}

impl<T, B> VariableQuotientFilter<T, B>
where
    B: BuildHasher,
{
    /// Constructs a new, empty `VariableQuotientFilter` with at least `max_key_count` slots,
    /// `remainder_bits` stored remainder bits per slot, and a specified hasher builder.
    ///
    /// # Panics
    ///
    /// Panics if `max_key_count` is less than 2, if `remainder_bits` is less than 2 or greater
    /// than 31, or if the quotient and full remainder together exceed 64 bits.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    /// use variable_filters::SipHasherBuilder;
    ///
    /// let filter = VariableQuotientFilter::<String>::with_hasher(
    ///     100,
    ///     8,
    ///     SipHasherBuilder::from_entropy(),
    /// );
    /// ```
    pub fn with_hasher(max_key_count: usize, remainder_bits: u8, hash_builder: B) -> Self {
        assert!(max_key_count > 1);
        assert!(remainder_bits >= 2 && remainder_bits <= 31);
        let quotient_bits = (max_key_count as u64).next_power_of_two().trailing_zeros() as u8;
        assert!(u32::from(quotient_bits) + 2 * u32::from(remainder_bits) - 2 <= 64);
        let slot_bits = usize::from(remainder_bits) + usize::from(METADATA_BITS);
        VariableQuotientFilter {
            quotient_bits,
            remainder_bits,
            index_mask: low_mask(u64::from(quotient_bits)),
            slot_vec: BitstringVec::new(slot_bits, 1 << quotient_bits),
            occupied_slot_count: 0,
            item_count: 0,
            two_slot_threshold: DEFAULT_TWO_SLOT_THRESHOLD,
            hash_builder,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn slot_bits(&self) -> u64 {
        u64::from(self.remainder_bits) + u64::from(METADATA_BITS)
    }

    #[inline]
    fn slot_count(&self) -> u64 {
        self.index_mask + 1
    }

    #[inline]
    fn get_slot(&self, index: u64) -> u64 {
        self.slot_vec.get(index as usize)
    }

    #[inline]
    fn set_slot(&mut self, index: u64, slot: u64) {
        self.slot_vec.set(index as usize, slot & low_mask(self.slot_bits()));
    }

    #[inline]
    fn incr_index(&self, index: u64, step: u64) -> u64 {
        (index + step) & self.index_mask
    }

    #[inline]
    fn decr_index(&self, index: u64) -> u64 {
        index.wrapping_sub(1) & self.index_mask
    }

    fn quotient_and_remainder(&self, hash: u64) -> (u64, u64) {
        let remainder_width = 2 * u64::from(self.remainder_bits) - 2;
        (
            (hash >> remainder_width) & self.index_mask,
            hash & low_mask(remainder_width),
        )
    }

    #[inline]
    fn is_two_slot_insert(&self) -> bool {
        (self.occupied_slot_count as f64) < self.slot_count() as f64 * self.two_slot_threshold
    }

    // Returns the slot stride of the remainder starting at `index` and its assembled value. The
    // second half of a pair always stores a smaller partial than the first (its top bit is
    // clear), while ordinary continuations never do because runs are sorted ascending.
    fn remainder_at(&self, index: u64, slot: u64) -> (u64, u64) {
        debug_assert!(!is_empty_slot(slot));
        let partial = partial_remainder(slot);
        let next_slot = self.get_slot(self.incr_index(index, 1));
        if !is_empty_slot(next_slot)
            && !is_run_start(next_slot)
            && partial_remainder(next_slot) < partial
        {
            debug_assert!(is_pair_continuation(next_slot));
            let b = u64::from(self.remainder_bits);
            let full = (partial & low_mask(b - 1)) | (partial_remainder(next_slot) << (b - 1));
            (2, full)
        } else {
            (1, partial)
        }
    }

    fn find_run_start(&self, quotient: u64) -> u64 {
        let mut cluster_start = quotient;
        let mut scanned = 0u64;
        loop {
            let slot = self.get_slot(cluster_start);
            if !is_shifted(slot) && !is_continuation(slot) {
                break;
            }
            cluster_start = self.decr_index(cluster_start);
            scanned += 1;
            assert!(scanned <= self.slot_count(), "slot metadata is corrupted");
        }

        // advance run start and cluster start in lock-step until the cluster cursor reaches the
        // requested quotient; the quotient must be occupied for this to terminate
        let mut run_start = cluster_start;
        while cluster_start != quotient {
            loop {
                run_start = self.incr_index(run_start, 1);
                if !is_continuation(self.get_slot(run_start)) {
                    break;
                }
            }
            loop {
                cluster_start = self.incr_index(cluster_start, 1);
                if is_occupied(self.get_slot(cluster_start)) {
                    break;
                }
            }
        }
        run_start
    }

    // Shift-forward primitive: writes `entries` at `insert_idx` and re-queues displaced slots
    // until an empty slot absorbs the walk. Returns how many additional slots became occupied.
    //
    // A displaced second half of a two-slot remainder is reusable space: unless compaction is
    // disabled, it is overwritten instead of re-queued, shortening that remainder to one slot.
    fn insert_to(&mut self, mut insert_idx: u64, entries: &[u64], force_disable_compaction: bool) -> u64 {
        let mut queue: VecDeque<u64> = entries.iter().copied().collect();
        let mut used = entries.len() as u64;

        loop {
            let mut displaced = self.get_slot(insert_idx);
            let mut current = queue.pop_front().expect("eviction queue drained");
            let was_empty = is_empty_slot(displaced);
            let mut move_backwards = false;

            if !was_empty {
                let pair_continuation = is_pair_continuation(displaced);
                if !pair_continuation {
                    displaced = set_shifted(displaced);
                }
                if is_occupied(displaced) {
                    displaced = clear_occupied(displaced);
                    current = set_occupied(current);
                }
                let reuse_pair_slot =
                    !force_disable_compaction && !self.is_two_slot_insert() && pair_continuation;
                if !reuse_pair_slot {
                    queue.push_back(displaced);
                } else {
                    // the preceding first half now carries the remainder alone; when the lost
                    // half was even its top bit clears and the slot may need to move backwards
                    // to stay in ascending run order
                    if partial_remainder(displaced) % 2 == 0 {
                        current &= !(1u64 << (self.slot_bits() - 1));
                        move_backwards = true;
                    }
                    used -= 1;
                }
            }
            self.set_slot(insert_idx, current);
            if move_backwards {
                self.move_compacted_slot(insert_idx, current);
            }
            insert_idx = self.incr_index(insert_idx, 1);
            if queue.is_empty() {
                break;
            }
        }
        used
    }

    // Moves a remainder whose value shrank during compaction backwards within its run so the
    // run stays sorted.
    fn move_compacted_slot(&mut self, first_idx: u64, first_slot: u64) {
        if is_run_start(first_slot) {
            self.set_slot(first_idx, first_slot);
            return;
        }

        let mut new_idx = first_idx;
        let mut new_slot = first_slot;
        {
            let mut curr_idx = self.decr_index(first_idx);
            let first_partial = partial_remainder(first_slot);
            loop {
                let curr_slot = self.get_slot(curr_idx);
                if !is_pair_continuation(curr_slot) {
                    if partial_remainder(curr_slot) >= first_partial {
                        new_idx = curr_idx;
                        new_slot = curr_slot;
                    } else {
                        break;
                    }
                }
                curr_idx = self.decr_index(curr_idx);
                if is_run_start(curr_slot) {
                    break;
                }
            }
        }

        if new_idx == first_idx {
            self.set_slot(new_idx, first_slot);
            return;
        }

        let was_occupied = is_occupied(first_slot);
        let mut moved = first_slot;
        if is_occupied(new_slot) {
            moved = set_occupied(moved);
        } else {
            moved = clear_occupied(moved);
        }
        if is_cluster_start(new_slot) {
            moved = clear_shifted(clear_continuation(moved));
            // the displaced run start becomes an ordinary continuation
            self.set_slot(new_idx, set_shifted(set_continuation(new_slot)));
        } else if is_run_start(new_slot) {
            moved = set_shifted(clear_continuation(moved));
            self.set_slot(new_idx, set_shifted(set_continuation(new_slot)));
        } else {
            moved = set_shifted(set_continuation(moved));
        }

        // vacate the source slot so it bounds the forward shift
        self.set_slot(first_idx, 0);
        self.insert_to(new_idx, &[moved], true);
        if was_occupied {
            let slot = self.get_slot(first_idx);
            self.set_slot(first_idx, set_occupied(slot));
        }
    }

    // Before dropping the second half of a pair: when its partial is even, the surviving slot's
    // top bit clears and the slot must be re-positioned within its run.
    fn adjust_pair_top_bit(&mut self, second_idx: u64) {
        let first_idx = self.decr_index(second_idx);
        let first_slot = self.get_slot(first_idx);
        let second_slot = self.get_slot(second_idx);
        if partial_remainder(second_slot) % 2 == 0 {
            let cleared = first_slot & !(1u64 << (self.slot_bits() - 1));
            self.move_compacted_slot(first_idx, cleared);
        }
    }

    // Classic unshift: pulls successors backwards from `delete_next_idx` over the removed
    // slot(s) until an empty slot or cluster start stops the walk. A remainder may never land
    // before its canonical slot; the gap is padded with empty slots that keep the occupied bit.
    fn delete_from(&mut self, mut delete_idx: u64, mut quotient: u64, mut delete_next_idx: u64) {
        let mut delete_curr = self.get_slot(delete_idx);
        let orig_delete_idx = delete_idx;

        loop {
            let delete_next = self.get_slot(delete_next_idx);
            let mut curr_occupied = is_occupied(delete_curr);

            if is_empty_slot(delete_next)
                || is_cluster_start(delete_next)
                || delete_next_idx == orig_delete_idx
            {
                let mut index = delete_idx;
                while index != delete_next_idx {
                    self.set_slot(index, 0);
                    index = self.incr_index(index, 1);
                }
                return;
            }

            let mut updated_next = delete_next;
            if is_run_start(updated_next) {
                loop {
                    quotient = self.incr_index(quotient, 1);
                    if is_occupied(self.get_slot(quotient)) {
                        break;
                    }
                }

                while is_cyclically_between(delete_idx, quotient, delete_next_idx) {
                    let padding = if curr_occupied { OCCUPIED_MASK } else { 0 };
                    self.set_slot(delete_idx, padding);
                    delete_idx = self.incr_index(delete_idx, 1);
                    delete_curr = self.get_slot(delete_idx);
                    curr_occupied = is_occupied(delete_curr);
                }

                if curr_occupied && quotient == delete_idx {
                    // the run start slides into its canonical slot
                    updated_next = clear_shifted(updated_next);
                }
            }

            let moved = if curr_occupied {
                set_occupied(updated_next)
            } else {
                clear_occupied(updated_next)
            };
            self.set_slot(delete_idx, moved);
            delete_idx = self.incr_index(delete_idx, 1);
            delete_curr = self.get_slot(delete_idx);
            delete_next_idx = self.incr_index(delete_next_idx, 1);
        }
    }

    /// Inserts an element into the variable quotient filter. Returns `false` without inserting
    /// when the filter already holds as many items as it has slots.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// assert!(filter.insert("foo"));
    /// ```
    pub fn insert<U>(&mut self, item: &U) -> bool
    where
        T: Borrow<U>,
        U: Hash + ?Sized,
    {
        if self.item_count >= self.slot_count() {
            return false;
        }

        let (quotient, remainder) =
            self.quotient_and_remainder(util::hash(&self.hash_builder, item));
        let b = u64::from(self.remainder_bits);
        let slot_count: u64 = if self.is_two_slot_insert() { 2 } else { 1 };
        let mut to_insert = [0u64; 2];
        if slot_count == 1 {
            to_insert[0] = (remainder & low_mask(b)) << METADATA_BITS;
        } else {
            to_insert[0] = ((remainder & low_mask(b - 1)) | (1u64 << (b - 1))) << METADATA_BITS;
            to_insert[1] =
                set_continuation(((remainder >> (b - 1)) & low_mask(b - 1)) << METADATA_BITS);
        }

        let mut quotient_slot = self.get_slot(quotient);

        if self.occupied_slot_count == self.slot_count() {
            // the slot array is full: compact an existing two-slot remainder to make room,
            // deleting only its continuation half
            let quotient_occupied = is_occupied(quotient_slot);
            if !quotient_occupied {
                // occupied must be set for find_run_start to position correctly
                self.set_slot(quotient, set_occupied(quotient_slot));
            }
            let mut pair_idx = self.find_run_start(quotient);
            let mut pair_quotient = quotient;
            if !quotient_occupied {
                loop {
                    pair_quotient = self.incr_index(pair_quotient, 1);
                    if is_occupied(self.get_slot(pair_quotient)) {
                        break;
                    }
                }
                self.set_slot(quotient, quotient_slot);
            }
            loop {
                pair_idx = self.incr_index(pair_idx, 1);
                let slot = self.get_slot(pair_idx);
                if is_run_start(slot) {
                    loop {
                        pair_quotient = self.incr_index(pair_quotient, 1);
                        if is_occupied(self.get_slot(pair_quotient)) {
                            break;
                        }
                    }
                }
                if is_pair_continuation(slot) {
                    break;
                }
            }
            self.adjust_pair_top_bit(pair_idx);
            let pair_next_idx = self.incr_index(pair_idx, 1);
            self.delete_from(pair_idx, pair_quotient, pair_next_idx);
            self.occupied_slot_count -= 1;
            quotient_slot = self.get_slot(quotient);
        }

        if is_empty_slot(quotient_slot) {
            if slot_count == 1 {
                self.set_slot(quotient, set_occupied(to_insert[0]));
                self.occupied_slot_count += 1;
            } else {
                let next_idx = self.incr_index(quotient, 1);
                if !is_empty_slot(self.get_slot(next_idx)) {
                    // shift the occupant out so the pair lands in adjacent slots; needs two
                    // free slots in the filter
                    debug_assert!(self.slot_count() - self.occupied_slot_count >= 2);
                    self.insert_to(next_idx, &[0], true);
                }
                debug_assert!(is_empty_slot(self.get_slot(quotient)));
                if is_occupied(self.get_slot(next_idx)) {
                    to_insert[1] = set_occupied(to_insert[1]);
                }
                self.set_slot(quotient, set_occupied(to_insert[0]));
                self.set_slot(next_idx, to_insert[1]);
                self.occupied_slot_count += 2;
            }
            self.item_count += 1;
            return true;
        }

        let quotient_occupied = is_occupied(quotient_slot);
        if !quotient_occupied {
            self.set_slot(quotient, set_occupied(quotient_slot));
        }

        let run_start = self.find_run_start(quotient);
        let mut insert_idx = run_start;

        if quotient_occupied {
            // find the position in the run that keeps partial remainders ascending
            let one_slot_form = partial_remainder(to_insert[0]);
            let mut cur_slot = self.get_slot(insert_idx);
            loop {
                let partial = partial_remainder(cur_slot);
                let (step, _) = self.remainder_at(insert_idx, cur_slot);
                if partial > one_slot_form {
                    break;
                }
                insert_idx = self.incr_index(insert_idx, step);
                cur_slot = self.get_slot(insert_idx);
                if !is_continuation(cur_slot) {
                    break;
                }
            }

            if insert_idx == run_start {
                // the old run start becomes a continuation; shifted marks it as an ordinary
                // one rather than the second half of a pair
                let slot = self.get_slot(run_start);
                self.set_slot(run_start, set_shifted(set_continuation(slot)));
            } else {
                to_insert[0] = set_continuation(to_insert[0]);
            }
        }

        if insert_idx != quotient {
            to_insert[0] = set_shifted(to_insert[0]);
        }

        let used = self.insert_to(insert_idx, &to_insert[..slot_count as usize], false);
        self.occupied_slot_count += used;
        self.item_count += 1;
        true
    }

    /// Checks if an element is possibly in the variable quotient filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// assert!(!filter.contains("foo"));
    /// filter.insert("foo");
    /// assert!(filter.contains("foo"));
    /// ```
    pub fn contains<U>(&self, item: &U) -> bool
    where
        T: Borrow<U>,
        U: Hash + ?Sized,
    {
        let (quotient, remainder) =
            self.quotient_and_remainder(util::hash(&self.hash_builder, item));
        if !is_occupied(self.get_slot(quotient)) {
            return false;
        }

        let b = u64::from(self.remainder_bits);
        let one_slot_form = remainder & low_mask(b);
        let two_slot_first = (remainder & low_mask(b - 1)) | (1u64 << (b - 1));
        let max_partial = cmp::max(one_slot_form, two_slot_first);

        let mut run_idx = self.find_run_start(quotient);
        let mut cur_slot = self.get_slot(run_idx);
        loop {
            let partial = partial_remainder(cur_slot);
            let (step, full_remainder) = self.remainder_at(run_idx, cur_slot);
            if (step == 1 && partial == one_slot_form) || (step == 2 && full_remainder == remainder)
            {
                return true;
            } else if partial > max_partial {
                // runs are sorted, so further entries are always larger
                return false;
            }
            run_idx = self.incr_index(run_idx, step);
            cur_slot = self.get_slot(run_idx);
            if !is_continuation(cur_slot) {
                return false;
            }
        }
    }

    /// Removes an element from the variable quotient filter. Returns `false` when no stored
    /// remainder matches the element. When both a one-slot and a two-slot remainder match, the
    /// two-slot one is removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// assert!(filter.remove("foo"));
    /// assert!(!filter.contains("foo"));
    /// ```
    pub fn remove<U>(&mut self, item: &U) -> bool
    where
        T: Borrow<U>,
        U: Hash + ?Sized,
    {
        let (quotient, remainder) =
            self.quotient_and_remainder(util::hash(&self.hash_builder, item));
        let quotient_slot = self.get_slot(quotient);
        if !is_occupied(quotient_slot) || self.occupied_slot_count == 0 {
            return false;
        }

        let b = u64::from(self.remainder_bits);
        let one_slot_form = remainder & low_mask(b);
        let two_slot_first = (remainder & low_mask(b - 1)) | (1u64 << (b - 1));
        let max_partial = cmp::max(one_slot_form, two_slot_first);

        let mut run_idx = self.find_run_start(quotient);
        let mut cur_slot = self.get_slot(run_idx);
        let mut delete_idx = 0;
        let mut delete_step = 0;
        loop {
            let partial = partial_remainder(cur_slot);
            let (step, full_remainder) = self.remainder_at(run_idx, cur_slot);
            if (step == 1 && partial == one_slot_form) || (step == 2 && full_remainder == remainder)
            {
                if step > delete_step {
                    delete_idx = run_idx;
                    delete_step = step;
                    if step == 2 {
                        break;
                    }
                }
            } else if partial > max_partial {
                break;
            }
            run_idx = self.incr_index(run_idx, step);
            cur_slot = self.get_slot(run_idx);
            if !is_continuation(cur_slot) {
                break;
            }
        }

        if delete_step == 0 {
            return false;
        }

        let delete_slot = if delete_idx == quotient {
            quotient_slot
        } else {
            self.get_slot(delete_idx)
        };
        let run_start_removed = is_run_start(delete_slot);
        let delete_next_idx = self.incr_index(delete_idx, delete_step);
        let delete_next_slot = self.get_slot(delete_next_idx);
        if run_start_removed && !is_continuation(delete_next_slot) {
            // removing the only entry of the run clears the canonical occupied bit
            self.set_slot(quotient, clear_occupied(quotient_slot));
        }

        self.delete_from(delete_idx, quotient, delete_next_idx);

        if run_start_removed {
            let next = self.get_slot(delete_idx);
            let mut updated = next;
            if is_continuation(updated) {
                updated = clear_continuation(updated);
            }
            if delete_idx == quotient && is_shifted(updated) {
                updated = clear_shifted(updated);
            }
            if updated != next {
                self.set_slot(delete_idx, updated);
            }
        }
        self.occupied_slot_count -= delete_step;
        self.item_count -= 1;
        true
    }

    /// Sets the fill ratio below which new items store their remainder across two slots.
    ///
    /// # Panics
    ///
    /// Panics if `threshold` is not in the range `(0, 1]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
    /// filter.set_insert_large_remainder_threshold(0.5);
    /// ```
    pub fn set_insert_large_remainder_threshold(&mut self, threshold: f64) {
        assert!(threshold > 0.0 && threshold <= 1.0);
        self.two_slot_threshold = threshold;
    }

    /// Clears the variable quotient filter, removing all elements.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// filter.clear();
    ///
    /// assert!(!filter.contains("foo"));
    /// ```
    pub fn clear(&mut self) {
        self.slot_vec.clear();
        self.occupied_slot_count = 0;
        self.item_count = 0;
    }

    /// Returns the number of items in the variable quotient filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// assert_eq!(filter.len(), 1);
    /// ```
    pub fn len(&self) -> usize {
        self.item_count as usize
    }

    /// Returns `true` if the variable quotient filter is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// assert!(filter.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }

    /// Returns the number of slots in the variable quotient filter, which is also the maximum
    /// number of items it can hold.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// assert_eq!(filter.capacity(), 128);
    /// ```
    pub fn capacity(&self) -> usize {
        1 << self.quotient_bits
    }

    /// Returns the number of non-empty slots. An item occupies one or two slots.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// assert_eq!(filter.occupied_slots(), 2);
    /// ```
    pub fn occupied_slots(&self) -> usize {
        self.occupied_slot_count as usize
    }

    /// Returns the number of quotient bits in an item's fingerprint.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// assert_eq!(filter.quotient_bits(), 7);
    /// ```
    pub fn quotient_bits(&self) -> u8 {
        self.quotient_bits
    }

    /// Returns the number of remainder bits stored in a single slot. Full remainders are
    /// `2 * remainder_bits - 2` bits wide and use one or two slots.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// assert_eq!(filter.remainder_bits(), 8);
    /// ```
    pub fn remainder_bits(&self) -> u8 {
        self.remainder_bits
    }

    /// Returns the size of the slot array in bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// assert_eq!(filter.size_in_bytes(), 176);
    /// ```
    pub fn size_in_bytes(&self) -> usize {
        (self.capacity() * (usize::from(self.remainder_bits) + usize::from(METADATA_BITS)) + 63)
            / 64
            * 8
    }

    /// Returns the ratio of occupied slots to total slots.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// assert!(filter.load_factor() > 0.0);
    /// ```
    pub fn load_factor(&self) -> f64 {
        self.occupied_slot_count as f64 / self.slot_count() as f64
    }

    /// Returns the number of bits of memory used per item present.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let mut filter = VariableQuotientFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// assert!(filter.bits_per_item() > 0.0);
    /// ```
    pub fn bits_per_item(&self) -> f64 {
        8.0 * self.size_in_bytes() as f64 / self.item_count as f64
    }

    /// Returns a reference to the filter's hasher builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::quotient::VariableQuotientFilter;
    ///
    /// let filter = VariableQuotientFilter::<String>::new(100, 8);
    /// let hasher = filter.hasher();
    /// ```
    pub fn hasher(&self) -> &B {
        &self.hash_builder
    }
}

impl<T> fmt::Debug for VariableQuotientFilter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in 0..self.capacity() {
            let slot = self.slot_vec.get(index);
            write!(
                f,
                "{}|{}:{:03b} ",
                index,
                slot >> METADATA_BITS,
                slot & METADATA_MASK
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::tests::hash_builder_1;
    use rand::{seq::SliceRandom, Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;

    // walks every run, checking that it is reachable from its canonical slot and sorted by
    // partial remainder, and that pair metadata only appears behind a pair's first half
    fn check_invariants<T>(filter: &VariableQuotientFilter<T>) {
        for quotient in 0..filter.slot_count() {
            if !is_occupied(filter.get_slot(quotient)) {
                continue;
            }
            let mut run_idx = filter.find_run_start(quotient);
            let mut slot = filter.get_slot(run_idx);
            let mut prev_partial = 0;
            loop {
                assert!(!is_empty_slot(slot));
                let partial = partial_remainder(slot);
                assert!(partial >= prev_partial);
                prev_partial = partial;
                let (step, _) = filter.remainder_at(run_idx, slot);
                run_idx = filter.incr_index(run_idx, step);
                slot = filter.get_slot(run_idx);
                if !is_continuation(slot) {
                    break;
                }
            }
        }

        for index in 0..filter.slot_count() {
            let slot = filter.get_slot(index);
            if !is_empty_slot(slot) && is_pair_continuation(slot) {
                let first = filter.get_slot(filter.decr_index(index));
                assert!(!is_empty_slot(first));
                assert!(partial_remainder(first) > partial_remainder(slot));
            }
        }
    }

    #[test]
    fn test_new() {
        let filter = VariableQuotientFilter::<u64>::with_hasher(100, 8, hash_builder_1());
        assert_eq!(filter.capacity(), 128);
        assert_eq!(filter.quotient_bits(), 7);
        assert_eq!(filter.remainder_bits(), 8);
        assert_eq!(filter.occupied_slots(), 0);
        assert!(filter.is_empty());
    }

    #[test]
    fn test_insert() {
        let mut filter = VariableQuotientFilter::<String>::with_hasher(100, 8, hash_builder_1());
        assert!(filter.insert("foo"));
        assert_eq!(filter.len(), 1);
        assert_eq!(filter.occupied_slots(), 2);
        assert!(!filter.is_empty());
        assert!(filter.contains("foo"));
    }

    #[test]
    fn test_insert_duplicates() {
        let mut filter = VariableQuotientFilter::<String>::with_hasher(100, 8, hash_builder_1());
        filter.insert("foo");
        filter.insert("foo");
        assert_eq!(filter.len(), 2);

        assert!(filter.remove("foo"));
        assert!(filter.contains("foo"));
        assert!(filter.remove("foo"));
        assert!(!filter.contains("foo"));
        assert!(filter.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut filter = VariableQuotientFilter::<String>::with_hasher(100, 8, hash_builder_1());
        filter.insert("foo");
        assert!(filter.remove("foo"));

        assert_eq!(filter.len(), 0);
        assert!(filter.is_empty());
        assert!(!filter.contains("foo"));
    }

    #[test]
    fn test_remove_missing() {
        let mut filter = VariableQuotientFilter::<String>::with_hasher(100, 8, hash_builder_1());
        filter.insert("foo");
        assert!(!filter.remove("bar"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut filter = VariableQuotientFilter::<String>::with_hasher(100, 8, hash_builder_1());

        filter.insert("foobar");
        filter.insert("barfoo");
        filter.insert("baz");
        filter.insert("qux");

        filter.clear();

        assert!(filter.is_empty());
        assert_eq!(filter.occupied_slots(), 0);
        assert!(!filter.contains("baz"));
        assert!(!filter.contains("qux"));
        assert!(!filter.contains("foobar"));
        assert!(!filter.contains("barfoo"));
    }

    #[test]
    fn test_size_tracking() {
        let mut filter = VariableQuotientFilter::<u64>::with_hasher(1024, 8, hash_builder_1());
        assert_eq!(filter.capacity(), 1024);

        for i in 0u64..512 {
            assert!(filter.insert(&i));
            assert_eq!(filter.len(), i as usize + 1);
        }
        check_invariants(&filter);

        for i in (0u64..512).rev() {
            assert!(filter.remove(&i));
            assert_eq!(filter.len(), i as usize);
        }
        assert!(filter.is_empty());
        assert_eq!(filter.occupied_slots(), 0);
        assert_eq!(filter.slot_vec.occupied_len(), 0);
    }

    #[test]
    fn test_stress() {
        let mut rng = XorShiftRng::seed_from_u64(23);
        let item_count = 512;

        // large remainder to decrease chance of false positives
        let mut filter = VariableQuotientFilter::<u64>::with_hasher(1024, 20, hash_builder_1());

        let mut items = Vec::new();
        for _ in 0..item_count {
            let mut item: u64 = rng.gen();
            while filter.contains(&item) {
                item = rng.gen();
            }
            filter.insert(&item);
            items.push(item);
            assert_eq!(filter.len(), items.len());
        }
        check_invariants(&filter);

        items.shuffle(&mut rng);
        for item in items {
            assert!(filter.contains(&item));
            assert!(filter.remove(&item));
            assert!(!filter.contains(&item));
        }
        assert!(filter.is_empty());
        assert_eq!(filter.slot_vec.occupied_len(), 0);
    }

    #[test]
    fn test_full_filter_compacts_pairs() {
        let mut filter = VariableQuotientFilter::<u64>::with_hasher(2048, 12, hash_builder_1());
        filter.set_insert_large_remainder_threshold(0.5);

        let mut inserted = 0u64;
        let mut inserts_into_full_slots = 0;
        while filter.insert(&inserted) {
            inserted += 1;
            // once every slot is in use, items still fit by pair compaction
            if filter.occupied_slots() == filter.capacity() {
                inserts_into_full_slots += 1;
            }
        }
        assert!(inserts_into_full_slots > 1);
        assert_eq!(inserted as usize, filter.capacity());
        assert_eq!(filter.len(), filter.capacity());
        assert_eq!(filter.occupied_slots(), filter.capacity());
        check_invariants(&filter);

        for i in 0..inserted {
            assert!(filter.contains(&i));
        }
        for i in 0..inserted {
            assert!(filter.remove(&i));
        }
        assert!(filter.is_empty());
        assert_eq!(filter.slot_vec.occupied_len(), 0);
    }

    #[test]
    fn test_pair_metadata_under_full_two_slot_load() {
        let mut filter = VariableQuotientFilter::<u64>::with_hasher(256, 10, hash_builder_1());
        filter.set_insert_large_remainder_threshold(1.0);

        let mut rng = XorShiftRng::seed_from_u64(29);
        let mut items = Vec::new();
        for _ in 0..100 {
            let item: u64 = rng.gen();
            filter.insert(&item);
            items.push(item);
        }
        check_invariants(&filter);

        items.shuffle(&mut rng);
        for item in items.iter().take(50) {
            assert!(filter.remove(item));
        }
        check_invariants(&filter);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_ser_de() {
        let mut filter = VariableQuotientFilter::<String>::new(100, 8);
        filter.insert("foo");

        let serialized_filter = bincode::serialize(&filter).unwrap();
        let de_filter: VariableQuotientFilter<String> =
            bincode::deserialize(&serialized_filter).unwrap();

        assert!(de_filter.contains("foo"));
        assert_eq!(filter.quotient_bits(), de_filter.quotient_bits());
        assert_eq!(filter.remainder_bits(), de_filter.remainder_bits());
        assert_eq!(filter.slot_vec, de_filter.slot_vec);
        assert_eq!(filter.len(), de_filter.len());
        assert_eq!(filter.hasher(), de_filter.hasher());
    }
}

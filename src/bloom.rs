//! Counting Bloom filter whose counter array operates in two phases.

use crate::bitstring_vec::BitstringVec;
use crate::util;
use crate::SipHasherBuilder;
#[cfg(feature = "serde")]
use serde_crate::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::cmp;
use std::f64::consts::LN_2;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

const DEFAULT_FALSE_POSITIVE_PROBABILITY: f64 = 0.04;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
enum Phase {
    Split,
    Merged,
}

/// A space-efficient probabilistic data structure to test for membership in a set, with the
/// ability to remove items.
///
/// A counting Bloom filter replaces the bits of a classical Bloom filter with small counters so
/// that items can be deleted again. This implementation additionally splits each counter into two
/// independent halves while the filter is lightly loaded: the low half is fed by the first `k`
/// hash functions and the high half by a second set of `k`, so the filter initially behaves like
/// two interleaved Bloom filters with `2k` probes per item without doubling its memory. Once the
/// filter reaches half of its target capacity, the high halves are discarded, every counter
/// becomes a single full-width value, and all further operations use `k` probes.
///
/// Counter saturation is not checked in release builds; callers must respect the capacity the
/// filter was constructed with. Debug builds assert on counter overflow.
///
/// # Examples
///
/// ```
/// use variable_filters::bloom::TwoPhaseBloomFilter;
///
/// let mut filter = TwoPhaseBloomFilter::<String>::new(100, 8);
///
/// assert!(!filter.contains("foo"));
/// filter.insert("foo");
/// assert!(filter.contains("foo"));
///
/// filter.remove("foo");
/// assert!(!filter.contains("foo"));
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
pub struct TwoPhaseBloomFilter<T, B = SipHasherBuilder> {
    counters: BitstringVec,
    max_key_count: u64,
    hasher_count: u64,
    phase: Phase,
    item_count: u64,
    hash_builder: B,
    _marker: PhantomData<T>,
}

impl<T> TwoPhaseBloomFilter<T> {
    /// Constructs a new, empty `TwoPhaseBloomFilter` with an estimated max capacity of
    /// `max_key_count` items, counters of `bits_per_counter` bits, and a false positive
    /// probability target of 4%.
    ///
    /// # Panics
    ///
    /// Panics if `max_key_count` is 0, or if `bits_per_counter` is zero, odd, or greater than 64.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::new(100, 8);
    /// ```
    pub fn new(max_key_count: usize, bits_per_counter: usize) -> Self {
        Self::with_hasher(
            max_key_count,
            bits_per_counter,
            SipHasherBuilder::from_entropy(),
        )
    }

    /// Constructs a new, empty `TwoPhaseBloomFilter` with an estimated max capacity of
    /// `max_key_count` items, counters of `bits_per_counter` bits, and a false positive
    /// probability target of `fpp`.
    ///
    /// # Panics
    ///
    /// Panics if `max_key_count` is 0, if `bits_per_counter` is zero, odd, or greater than 64,
    /// or if `fpp` is not in the range `(0, 1)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::from_fpp(100, 8, 0.01);
    /// ```
    pub fn from_fpp(max_key_count: usize, bits_per_counter: usize, fpp: f64) -> Self {
        Self::from_fpp_with_hasher(
            max_key_count,
            bits_per_counter,
            fpp,
            SipHasherBuilder::from_entropy(),
        )
    }
}

impl<T, B> TwoPhaseBloomFilter<T, B>
where
    B: BuildHasher,
{
    fn optimal_counter_count(max_key_count: usize, fpp: f64) -> usize {
        ((max_key_count as f64) * -fpp.ln() / (LN_2 * LN_2)).ceil() as usize
    }

    fn optimal_hasher_count(max_key_count: usize, counter_count: usize) -> u64 {
        cmp::max(
            1,
            ((counter_count as f64) * LN_2 / (max_key_count as f64)).round() as u64,
        )
    }

    /// Constructs a new, empty `TwoPhaseBloomFilter` with an estimated max capacity of
    /// `max_key_count` items, counters of `bits_per_counter` bits, a false positive probability
    /// target of 4%, and a specified hasher builder.
    ///
    /// # Panics
    ///
    /// Panics if `max_key_count` is 0, or if `bits_per_counter` is zero, odd, or greater than 64.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    /// use variable_filters::SipHasherBuilder;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::with_hasher(
    ///     100,
    ///     8,
    ///     SipHasherBuilder::from_entropy(),
    /// );
    /// ```
    pub fn with_hasher(max_key_count: usize, bits_per_counter: usize, hash_builder: B) -> Self {
        Self::from_fpp_with_hasher(
            max_key_count,
            bits_per_counter,
            DEFAULT_FALSE_POSITIVE_PROBABILITY,
            hash_builder,
        )
    }

    /// Constructs a new, empty `TwoPhaseBloomFilter` with an estimated max capacity of
    /// `max_key_count` items, counters of `bits_per_counter` bits, a false positive probability
    /// target of `fpp`, and a specified hasher builder.
    ///
    /// # Panics
    ///
    /// Panics if `max_key_count` is 0, if `bits_per_counter` is zero, odd, or greater than 64,
    /// or if `fpp` is not in the range `(0, 1)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    /// use variable_filters::SipHasherBuilder;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::from_fpp_with_hasher(
    ///     100,
    ///     8,
    ///     0.01,
    ///     SipHasherBuilder::from_entropy(),
    /// );
    /// ```
    pub fn from_fpp_with_hasher(
        max_key_count: usize,
        bits_per_counter: usize,
        fpp: f64,
        hash_builder: B,
    ) -> Self {
        assert!(max_key_count > 0);
        assert!(bits_per_counter > 0 && bits_per_counter <= 64 && bits_per_counter % 2 == 0);
        assert!(fpp > 0.0 && fpp < 1.0);
        let counter_count = Self::optimal_counter_count(max_key_count, fpp);
        TwoPhaseBloomFilter {
            counters: BitstringVec::new(bits_per_counter, counter_count),
            max_key_count: max_key_count as u64,
            hasher_count: Self::optimal_hasher_count(max_key_count, counter_count),
            phase: Phase::Split,
            item_count: 0,
            hash_builder,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn counter_mask(&self) -> u64 {
        let bits = self.counters.bit_count();
        if bits == 64 {
            !0
        } else {
            (1u64 << bits) - 1
        }
    }

    #[inline]
    fn half_bits(&self) -> u64 {
        (self.counters.bit_count() / 2) as u64
    }

    #[inline]
    fn probe_index(&self, h1: u64, h2: u64, i: u64) -> usize {
        (h1.wrapping_add(h2.wrapping_mul(i)) % self.counters.len() as u64) as usize
    }

    fn split_hash<U>(&self, item: &U) -> (u64, u64)
    where
        T: Borrow<U>,
        U: Hash + ?Sized,
    {
        let hash = util::hash(&self.hash_builder, item);
        (hash & 0xffff_ffff, hash >> 32)
    }

    fn merge_counters(&mut self) {
        let half_mask = (1u64 << self.half_bits()) - 1;
        for index in 0..self.counters.len() {
            let counter = self.counters.get(index);
            self.counters.set(index, counter & half_mask);
        }
        self.phase = Phase::Merged;
    }

    /// Inserts an element into the two-phase Bloom filter.
    ///
    /// Counter saturation is unchecked in release builds; inserting beyond the constructed
    /// capacity wraps counters silently and corrupts membership answers.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let mut filter = TwoPhaseBloomFilter::<String>::new(100, 8);
    /// filter.insert("foo");
    /// ```
    pub fn insert<U>(&mut self, item: &U) -> bool
    where
        T: Borrow<U>,
        U: Hash + ?Sized,
    {
        let (h1, h2) = self.split_hash(item);
        let half_bits = self.half_bits();
        let counter_mask = self.counter_mask();
        match self.phase {
            Phase::Split => {
                let upper_unit = 1u64 << half_bits;
                let half_mask = upper_unit - 1;
                for i in 0..self.hasher_count * 2 {
                    let index = self.probe_index(h1, h2, i);
                    let counter = self.counters.get(index);
                    let delta = if i >= self.hasher_count {
                        debug_assert!(
                            counter >> half_bits != half_mask,
                            "high half-counter saturated"
                        );
                        upper_unit
                    } else {
                        debug_assert!(counter & half_mask != half_mask, "low half-counter saturated");
                        1
                    };
                    self.counters
                        .set(index, counter.wrapping_add(delta) & counter_mask);
                }
                self.item_count += 1;
                if self.item_count >= self.max_key_count / 2 {
                    self.merge_counters();
                }
            }
            Phase::Merged => {
                for i in 0..self.hasher_count {
                    let index = self.probe_index(h1, h2, i);
                    let counter = self.counters.get(index);
                    debug_assert!(counter != counter_mask, "counter saturated");
                    self.counters
                        .set(index, counter.wrapping_add(1) & counter_mask);
                }
                self.item_count += 1;
            }
        }
        true
    }

    /// Checks if an element is possibly in the two-phase Bloom filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let mut filter = TwoPhaseBloomFilter::<String>::new(100, 8);
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
        let (h1, h2) = self.split_hash(item);
        let probe_count = match self.phase {
            Phase::Split => self.hasher_count * 2,
            Phase::Merged => self.hasher_count,
        };
        (0..probe_count).all(|i| self.counters.get(self.probe_index(h1, h2, i)) != 0)
    }

    /// Removes an element from the two-phase Bloom filter. Returns `false` and leaves the filter
    /// unchanged when any counter the element probes is already zero, which means the element
    /// was never inserted or was already removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let mut filter = TwoPhaseBloomFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// assert!(filter.remove("foo"));
    /// assert!(!filter.contains("foo"));
    /// assert!(!filter.remove("foo"));
    /// ```
    pub fn remove<U>(&mut self, item: &U) -> bool
    where
        T: Borrow<U>,
        U: Hash + ?Sized,
    {
        let (h1, h2) = self.split_hash(item);
        let half_bits = self.half_bits();
        let counter_mask = self.counter_mask();
        match self.phase {
            Phase::Split => {
                let upper_unit = 1u64 << half_bits;
                let half_mask = upper_unit - 1;
                let probe_count = self.hasher_count * 2;
                // verify the probed halves before touching any counter
                for i in 0..probe_count {
                    let counter = self.counters.get(self.probe_index(h1, h2, i));
                    let half = if i >= self.hasher_count {
                        counter >> half_bits
                    } else {
                        counter & half_mask
                    };
                    if half == 0 {
                        return false;
                    }
                }
                for i in 0..probe_count {
                    let index = self.probe_index(h1, h2, i);
                    let counter = self.counters.get(index);
                    let delta = if i >= self.hasher_count { upper_unit } else { 1 };
                    self.counters
                        .set(index, counter.wrapping_sub(delta) & counter_mask);
                }
            }
            Phase::Merged => {
                for i in 0..self.hasher_count {
                    if self.counters.get(self.probe_index(h1, h2, i)) == 0 {
                        return false;
                    }
                }
                for i in 0..self.hasher_count {
                    let index = self.probe_index(h1, h2, i);
                    let counter = self.counters.get(index);
                    self.counters.set(index, counter - 1);
                }
            }
        }
        self.item_count -= 1;
        true
    }

    /// Clears the two-phase Bloom filter, removing all elements and returning the counter array
    /// to its initial split layout.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let mut filter = TwoPhaseBloomFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// filter.clear();
    ///
    /// assert!(!filter.contains("foo"));
    /// ```
    pub fn clear(&mut self) {
        self.counters.clear();
        self.item_count = 0;
        self.phase = Phase::Split;
    }

    /// Returns the number of items in the two-phase Bloom filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let mut filter = TwoPhaseBloomFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// assert_eq!(filter.len(), 1);
    /// ```
    pub fn len(&self) -> usize {
        self.item_count as usize
    }

    /// Returns `true` if the two-phase Bloom filter is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::new(100, 8);
    ///
    /// assert!(filter.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }

    /// Returns the number of counters in the two-phase Bloom filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::from_fpp(100, 8, 0.04);
    ///
    /// assert_eq!(filter.counter_count(), 670);
    /// ```
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Returns the number of hash functions used in the merged phase. The split phase probes
    /// twice as many positions.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::from_fpp(100, 8, 0.04);
    ///
    /// assert_eq!(filter.hasher_count(), 5);
    /// ```
    pub fn hasher_count(&self) -> u64 {
        self.hasher_count
    }

    /// Returns `true` once the counter array has merged into its full-width layout. The merge
    /// happens after the insert that brings the filter to half of its target capacity and is
    /// never undone short of [`clear`](TwoPhaseBloomFilter::clear).
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::new(100, 8);
    ///
    /// assert!(!filter.is_merged());
    /// ```
    pub fn is_merged(&self) -> bool {
        self.phase == Phase::Merged
    }

    /// Returns the size of the counter array in bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::from_fpp(100, 8, 0.04);
    ///
    /// assert_eq!(filter.size_in_bytes(), 672);
    /// ```
    pub fn size_in_bytes(&self) -> usize {
        (self.counters.len() * self.counters.bit_count() + 63) / 64 * 8
    }

    /// Returns the ratio of items present to the capacity the filter was constructed with.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let mut filter = TwoPhaseBloomFilter::<String>::new(100, 8);
    ///
    /// filter.insert("foo");
    /// assert!((filter.load_factor() - 0.01).abs() < std::f64::EPSILON);
    /// ```
    pub fn load_factor(&self) -> f64 {
        self.item_count as f64 / self.max_key_count as f64
    }

    /// Returns the number of bits of memory used per item present.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let mut filter = TwoPhaseBloomFilter::<String>::new(100, 8);
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
    /// use variable_filters::bloom::TwoPhaseBloomFilter;
    ///
    /// let filter = TwoPhaseBloomFilter::<String>::new(100, 8);
    /// let hasher = filter.hasher();
    /// ```
    pub fn hasher(&self) -> &B {
        &self.hash_builder
    }
}

#[cfg(test)]
mod tests {
    use super::TwoPhaseBloomFilter;
    use crate::util::tests::hash_builder_1;

    #[test]
    fn test_new() {
        let filter = TwoPhaseBloomFilter::<String>::with_hasher(100, 8, hash_builder_1());
        assert!(filter.is_empty());
        assert_eq!(filter.len(), 0);
        assert_eq!(filter.counter_count(), 670);
        assert_eq!(filter.hasher_count(), 5);
        assert!(!filter.is_merged());
    }

    #[test]
    fn test_insert() {
        let mut filter = TwoPhaseBloomFilter::<String>::with_hasher(100, 8, hash_builder_1());
        assert!(filter.insert("foo"));
        assert_eq!(filter.len(), 1);
        assert!(!filter.is_empty());
        assert!(filter.contains("foo"));
    }

    #[test]
    fn test_remove() {
        let mut filter = TwoPhaseBloomFilter::<String>::with_hasher(100, 8, hash_builder_1());
        filter.insert("foo");
        assert!(filter.remove("foo"));
        assert_eq!(filter.len(), 0);
        assert!(!filter.contains("foo"));
    }

    #[test]
    fn test_remove_missing() {
        let mut filter = TwoPhaseBloomFilter::<String>::with_hasher(100, 8, hash_builder_1());
        filter.insert("foo");
        assert!(!filter.remove("bar"));
        assert_eq!(filter.len(), 1);
        assert!(filter.contains("foo"));
    }

    #[test]
    fn test_clear() {
        let mut filter = TwoPhaseBloomFilter::<usize>::with_hasher(100, 8, hash_builder_1());
        for i in 0..60 {
            filter.insert(&i);
        }
        assert!(filter.is_merged());

        filter.clear();
        assert!(filter.is_empty());
        assert!(!filter.is_merged());
        for i in 0..60 {
            assert!(!filter.contains(&i));
        }
    }

    #[test]
    fn test_merge_is_permanent_and_keeps_earlier_items() {
        let mut filter = TwoPhaseBloomFilter::<usize>::with_hasher(100, 8, hash_builder_1());
        for i in 0..49 {
            filter.insert(&i);
            assert!(!filter.is_merged());
        }
        filter.insert(&49);
        assert!(filter.is_merged());

        for i in 50..80 {
            filter.insert(&i);
        }
        assert!(filter.is_merged());

        // items inserted before the merge survive it
        for i in 0..80 {
            assert!(filter.contains(&i));
        }
    }

    #[test]
    fn test_half_capacity_false_positive_rate() {
        let item_count = 100_000;
        let mut filter =
            TwoPhaseBloomFilter::<u64>::from_fpp_with_hasher(item_count, 8, 0.04, hash_builder_1());

        for i in 0..item_count as u64 / 2 {
            filter.insert(&i);
        }
        assert!(filter.is_merged());
        assert_eq!(filter.len(), item_count / 2);

        for i in 0..item_count as u64 / 2 {
            assert!(filter.contains(&i));
        }

        let false_queries = (item_count as u64..2 * item_count as u64)
            .filter(|i| filter.contains(i))
            .count();
        assert!((false_queries as f64) < 0.06 * item_count as f64);
    }

    #[test]
    fn test_delete_all_zeroes_counters() {
        let item_count = 10_000;
        let mut filter =
            TwoPhaseBloomFilter::<u64>::with_hasher(item_count, 8, hash_builder_1());

        for i in 0..item_count as u64 {
            filter.insert(&i);
        }
        assert!(filter.is_merged());

        for i in 0..item_count as u64 {
            assert!(filter.remove(&i));
        }
        assert!(filter.is_empty());
        assert_eq!(filter.counters.occupied_len(), 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_ser_de() {
        let mut filter = TwoPhaseBloomFilter::<String>::with_hasher(100, 8, hash_builder_1());
        filter.insert("foo");

        let serialized_filter = bincode::serialize(&filter).unwrap();
        let de_filter: TwoPhaseBloomFilter<String> =
            bincode::deserialize(&serialized_filter).unwrap();

        assert!(de_filter.contains("foo"));
        assert_eq!(filter.counters, de_filter.counters);
        assert_eq!(filter.len(), de_filter.len());
        assert_eq!(filter.hasher(), de_filter.hasher());
    }
}

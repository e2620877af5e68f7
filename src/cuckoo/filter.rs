use crate::cuckoo::table::{BucketInsert, TagTable, TagTable12};
use crate::cuckoo::{masked_tag, MAX_KICKS, SLOTS_PER_BUCKET};
use crate::util;
use crate::SipHasherBuilder;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
#[cfg(feature = "serde")]
use serde_crate::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::cmp;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
struct Victim {
    index: u64,
    tag: u64,
}

/// A space-efficient probabilistic data structure to test for membership in a set, with the
/// ability to remove items.
///
/// A cuckoo filter is based on cuckoo hashing and stores a short fingerprint of each item in one
/// of two candidate buckets. This variant re-encodes each bucket as its occupancy changes: a
/// bucket holding a single fingerprint stores almost four times as many of the item's hash bits
/// as a full bucket, so lookups against lightly loaded buckets are far more selective. The tag
/// width of a full bucket is fixed by the table type parameter ([`TagTable8`], [`TagTable12`],
/// or [`TagTable16`]).
///
/// When an insertion exhausts its relocation budget the displaced fingerprint is parked in a
/// single victim slot; the filter then refuses further insertions until a removal frees it.
///
/// [`TagTable8`]: crate::cuckoo::TagTable8
/// [`TagTable12`]: crate::cuckoo::TagTable12
/// [`TagTable16`]: crate::cuckoo::TagTable16
///
/// # Examples
///
/// ```
/// use variable_filters::cuckoo::VariableCuckooFilter;
///
/// let mut filter = VariableCuckooFilter::<String>::new(100);
///
/// assert!(!filter.contains("foo"));
/// filter.insert("foo");
/// assert!(filter.contains("foo"));
///
/// filter.remove("foo");
/// assert!(!filter.contains("foo"));
///
/// assert_eq!(filter.len(), 0);
/// assert_eq!(filter.bucket_count(), 32);
/// assert_eq!(filter.tag_bits(), 12);
/// ```
#[derive(Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
pub struct VariableCuckooFilter<T, S = TagTable12, B = SipHasherBuilder> {
    table: S,
    victim: Option<Victim>,
    item_count: u64,
    hash_builders: [B; 2],
    #[cfg_attr(feature = "serde", serde(skip, default = "XorShiftRng::from_entropy"))]
    rng: XorShiftRng,
    _marker: PhantomData<T>,
}

impl<T, S> VariableCuckooFilter<T, S>
where
    S: TagTable,
{
    /// Constructs a new, empty `VariableCuckooFilter` with an estimated max capacity of
    /// `max_key_count` items. The number of buckets is rounded up to a power of two and doubled
    /// when the requested capacity would fill more than 96% of the slots.
    ///
    /// # Panics
    ///
    /// Panics if `max_key_count` is 0.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::{TagTable16, VariableCuckooFilter};
    ///
    /// let filter = VariableCuckooFilter::<String, TagTable16>::new(100);
    /// ```
    pub fn new(max_key_count: usize) -> Self {
        Self::with_hashers(
            max_key_count,
            [
                SipHasherBuilder::from_entropy(),
                SipHasherBuilder::from_entropy(),
            ],
        )
    }
}

impl<T, S, B> VariableCuckooFilter<T, S, B>
where
    S: TagTable,
    B: BuildHasher,
{
    /// Constructs a new, empty `VariableCuckooFilter` with an estimated max capacity of
    /// `max_key_count` items, and two hasher builders: one for bucket indexes, one for
    /// fingerprints.
    ///
    /// # Panics
    ///
    /// Panics if `max_key_count` is 0.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    /// use variable_filters::SipHasherBuilder;
    ///
    /// let filter = VariableCuckooFilter::<String>::with_hashers(
    ///     100,
    ///     [SipHasherBuilder::from_seed(0, 0), SipHasherBuilder::from_seed(1, 1)],
    /// );
    /// ```
    pub fn with_hashers(max_key_count: usize, hash_builders: [B; 2]) -> Self {
        assert!(max_key_count > 0);
        let mut num_buckets =
            (cmp::max(1, max_key_count / SLOTS_PER_BUCKET) as u64).next_power_of_two();
        let load = max_key_count as f64 / (num_buckets * SLOTS_PER_BUCKET as u64) as f64;
        if load > 0.96 {
            num_buckets <<= 1;
        }
        VariableCuckooFilter {
            table: S::with_buckets(num_buckets),
            victim: None,
            item_count: 0,
            hash_builders,
            rng: XorShiftRng::from_entropy(),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn index_hash(&self, hash: u64) -> u64 {
        hash & (self.table.num_buckets() - 1)
    }

    #[inline]
    fn alt_index(&self, index: u64, unmasked_tag: u64) -> u64 {
        self.index_hash(index ^ masked_tag(unmasked_tag, S::TAG_BITS).wrapping_mul(0x5bd1_e995))
    }

    fn index_and_tag<U>(&self, item: &U) -> (u64, u64)
    where
        T: Borrow<U>,
        U: Hash + ?Sized,
    {
        let index = self.index_hash(util::hash(&self.hash_builders[0], item));
        let unmasked_tag = util::hash(&self.hash_builders[1], item);
        (index, unmasked_tag)
    }

    fn insert_impl(&mut self, index: u64, unmasked_tag: u64) -> bool {
        let mut cur_index = index;
        let mut cur_tag = unmasked_tag;

        for count in 0..MAX_KICKS {
            // the first failed attempt tries the other bucket instead of evicting
            let kickout = count > 0;
            match self
                .table
                .insert_tag(cur_index, cur_tag, kickout, &mut self.rng)
            {
                BucketInsert::Stored => {
                    self.item_count += 1;
                    return true;
                }
                BucketInsert::Rejected => {}
                BucketInsert::Evicted(old_tag) => cur_tag = old_tag,
            }
            cur_index = self.alt_index(cur_index, cur_tag);
        }

        self.victim = Some(Victim {
            index: cur_index,
            tag: cur_tag,
        });
        self.item_count += 1;
        true
    }

    /// Inserts an element into the variable cuckoo filter. Returns `false` without inserting
    /// when the filter is at capacity, which is the case while the victim slot is occupied.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let mut filter = VariableCuckooFilter::<String>::new(100);
    /// assert!(filter.insert("foo"));
    /// ```
    pub fn insert<U>(&mut self, item: &U) -> bool
    where
        T: Borrow<U>,
        U: Hash + ?Sized,
    {
        if self.victim.is_some() {
            return false;
        }
        let (index, unmasked_tag) = self.index_and_tag(item);
        self.insert_impl(index, unmasked_tag)
    }

    /// Checks if an element is possibly in the variable cuckoo filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let mut filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// filter.insert("foo");
    /// assert!(filter.contains("foo"));
    /// ```
    pub fn contains<U>(&self, item: &U) -> bool
    where
        T: Borrow<U>,
        U: Hash + ?Sized,
    {
        let (index_1, unmasked_tag) = self.index_and_tag(item);
        let index_2 = self.alt_index(index_1, unmasked_tag);

        if let Some(victim) = &self.victim {
            if (victim.index == index_1 || victim.index == index_2)
                && victim.tag == masked_tag(unmasked_tag, S::TAG_BITS)
            {
                return true;
            }
        }

        self.table.find_tag(index_1, unmasked_tag) || self.table.find_tag(index_2, unmasked_tag)
    }

    /// Removes an element from the variable cuckoo filter. Returns `false` when no stored
    /// fingerprint matches the element. A successful removal frees the victim slot, if it was
    /// occupied, by relocating the parked fingerprint back into the table.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let mut filter = VariableCuckooFilter::<String>::new(100);
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
        let (index_1, unmasked_tag) = self.index_and_tag(item);
        let index_2 = self.alt_index(index_1, unmasked_tag);

        let mut best_index = 0;
        let mut best_width = 0;
        self.table
            .find_widest_match(index_1, unmasked_tag, &mut best_index, &mut best_width);
        self.table
            .find_widest_match(index_2, unmasked_tag, &mut best_index, &mut best_width);

        if best_width == 0 {
            if let Some(victim) = &self.victim {
                if (victim.index == index_1 || victim.index == index_2)
                    && victim.tag == masked_tag(unmasked_tag, S::TAG_BITS)
                {
                    self.victim = None;
                    self.item_count -= 1;
                    return true;
                }
            }
            return false;
        }

        self.table
            .delete_tag(best_index, masked_tag(unmasked_tag, best_width));

        if let Some(victim) = self.victim.take() {
            self.insert_impl(victim.index, victim.tag);
        }
        self.item_count -= 1;
        true
    }

    /// Clears the variable cuckoo filter, removing all elements.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let mut filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// filter.insert("foo");
    /// filter.clear();
    ///
    /// assert!(!filter.contains("foo"));
    /// ```
    pub fn clear(&mut self) {
        self.table.clear();
        self.victim = None;
        self.item_count = 0;
    }

    /// Returns the number of items in the variable cuckoo filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let mut filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// filter.insert("foo");
    /// assert_eq!(filter.len(), 1);
    /// ```
    pub fn len(&self) -> usize {
        self.item_count as usize
    }

    /// Returns `true` if the variable cuckoo filter is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// assert!(filter.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }

    /// Returns `true` if the victim slot is occupied, in which case the next insertion fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// assert!(!filter.is_nearly_full());
    /// ```
    pub fn is_nearly_full(&self) -> bool {
        self.victim.is_some()
    }

    /// Returns the number of buckets in the variable cuckoo filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// assert_eq!(filter.bucket_count(), 32);
    /// ```
    pub fn bucket_count(&self) -> u64 {
        self.table.num_buckets()
    }

    /// Returns the number of bits of a full-width fingerprint.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// assert_eq!(filter.tag_bits(), 12);
    /// ```
    pub fn tag_bits(&self) -> u32 {
        S::TAG_BITS
    }

    /// Returns the size of the bucket table in bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// assert_eq!(filter.size_in_bytes(), 192);
    /// ```
    pub fn size_in_bytes(&self) -> usize {
        self.table.size_in_bytes()
    }

    /// Returns the ratio of items present to fingerprint slots.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let mut filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// filter.insert("foo");
    /// assert!(filter.load_factor() > 0.0);
    /// ```
    pub fn load_factor(&self) -> f64 {
        self.item_count as f64 / self.table.size_in_tags() as f64
    }

    /// Returns the number of bits of memory used per item present.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let mut filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// filter.insert("foo");
    /// assert!(filter.bits_per_item() > 0.0);
    /// ```
    pub fn bits_per_item(&self) -> f64 {
        8.0 * self.table.size_in_bytes() as f64 / self.item_count as f64
    }

    /// Returns the number of buckets currently holding 0, 1, 2, 3, and 4 fingerprints.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let filter = VariableCuckooFilter::<String>::new(100);
    ///
    /// assert_eq!(filter.bucket_occupancy(), [32, 0, 0, 0, 0]);
    /// ```
    pub fn bucket_occupancy(&self) -> [u64; 5] {
        let mut counts = [0; 5];
        self.table.count_occupancy(&mut counts);
        counts
    }

    /// Returns a reference to the filter's hasher builders.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::cuckoo::VariableCuckooFilter;
    ///
    /// let filter = VariableCuckooFilter::<String>::new(100);
    /// let hashers = filter.hashers();
    /// ```
    pub fn hashers(&self) -> &[B; 2] {
        &self.hash_builders
    }
}

impl<T, S, B> PartialEq for VariableCuckooFilter<T, S, B>
where
    S: PartialEq,
    B: PartialEq,
{
    fn eq(&self, other: &VariableCuckooFilter<T, S, B>) -> bool {
        self.table == other.table
            && self.victim == other.victim
            && self.item_count == other.item_count
            && self.hash_builders == other.hash_builders
    }
}

#[cfg(test)]
mod tests {
    use super::VariableCuckooFilter;
    use crate::cuckoo::{TagTable12, TagTable16, TagTable8};
    use crate::util::tests::{hash_builder_1, hash_builder_2};

    #[test]
    fn test_new() {
        let filter = VariableCuckooFilter::<String>::with_hashers(
            100,
            [hash_builder_1(), hash_builder_2()],
        );
        assert_eq!(filter.len(), 0);
        assert!(filter.is_empty());
        assert!(!filter.is_nearly_full());
        assert_eq!(filter.bucket_count(), 32);
        assert_eq!(filter.tag_bits(), 12);
        assert_eq!(filter.size_in_bytes(), 192);
        assert_eq!(filter.bucket_occupancy(), [32, 0, 0, 0, 0]);
    }

    #[test]
    fn test_insert() {
        let mut filter = VariableCuckooFilter::<String>::with_hashers(
            100,
            [hash_builder_1(), hash_builder_2()],
        );
        assert!(filter.insert("foo"));
        assert_eq!(filter.len(), 1);
        assert!(!filter.is_empty());
        assert!(filter.contains("foo"));
    }

    #[test]
    fn test_insert_duplicates() {
        let mut filter = VariableCuckooFilter::<String>::with_hashers(
            100,
            [hash_builder_1(), hash_builder_2()],
        );
        filter.insert("foo");
        filter.insert("foo");
        assert_eq!(filter.len(), 2);
        assert!(filter.contains("foo"));

        assert!(filter.remove("foo"));
        assert!(filter.contains("foo"));
        assert!(filter.remove("foo"));
        assert!(!filter.contains("foo"));
        assert_eq!(filter.len(), 0);
    }

    #[test]
    fn test_remove() {
        let mut filter = VariableCuckooFilter::<String>::with_hashers(
            100,
            [hash_builder_1(), hash_builder_2()],
        );
        filter.insert("foo");
        assert!(filter.remove("foo"));

        assert_eq!(filter.len(), 0);
        assert!(filter.is_empty());
        assert!(!filter.contains("foo"));
    }

    #[test]
    fn test_remove_missing() {
        let mut filter = VariableCuckooFilter::<String>::with_hashers(
            100,
            [hash_builder_1(), hash_builder_2()],
        );
        filter.insert("foo");
        assert!(!filter.remove("bar"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut filter = VariableCuckooFilter::<String>::with_hashers(
            100,
            [hash_builder_1(), hash_builder_2()],
        );

        filter.insert("foobar");
        filter.insert("barfoo");
        filter.insert("baz");
        filter.insert("qux");

        filter.clear();

        assert!(filter.is_empty());
        assert!(!filter.contains("baz"));
        assert!(!filter.contains("qux"));
        assert!(!filter.contains("foobar"));
        assert!(!filter.contains("barfoo"));
    }

    #[test]
    fn test_victim_blocks_inserts() {
        // two buckets of four slots each; at most nine items fit, the last in the victim slot
        let mut filter = VariableCuckooFilter::<u64, TagTable12, _>::with_hashers(
            7,
            [hash_builder_1(), hash_builder_2()],
        );
        assert_eq!(filter.bucket_count(), 2);

        let mut inserted = 0u64;
        while inserted < 64 && filter.insert(&inserted) {
            inserted += 1;
        }
        assert!(inserted <= 9);
        assert!(filter.is_nearly_full());
        assert_eq!(filter.len(), inserted as usize);
        for i in 0..inserted {
            assert!(filter.contains(&i));
        }
        assert!(!filter.insert(&64));

        // a removal relocates the victim and frees capacity
        assert!(filter.remove(&0));
        assert_eq!(filter.len(), inserted as usize - 1);
    }

    #[test]
    fn test_sparse_false_positive_rate() {
        let mut filter = VariableCuckooFilter::<u64, TagTable8, _>::with_hashers(
            1024,
            [hash_builder_1(), hash_builder_2()],
        );
        assert_eq!(filter.bucket_count(), 512);

        for i in 0u64..512 {
            assert!(filter.insert(&i));
        }
        for i in 0u64..512 {
            assert!(filter.contains(&i));
        }

        let false_queries = (10_000u64..10_512).filter(|i| filter.contains(i)).count();
        assert!((false_queries as f64) < 0.05 * 512.0);

        for i in 0u64..512 {
            assert!(filter.remove(&i));
        }
        assert_eq!(filter.bucket_occupancy()[0], 512);
        assert_eq!(filter.len(), 0);
    }

    #[test]
    fn test_fill_lookup_drain() {
        let item_count = 1 << 14;
        let mut filter = VariableCuckooFilter::<u64, TagTable16, _>::with_hashers(
            item_count,
            [hash_builder_1(), hash_builder_2()],
        );

        let mut inserted = 0u64;
        while inserted < item_count as u64 && filter.insert(&inserted) {
            inserted += 1;
        }

        for i in 0..inserted {
            assert!(filter.contains(&i));
        }
        for i in 0..inserted {
            assert!(filter.remove(&i));
        }
        assert_eq!(filter.len(), 0);
        assert_eq!(
            filter.bucket_occupancy()[0],
            filter.bucket_count()
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_ser_de() {
        let mut filter = VariableCuckooFilter::<String>::with_hashers(
            100,
            [hash_builder_1(), hash_builder_2()],
        );
        filter.insert("foo");

        let serialized_filter = bincode::serialize(&filter).unwrap();
        let de_filter: VariableCuckooFilter<String> =
            bincode::deserialize(&serialized_filter).unwrap();

        assert!(de_filter.contains("foo"));
        assert_eq!(filter, de_filter);
    }
}

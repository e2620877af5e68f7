//! Fixed-length list of bitstrings.

#[cfg(feature = "serde")]
use serde_crate::{Deserialize, Serialize};
use std::mem;
use std::ops::Range;

/// A fixed-length list of `bit_count`-bit values packed into a `Vec<u64>`.
///
/// Field `index` starts at bit `index * bit_count` of the backing words; a field may straddle a
/// word boundary, in which case the low part is read from one word and the remaining spill bits
/// from the next. Writes touch only the bits of the target field. The whole backing store is
/// allocated at construction and never grows.
///
/// Values passed to [`set`](BitstringVec::set) must already be masked to `bit_count` bits.
///
/// # Examples
///
/// ```
/// use variable_filters::bitstring_vec::BitstringVec;
///
/// let mut bsv = BitstringVec::new(5, 4);
///
/// bsv.set(0, 0b10101);
/// bsv.set(3, 0b00111);
///
/// assert_eq!(bsv.get(0), 0b10101);
/// assert_eq!(bsv.get(3), 0b00111);
/// assert_eq!(bsv.occupied_len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
pub struct BitstringVec {
    blocks: Vec<u64>,
    bit_count: usize,
    occupied_len: usize,
    len: usize,
}

const BLOCK_BIT_COUNT: usize = mem::size_of::<u64>() * 8;

impl BitstringVec {
    #[inline]
    fn get_block_count(bit_count: usize, len: usize) -> usize {
        (bit_count * len + BLOCK_BIT_COUNT - 1) / BLOCK_BIT_COUNT
    }

    #[inline]
    fn get_mask(size: usize) -> u64 {
        if size == 64 {
            !0
        } else {
            (1u64 << size) - 1
        }
    }

    /// Constructs a new `BitstringVec` of `len` bitstrings of `bit_count` bits each, all
    /// initialized to zero.
    ///
    /// # Panics
    ///
    /// Panics if `bit_count` is 0 or greater than 64.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bitstring_vec::BitstringVec;
    ///
    /// let bsv = BitstringVec::new(5, 4);
    /// assert_eq!(bsv.len(), 4);
    /// assert_eq!(bsv.get(0), 0);
    /// ```
    pub fn new(bit_count: usize, len: usize) -> Self {
        assert!(bit_count > 0 && bit_count <= 64);
        BitstringVec {
            blocks: vec![0; Self::get_block_count(bit_count, len)],
            bit_count,
            occupied_len: 0,
            len,
        }
    }

    /// Sets the value at index `index` to `bitstring`.
    ///
    /// # Panics
    ///
    /// Panics if attempt to set an index out-of-bounds.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bitstring_vec::BitstringVec;
    ///
    /// let mut bsv = BitstringVec::new(5, 4);
    /// bsv.set(1, 1);
    ///
    /// assert_eq!(bsv.get(0), 0);
    /// assert_eq!(bsv.get(1), 1);
    /// ```
    pub fn set(&mut self, index: usize, bitstring: u64) {
        assert!(index < self.len);
        let prev_is_zero = self.get(index) == 0;
        let bit_offset = index * self.bit_count;
        let table_index = bit_offset / 64;
        let bit_index = bit_offset % 64;
        let spill = self.bit_count as isize - (64 - bit_index as isize);
        self.blocks[table_index] &= !(Self::get_mask(self.bit_count) << bit_index);
        self.blocks[table_index] |= bitstring << bit_index;
        if spill > 0 {
            let offset = self.bit_count - spill as usize;
            self.blocks[table_index + 1] &= !Self::get_mask(spill as usize);
            self.blocks[table_index + 1] |= bitstring >> offset;
        }
        let curr_is_zero = bitstring == 0;
        if prev_is_zero != curr_is_zero {
            if curr_is_zero {
                self.occupied_len -= 1;
            } else {
                self.occupied_len += 1;
            }
        }
    }

    /// Returns the value at index `index`.
    ///
    /// # Panics
    ///
    /// Panics if attempt to get an index out-of-bounds.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bitstring_vec::BitstringVec;
    ///
    /// let mut bsv = BitstringVec::new(5, 4);
    /// bsv.set(1, 1);
    ///
    /// assert_eq!(bsv.get(0), 0);
    /// assert_eq!(bsv.get(1), 1);
    /// ```
    pub fn get(&self, index: usize) -> u64 {
        assert!(index < self.len);
        let bit_offset = index * self.bit_count;
        let table_index = bit_offset / 64;
        let bit_index = bit_offset % 64;
        let spill = self.bit_count as isize - (64 - bit_index as isize);
        let mut bitstring = (self.blocks[table_index] >> bit_index) & Self::get_mask(self.bit_count);
        if spill > 0 {
            let offset = self.bit_count - spill as usize;
            bitstring |= (self.blocks[table_index + 1] & Self::get_mask(spill as usize)) << offset;
        }
        bitstring
    }

    /// Sets all bitstrings to zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bitstring_vec::BitstringVec;
    ///
    /// let mut bsv = BitstringVec::new(5, 4);
    /// bsv.set(1, 1);
    /// bsv.clear();
    ///
    /// assert_eq!(bsv.get(1), 0);
    /// assert_eq!(bsv.occupied_len(), 0);
    /// ```
    pub fn clear(&mut self) {
        self.occupied_len = 0;
        for block in &mut self.blocks {
            *block = 0;
        }
    }

    /// Returns an iterator over the bitstrings in index order.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bitstring_vec::BitstringVec;
    ///
    /// let mut bsv = BitstringVec::new(5, 2);
    /// bsv.set(1, 1);
    ///
    /// assert_eq!(bsv.iter().collect::<Vec<u64>>(), vec![0, 1]);
    /// ```
    pub fn iter(&self) -> BitstringVecIter<'_> {
        BitstringVecIter {
            bitstring_vec: self,
            range: 0..self.len,
        }
    }

    /// Returns the number of bitstrings.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bitstring_vec::BitstringVec;
    ///
    /// let bsv = BitstringVec::new(5, 4);
    ///
    /// assert_eq!(bsv.len(), 4);
    /// ```
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the `BitstringVec` holds no bitstrings.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bitstring_vec::BitstringVec;
    ///
    /// let bsv = BitstringVec::new(5, 4);
    ///
    /// assert!(!bsv.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of non-zero bitstrings.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bitstring_vec::BitstringVec;
    ///
    /// let mut bsv = BitstringVec::new(5, 4);
    /// bsv.set(1, 1);
    ///
    /// assert_eq!(bsv.occupied_len(), 1);
    /// ```
    pub fn occupied_len(&self) -> usize {
        self.occupied_len
    }

    /// Returns the number of bits in each bitstring.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::bitstring_vec::BitstringVec;
    ///
    /// let bsv = BitstringVec::new(5, 4);
    ///
    /// assert_eq!(bsv.bit_count(), 5);
    /// ```
    pub fn bit_count(&self) -> usize {
        self.bit_count
    }
}

/// An iterator over the bitstrings of a `BitstringVec`.
pub struct BitstringVecIter<'a> {
    bitstring_vec: &'a BitstringVec,
    range: Range<usize>,
}

impl<'a> Iterator for BitstringVecIter<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.range.next().map(|index| self.bitstring_vec.get(index))
    }
}

impl<'a> IntoIterator for &'a BitstringVec {
    type IntoIter = BitstringVecIter<'a>;
    type Item = u64;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::BitstringVec;
    use rand::{Rng, SeedableRng};

    fn mask(bitstring: u64, bit_count: usize) -> u64 {
        bitstring & BitstringVec::get_mask(bit_count)
    }

    fn gen_bitstring(rng: &mut impl Rng, bit_count: usize) -> u64 {
        let mut bitstring = 0;
        while bitstring == 0 {
            bitstring = mask(rng.gen(), bit_count);
        }
        bitstring
    }

    fn test_with_bit_count(bit_count: usize) {
        let len = 8;
        let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(bit_count as u64);
        let mut bsv = BitstringVec::new(bit_count, len);
        let mut vec = vec![0; len];

        assert_eq!(bsv.len(), len);
        assert_eq!(bsv.bit_count(), bit_count);

        bsv.set(0, 0);
        assert_eq!(bsv.occupied_len(), 0);

        for i in 0..len {
            let bitstring = gen_bitstring(&mut rng, bit_count);
            bsv.set(i, bitstring);
            vec[i] = bitstring;
            assert_eq!(bsv.occupied_len(), i + 1);
        }

        assert_eq!(bsv.iter().collect::<Vec<u64>>(), vec);

        for i in 0..len {
            assert_eq!(bsv.get(i), vec[i]);
            bsv.set(i, 0);
            assert_eq!(bsv.occupied_len(), len - i - 1);
        }

        for i in 0..len {
            let bitstring = gen_bitstring(&mut rng, bit_count);
            bsv.set(i, bitstring);
        }

        bsv.clear();
        assert_eq!(bsv.occupied_len(), 0);
        for i in 0..len {
            assert_eq!(bsv.get(i), 0);
        }
    }

    #[test]
    fn test_with_bit_count_11() {
        test_with_bit_count(11);
    }

    #[test]
    fn test_with_bit_count_17() {
        test_with_bit_count(17);
    }

    #[test]
    fn test_with_bit_count_32() {
        test_with_bit_count(32);
    }

    #[test]
    fn test_with_bit_count_47() {
        test_with_bit_count(47);
    }

    #[test]
    fn test_with_bit_count_64() {
        test_with_bit_count(64);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_ser_de() {
        let mut bsv = BitstringVec::new(13, 8);
        bsv.set(3, 0b1_0000_0001);

        let serialized = bincode::serialize(&bsv).unwrap();
        let de_bsv: BitstringVec = bincode::deserialize(&serialized).unwrap();

        assert_eq!(bsv, de_bsv);
    }
}

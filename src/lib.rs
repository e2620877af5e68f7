//! # variable-filters
//!
//! `variable-filters` contains approximate set-membership data structures that answer
//! *possibly-present* / *definitely-absent* queries at a fraction of the memory of an exact set.
//! All three filters adapt how much of an item's hash they store to how loaded the structure is,
//! so lightly loaded regions keep longer, more discriminating fingerprints:
//!
//!  - [`bloom::TwoPhaseBloomFilter`] is a counting Bloom filter whose counters start as two
//!    interleaved half-width counters fed by twice the usual number of hash functions, then merge
//!    into single full-width counters once the filter is half full.
//!  - [`cuckoo::VariableCuckooFilter`] is a cuckoo filter whose buckets re-encode up to four
//!    fingerprints at a width that depends on how many slots are occupied.
//!  - [`quotient::VariableQuotientFilter`] is a quotient filter whose remainders occupy one or
//!    two slots depending on load.
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! variable-filters = "*"
//! ```
//!
//! ## References
//!
//!  - [Cuckoo Filter: Practically Better Than Bloom](https://dl.acm.org/citation.cfm?id=2674994)
//!  > Fan, Bin, Dave G. Andersen, Michael Kaminsky, and Michael D. Mitzenmacher. 2014. "Cuckoo
//!  > Filter: Practically Better Than Bloom." In *Proceedings of the 10th ACM International on
//!  > Conference on Emerging Networking Experiments and Technologies*, 75-88. CoNEXT '14.
//!  - [Don't Thrash: How to Cache Your Hash on Flash](https://dl.acm.org/citation.cfm?id=2350275)
//!  > Bender, Michael A., Martin Farach-Colton, Rob Johnson, et al. 2012. "Don't Thrash: How to
//!  > Cache Your Hash on Flash." *Proc. VLDB Endow.* 5 (11): 1627-37.
//!  - [Summary Cache: A Scalable Wide-Area Web Cache Sharing Protocol](https://dl.acm.org/citation.cfm?id=343572)
//!  > Fan, Li, Pei Cao, Jussara Almeida, and Andrei Z. Broder. 2000. "Summary Cache: A Scalable
//!  > Wide-Area Web Cache Sharing Protocol." *IEEE/ACM Trans. Netw.* 8 (3): 281-93.

#![warn(missing_docs)]

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
#[cfg(feature = "serde")]
use serde_crate::{Deserialize, Serialize};
use siphasher::sip::SipHasher;
use std::hash::BuildHasher;

pub mod bitstring_vec;
pub mod bloom;
pub mod cuckoo;
pub mod quotient;
mod util;

/// A hasher builder that builds `SipHasher` keyed by two `u64`s.
///
/// Two builders constructed from distinct seeds behave as independent members of a
/// pairwise-independent hash family, which is what the filters in this crate require.
///
/// # Examples
///
/// ```
/// use variable_filters::SipHasherBuilder;
/// use std::hash::{BuildHasher, Hash, Hasher};
///
/// let hash_builder = SipHasherBuilder::from_entropy();
/// let mut hasher = hash_builder.build_hasher();
/// "foo".hash(&mut hasher);
/// hasher.finish();
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(crate = "serde_crate")
)]
pub struct SipHasherBuilder {
    k0: u64,
    k1: u64,
}

impl SipHasherBuilder {
    /// Constructs a `SipHasherBuilder` with keys drawn from a thread-local source of entropy.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::SipHasherBuilder;
    ///
    /// let hash_builder = SipHasherBuilder::from_entropy();
    /// ```
    pub fn from_entropy() -> Self {
        let mut rng = XorShiftRng::from_entropy();
        SipHasherBuilder {
            k0: rng.gen(),
            k1: rng.gen(),
        }
    }

    /// Constructs a `SipHasherBuilder` with the given keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use variable_filters::SipHasherBuilder;
    ///
    /// let hash_builder = SipHasherBuilder::from_seed(0, 0);
    /// ```
    pub fn from_seed(k0: u64, k1: u64) -> Self {
        SipHasherBuilder { k0, k1 }
    }
}

impl BuildHasher for SipHasherBuilder {
    type Hasher = SipHasher;

    fn build_hasher(&self) -> Self::Hasher {
        SipHasher::new_with_keys(self.k0, self.k1)
    }
}

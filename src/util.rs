use std::hash::{BuildHasher, Hash, Hasher};

pub fn hash<B, U>(hash_builder: &B, item: &U) -> u64
where
    B: BuildHasher,
    U: Hash + ?Sized,
{
    let mut hasher = hash_builder.build_hasher();
    item.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
pub mod tests {
    use crate::SipHasherBuilder;

    pub fn hash_builder_1() -> SipHasherBuilder {
        SipHasherBuilder::from_seed(0, 0)
    }

    pub fn hash_builder_2() -> SipHasherBuilder {
        SipHasherBuilder::from_seed(1, 1)
    }
}

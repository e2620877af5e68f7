use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use variable_filters::bloom::TwoPhaseBloomFilter;

fn bench_insert(c: &mut Criterion) {
    let mut initial_items = 0;
    while initial_items < 1024 {
        c.bench_function(&format!("bench insert {}", initial_items), |b| {
            b.iter_batched_ref(
                || {
                    let mut filter = TwoPhaseBloomFilter::<u32>::new(1024, 8);
                    for i in 0..initial_items {
                        filter.insert(&i);
                    }
                    filter
                },
                |filter| filter.insert(&0xDEAD_BEEF),
                BatchSize::PerIteration,
            )
        });
        initial_items += 128;
    }
}

criterion_group!(benches, bench_insert);
criterion_main!(benches);

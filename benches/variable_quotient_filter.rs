use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use variable_filters::quotient::VariableQuotientFilter;

fn bench_insert(c: &mut Criterion) {
    let mut initial_items = 0;
    while initial_items < 1024 - 32 {
        c.bench_function(&format!("bench insert {}", initial_items), |b| {
            b.iter_batched_ref(
                || {
                    let mut filter = VariableQuotientFilter::<u32>::new(1024, 12);
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

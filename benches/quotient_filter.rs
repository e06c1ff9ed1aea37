use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use persistent_quotient_filter::pool::Pool;
use persistent_quotient_filter::quotient::QuotientFilter;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

const QBITS: u64 = 12;
const RBITS: u64 = 8;

fn filled_filter(fill: usize) -> (tempfile::TempDir, Pool, QuotientFilter) {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = Pool::create(dir.path().join("bench.pool"), 1 << 24).unwrap();
    let filter = QuotientFilter::init(&mut pool, QBITS, RBITS).unwrap();
    let mut rng = XorShiftRng::seed_from_u64(0xbe7c);
    while filter.len(&pool) < fill as u64 {
        filter.insert(&mut pool, rng.gen()).unwrap();
    }
    (dir, pool, filter)
}

fn bench_insert(c: &mut Criterion) {
    let capacity = 1usize << QBITS;
    for &load in &[25usize, 50, 75] {
        c.bench_function(&format!("bench insert at {}% load", load), |b| {
            b.iter_batched_ref(
                || filled_filter(capacity * load / 100),
                |(_dir, pool, filter)| filter.insert(pool, 0xdead_beef).unwrap(),
                BatchSize::PerIteration,
            )
        });
    }
}

fn bench_lookup(c: &mut Criterion) {
    let capacity = 1usize << QBITS;
    let (_dir, pool, filter) = filled_filter(capacity * 3 / 4);
    let mut rng = XorShiftRng::seed_from_u64(0xfeed);
    c.bench_function("bench lookup random", |b| {
        b.iter(|| filter.may_contain(&pool, rng.gen()))
    });
}

// Every slot filled through one wrapped cluster, the worst case for the run
// navigator's linear scans.
fn bench_lookup_single_cluster(c: &mut Criterion) {
    let qbits = 8;
    let dir = tempfile::tempdir().unwrap();
    let mut pool = Pool::create(dir.path().join("bench.pool"), 1 << 20).unwrap();
    let filter = QuotientFilter::init(&mut pool, qbits, 1).unwrap();
    for quotient in 0..1u64 << (qbits - 1) {
        let hash = quotient << 1;
        filter.insert(&mut pool, hash).unwrap();
        filter.insert(&mut pool, hash | 1).unwrap();
    }

    let mut rng = XorShiftRng::seed_from_u64(0xc1c1);
    let mask = (1u64 << (qbits + 1)) - 1;
    c.bench_function("bench lookup single cluster", |b| {
        b.iter(|| filter.may_contain(&pool, rng.gen::<u64>() & mask))
    });
}

criterion_group!(
    benches,
    bench_insert,
    bench_lookup,
    bench_lookup_single_cluster
);
criterion_main!(benches);

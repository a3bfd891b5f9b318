//! Benchmarks for the spatial index and the combinatorial matcher
//! (single-threaded).
//!
//! Run with:
//!   cargo bench --bench matcher
//!   cargo bench matcher -- fast_finder/find_closest_10k

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use starcal::matching::{match_search_rot_shift, FastFinder, MatchConditions};
use starcal::stars::{BaseStar, BaseStarList, Point};
use starcal::transforms::{LinearTransform, Transform};

/// Deterministic star field over a 1000×1000 frame.
fn field(n: usize, seed: u64) -> BaseStarList {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|k| {
            BaseStar::new(
                rng.random_range(0.0..1000.0),
                rng.random_range(0.0..1000.0),
                1000.0 - k as f64,
            )
        })
        .collect()
}

fn bench_find_closest(c: &mut Criterion) {
    let list = field(10_000, 1);
    let finder = FastFinder::new(&list);
    let mut rng = StdRng::seed_from_u64(2);
    let probes: Vec<Point> = (0..1000)
        .map(|_| Point::new(rng.random_range(0.0..1000.0), rng.random_range(0.0..1000.0)))
        .collect();

    c.bench_function("fast_finder/find_closest_10k", |b| {
        b.iter(|| {
            for p in &probes {
                black_box(finder.find_closest(p, 30.0, None));
            }
        })
    });
}

fn bench_match_search(c: &mut Criterion) {
    let list1 = field(100, 3);
    let shift = LinearTransform::shift(12.0, -7.0);
    let list2: BaseStarList = list1
        .iter()
        .map(|s| {
            let p = shift.apply(&s.pos);
            BaseStar::new(p.x, p.y, s.flux)
        })
        .collect();
    let conditions = MatchConditions::default();

    c.bench_function("matcher/rot_shift_100", |b| {
        b.iter(|| black_box(match_search_rot_shift(&list1, &list2, &conditions)))
    });
}

criterion_group!(benches, bench_find_closest, bench_match_search);
criterion_main!(benches);

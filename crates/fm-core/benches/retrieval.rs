//! Retrieval benchmarks over a 2,000-node store, one per query mode.

use criterion::{Criterion, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use fm_core::{ContentRecord, Coord3, FieldMemory, FieldMemoryConfig, QueryContext, QueryRequest};

const CATEGORIES: [&str; 8] = [
    "function", "class", "module", "test", "document", "config", "pattern", "note",
];

fn populated(n: usize) -> FieldMemory {
    let config = FieldMemoryConfig {
        seed: Some(11),
        ..Default::default()
    };
    let mut fm = FieldMemory::new(config).unwrap();
    let mut rng = SmallRng::seed_from_u64(5);
    let records: Vec<ContentRecord> = (0..n)
        .map(|i| {
            let category = CATEGORIES[i % CATEGORIES.len()];
            let at = Coord3::new(
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
            );
            ContentRecord::new(format!("node-{i}"), category, format!("{category} {i}"))
                .with_coordinates(at)
                .with_confidence(rng.random())
        })
        .collect();
    fm.bulk_store(records).unwrap();
    fm
}

fn bench_modes(c: &mut Criterion) {
    let mut fm = populated(2_000);
    let mut ctx = QueryContext::default();

    c.bench_function("precision_2k", |b| {
        b.iter(|| fm.query(QueryRequest::precision("function", 0.9), &mut ctx).unwrap())
    });
    c.bench_function("hybrid_2k", |b| {
        b.iter(|| fm.query(QueryRequest::hybrid("pattern"), &mut ctx).unwrap())
    });
    c.bench_function("discovery_2k", |b| {
        b.iter(|| fm.query(QueryRequest::discovery("note", 0.8), &mut ctx).unwrap())
    });
}

fn bench_synthesis(c: &mut Criterion) {
    let mut fm = populated(500);
    c.bench_function("synthesis_scan_500", |b| {
        b.iter(|| fm.trigger_emergent_discovery("synthesis").unwrap())
    });
}

criterion_group!(benches, bench_modes, bench_synthesis);
criterion_main!(benches);

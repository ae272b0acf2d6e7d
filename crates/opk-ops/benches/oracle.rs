use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use opk_core::Shape;
use opk_ops::PoolParams;
use opk_ops::oracle;

fn bench_avg_pool(c: &mut Criterion) {
    let cases: &[(&[usize], PoolParams, &str)] = &[
        (&[1, 1, 10], PoolParams::new(&[3], &[1], &[1]), "1d_10"),
        (&[4, 4, 64, 64], PoolParams::new(&[3, 3], &[1, 1], &[2, 2]), "2d_64"),
        (&[1, 1, 16, 16, 16], PoolParams::new(&[5, 5, 5], &[2, 2, 2], &[2, 2, 2]), "3d_16"),
    ];

    let mut group = c.benchmark_group("oracle_avg_pool");
    for (dims, params, name) in cases {
        let shape = Shape::new(dims);
        let input: Vec<f32> = (0..shape.numel()).map(|i| (i % 7) as f32 * 0.25).collect();
        group.bench_function(BenchmarkId::new("avg_pool", name), |bench| {
            bench.iter(|| oracle::avg_pool(&input, &shape, params).expect("avg_pool"));
        });
    }
    group.finish();
}

fn bench_rope(c: &mut Criterion) {
    let shapes: &[(usize, usize, usize, &str)] = &[
        (1, 32, 128, "1x32x128"),
        (4, 1, 32, "4x1x32"),
        (3, 32, 128, "3x32x128"),
    ];

    let mut group = c.benchmark_group("oracle_rope");
    for &(seq, heads, dim, name) in shapes {
        let shape = Shape::new([seq, heads, dim]);
        let t: Vec<f32> = (0..shape.numel()).map(|i| (i as f32) * 0.001).collect();
        let pos: Vec<u64> = (0..seq as u64).collect();
        let (sin, cos) = oracle::sin_cos_table(2 * seq, dim, 1e4);

        group.bench_function(BenchmarkId::new("formula", name), |bench| {
            bench.iter(|| oracle::rotary_embedding(&t, &shape, &pos, 1e4).expect("rope"));
        });
        group.bench_function(BenchmarkId::new("tables", name), |bench| {
            bench.iter(|| {
                oracle::rotary_embedding_with_tables(&t, &shape, &pos, &sin, &cos).expect("rope")
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_avg_pool, bench_rope);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quorum_da::crypto::Keypair;
use quorum_da::das::{allocate, commit, prepare_shares, CommitmentStrategy, DasConfig, ErasureCodec, Reconstructor};
use quorum_da::random_object;
use quorum_da::types::{NodeId, StakeWeights};
use std::time::Duration;

/// Benchmark erasure coding throughput
fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.measurement_time(Duration::from_secs(10));

    for size in &[64 << 10, 1 << 20, 4 << 20] {
        let object = random_object(*size, 1);
        let codec = ErasureCodec::new(4096, 3).unwrap();

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &object, |b, object| {
            b.iter(|| codec.encode(black_box(object)).unwrap());
        });

        let encoded = codec.encode(&object).unwrap();
        let parity_only: Vec<(u32, Vec<u8>)> = encoded
            .shards
            .iter()
            .enumerate()
            .skip(encoded.data_units)
            .take(encoded.data_units)
            .map(|(i, shard)| (i as u32, shard.clone()))
            .collect();
        group.bench_with_input(BenchmarkId::new("decode_from_parity", size), &parity_only, |b, shares| {
            b.iter(|| {
                codec
                    .decode(black_box(shares.clone()), encoded.data_units, encoded.payload_len)
                    .unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark Merkle commitment
fn bench_commitment(c: &mut Criterion) {
    let mut group = c.benchmark_group("commitment");

    for size in &[1 << 20, 8 << 20] {
        let object = random_object(*size, 2);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &object, |b, object| {
            b.iter(|| commit(black_box(object), 4096));
        });
    }

    group.finish();
}

/// Benchmark full share preparation per strategy
fn bench_prepare(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare_shares");
    group.sample_size(20);
    let keypair = Keypair::from_seed(3);
    let object = random_object(1 << 20, 3);

    for strategy in [CommitmentStrategy::RawObject, CommitmentStrategy::NodeTree] {
        let config = DasConfig {
            unit_size: 16 << 10,
            strategy,
            ..Default::default()
        };
        group.bench_function(format!("{:?}", strategy), |b| {
            b.iter(|| prepare_shares(&keypair, &config, 1, black_box(&object)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark reconstruction from exactly the threshold of shares
fn bench_reconstruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruction");
    group.sample_size(20);
    let keypair = Keypair::from_seed(4);
    let config = DasConfig {
        unit_size: 16 << 10,
        strategy: CommitmentStrategy::RawObject,
        ..Default::default()
    };
    let prepared = prepare_shares(&keypair, &config, 1, &random_object(1 << 20, 4)).unwrap();
    let threshold = prepared.record.layout.threshold();
    let shares: Vec<_> = prepared.shares.iter().rev().take(threshold).cloned().collect();

    group.bench_function("1MiB_raw", |b| {
        b.iter(|| {
            let reconstructor = Reconstructor::new();
            reconstructor
                .try_reconstruct(&prepared.record, black_box(shares.clone()))
                .unwrap()
        });
    });

    group.finish();
}

/// Benchmark stake-proportional allocation
fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    for recipients in &[10u64, 100, 1000] {
        let weights =
            StakeWeights::try_from_iter((1..=*recipients).map(|i| (NodeId::from_index(i), i * 7 + 1))).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(recipients), &weights, |b, weights| {
            b.iter(|| allocate(black_box(3 * 4096), weights).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_codec,
    bench_commitment,
    bench_prepare,
    bench_reconstruction,
    bench_allocation
);
criterion_main!(benches);

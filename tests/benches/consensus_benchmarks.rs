//! # Quorra Consensus Benchmarks
//!
//! | Area | What is measured |
//! |------|------------------|
//! | Quorum arithmetic | Threshold computation for common cluster sizes |
//! | Hashing | Keccak-256 of encoded batches |
//! | Collect signing | ECDSA sign + verify of a collect payload |
//! | Agreement | One full instance on a deterministic 4-replica cluster |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quorra_consensus::adapters::{keccak256, K256Signer};
use quorra_consensus::domain::{CollectPayload, FreezeProof, WriteStamp};
use quorra_consensus::ports::MessageSigner;
use quorra_consensus::{Batch, QuorumCalculator};
use quorra_tests::integration::harness::{batch, Cluster};
use std::time::Duration;

fn bench_quorums(c: &mut Criterion) {
    let mut group = c.benchmark_group("quorum");
    for (n, f) in [(4, 1), (7, 2), (10, 3), (31, 10)] {
        group.bench_with_input(BenchmarkId::new("thresholds", n), &(n, f), |b, &(n, f)| {
            b.iter(|| {
                let q = QuorumCalculator::new(black_box(n), black_box(f));
                (q.quorum(), q.fast_decide_quorum(), q.freeze_quorum())
            })
        });
    }
    group.finish();
}

fn bench_batch_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch-hash");
    for commands in [1usize, 64, 512] {
        let value = Batch::new(vec![vec![0xAB; 256]; commands]).encode().unwrap();
        group.throughput(Throughput::Bytes(value.len() as u64));
        group.bench_with_input(BenchmarkId::new("keccak256", commands), &value, |b, value| {
            b.iter(|| keccak256(black_box(value)))
        });
    }
    group.finish();
}

fn bench_collect_signing(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect-signing");
    group.measurement_time(Duration::from_secs(10));

    let signers = K256Signer::cluster(b"bench", &[0, 1, 2, 3]).unwrap();
    let value = batch(1);
    let payload = CollectPayload {
        instance: 7,
        round: 1,
        sender: 2,
        frozen: FreezeProof {
            replica: 2,
            instance: 7,
            round: 0,
            quorum_write: Some(WriteStamp::new(0, keccak256(&value))),
            write_set: vec![WriteStamp::new(0, keccak256(&value))],
            value: Some(value),
        },
        later: None,
    };
    let bytes = payload.signing_bytes().unwrap();
    let signature = signers[2].sign(&bytes).unwrap();

    group.bench_function("sign", |b| b.iter(|| signers[2].sign(black_box(&bytes))));
    group.bench_function("verify", |b| {
        b.iter(|| signers[0].verify(2, black_box(&bytes), black_box(&signature)))
    });
    group.finish();
}

fn bench_agreement(c: &mut Criterion) {
    let mut group = c.benchmark_group("agreement");
    group.bench_function("one_instance_n4", |b| {
        b.iter_with_setup(
            || Cluster::new(4, 1),
            |cluster| {
                cluster.node_ref(0).manager.propose(batch(9)).unwrap();
                cluster.run();
                black_box(cluster.node_ref(3).manager.last_decided())
            },
        )
    });
    group.bench_function("ten_instances_n4", |b| {
        b.iter_with_setup(
            || Cluster::new(4, 1),
            |cluster| {
                for tag in 0..10u8 {
                    cluster.node_ref(0).manager.propose(batch(tag)).unwrap();
                    cluster.run();
                }
                black_box(cluster.node_ref(3).manager.last_decided())
            },
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_quorums,
    bench_batch_hashing,
    bench_collect_signing,
    bench_agreement
);
criterion_main!(benches);

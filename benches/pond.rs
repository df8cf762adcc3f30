//! Allocator and pond throughput benchmarks

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use shmpond::{
    Allocator, BinAllocator, HashAlgorithm, MemoryRegion, MemoryRegionBuilder, Pond, PondBuilder,
    RecordState,
};

const REGION_SIZE: usize = 64 * 1024 * 1024;

/// Generate a key for the given index
fn generate_key(index: usize) -> Vec<u8> {
    format!("key_{:016x}", index).into_bytes()
}

fn create_pond(algorithm: HashAlgorithm) -> Pond<MemoryRegion> {
    let region = MemoryRegionBuilder::new()
        .size(REGION_SIZE)
        .build()
        .expect("Failed to create region");
    PondBuilder::new()
        .hash_algorithm(algorithm)
        .create(region)
        .expect("Failed to create pond")
}

/// Benchmark malloc/free pairs across small, medium and large sizes
fn bench_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc");

    for size in [24usize, 120, 1000, 16 * 1024] {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(BenchmarkId::new("malloc_free", size), &size, |b, &size| {
            let region = MemoryRegionBuilder::new()
                .size(REGION_SIZE)
                .build()
                .expect("Failed to create region");
            let mut heap = BinAllocator::init(region).expect("Failed to format region");
            let mut handles = Vec::with_capacity(1000);

            b.iter(|| {
                for _ in 0..1000 {
                    handles.push(heap.malloc(black_box(size)));
                }
                for handle in handles.drain(..) {
                    heap.free(handle).expect("free failed");
                }
            });
        });
    }

    group.finish();
}

/// Benchmark record insertion followed by purge of the same keys
fn bench_insert_purge(c: &mut Criterion) {
    let mut group = c.benchmark_group("pond_insert_purge");
    let num_items = 10_000;
    let value = vec![0u8; 64];
    let keys: Vec<Vec<u8>> = (0..num_items).map(generate_key).collect();

    for algorithm in [HashAlgorithm::Elf, HashAlgorithm::Murmur] {
        group.throughput(Throughput::Elements(num_items as u64));
        group.bench_function(BenchmarkId::new("insert_purge", format!("{:?}", algorithm)), |b| {
            let mut pond = create_pond(algorithm);
            b.iter(|| {
                for key in keys.iter() {
                    pond.insert(key, &value, 1, RecordState::Clean)
                        .expect("insert failed");
                }
                for key in keys.iter() {
                    pond.purge(key).expect("purge failed");
                }
            });
        });
    }

    group.finish();
}

/// Benchmark lookups of cached keys
fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("pond_find");
    let num_items = 100_000;

    for algorithm in [HashAlgorithm::Elf, HashAlgorithm::Murmur] {
        let mut pond = create_pond(algorithm);
        let keys: Vec<Vec<u8>> = (0..num_items).map(generate_key).collect();
        for key in keys.iter() {
            pond.insert(key, b"value", 1, RecordState::Clean)
                .expect("insert failed");
        }

        group.throughput(Throughput::Elements(num_items as u64));
        group.bench_function(BenchmarkId::new("find", format!("{:?}", algorithm)), |b| {
            b.iter(|| {
                for key in keys.iter() {
                    black_box(pond.find(key));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_alloc, bench_insert_purge, bench_find,);

criterion_main!(benches);

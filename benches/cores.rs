use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tm_substrate::core::{cgl, cohorts, norec, orec_eager, orec_lazy, ring_stm, tlrw};
use tm_substrate::malloc::GlobalAllocator;

const TABLE_SLOTS: usize = 1024;
const RING_WORDS: usize = 4;
const RING_CAP: usize = 64;

fn bench_uncontended_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_read_write_commit");

    group.bench_function(BenchmarkId::new("core", "cgl"), |b| {
        let runtime = cgl::Runtime::<GlobalAllocator>::new();
        let mut desc = cgl::Descriptor::new(&runtime);
        let mut cell: u64 = 0;
        b.iter(|| {
            desc.begin();
            let v = desc.read(&cell as *const u64).unwrap();
            desc.write(&mut cell as *mut u64, v + 1).unwrap();
            desc.commit().unwrap();
        });
    });

    group.bench_function(BenchmarkId::new("core", "orec_eager"), |b| {
        let runtime: orec_eager::Runtime<TABLE_SLOTS> = orec_eager::Runtime::new();
        let mut desc = orec_eager::Descriptor::new(&runtime, 0);
        let mut cell: u64 = 0;
        b.iter(|| {
            desc.begin();
            let v = desc.read(&cell as *const u64).unwrap();
            desc.write(&mut cell as *mut u64, v + 1).unwrap();
            desc.commit().unwrap();
        });
    });

    group.bench_function(BenchmarkId::new("core", "orec_lazy"), |b| {
        let runtime: orec_lazy::Runtime<TABLE_SLOTS> = orec_lazy::Runtime::new();
        let mut desc = orec_lazy::Descriptor::new(&runtime, 0, orec_lazy::LockMode::CommitTime, false);
        let mut cell: u64 = 0;
        b.iter(|| {
            desc.begin();
            let v = desc.read(&cell as *const u64).unwrap();
            desc.write(&mut cell as *mut u64, v + 1).unwrap();
            desc.commit().unwrap();
        });
    });

    group.bench_function(BenchmarkId::new("core", "norec"), |b| {
        let runtime = norec::Runtime::new();
        let mut desc = norec::Descriptor::new(&runtime, 0);
        let mut cell: u64 = 0;
        b.iter(|| {
            desc.begin();
            let v = desc.read(&cell as *const u64).unwrap();
            desc.write(&mut cell as *mut u64, v + 1).unwrap();
            desc.commit().unwrap();
        });
    });

    group.bench_function(BenchmarkId::new("core", "ring_stm"), |b| {
        let runtime: ring_stm::Runtime<RING_WORDS, RING_CAP> = ring_stm::Runtime::new();
        let mut desc = ring_stm::Descriptor::new(&runtime, 0);
        let mut cell: u64 = 0;
        b.iter(|| {
            desc.begin();
            let v = desc.read(&cell as *const u64).unwrap();
            desc.write(&mut cell as *mut u64, v + 1).unwrap();
            desc.commit().unwrap();
        });
    });

    group.bench_function(BenchmarkId::new("core", "tlrw"), |b| {
        let runtime: tlrw::Runtime<TABLE_SLOTS> = tlrw::Runtime::new();
        let mut desc = tlrw::Descriptor::new(&runtime, 0);
        let mut cell: u64 = 0;
        b.iter(|| {
            desc.begin();
            let v = desc.read(&cell as *const u64).unwrap();
            desc.write(&mut cell as *mut u64, v + 1).unwrap();
            desc.commit().unwrap();
        });
    });

    group.bench_function(BenchmarkId::new("core", "cohorts"), |b| {
        let runtime = cohorts::Runtime::new();
        let mut desc = cohorts::Descriptor::new(&runtime, 0);
        let mut cell: u64 = 0;
        b.iter(|| {
            desc.begin();
            let v = desc.read(&cell as *const u64).unwrap();
            desc.write(&mut cell as *mut u64, v + 1).unwrap();
            desc.commit().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_uncontended_commit);
criterion_main!(benches);

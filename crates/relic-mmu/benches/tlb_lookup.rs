use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relic_mem::MemoryMap;
use relic_mmu::{
    CoreExit, CpuState, Env, Error, ExecCore, Paging, PTE_P, PTE_US, PTE_WR,
};

fn criterion_config() -> Criterion {
    match std::env::var("RELIC_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

struct NopCore;

impl ExecCore for NopCore {
    fn step(
        &mut self,
        _paging: &mut Paging,
        _mem: &mut MemoryMap,
        _cpu: &mut CpuState,
    ) -> Result<CoreExit, Error> {
        Ok(CoreExit::Shutdown)
    }

    fn deliver_page_fault(
        &mut self,
        _paging: &mut Paging,
        _mem: &mut MemoryMap,
        _cpu: &mut CpuState,
        _error_code: u32,
    ) -> Result<(), Error> {
        Ok(())
    }
}

const PAGES: u32 = 256;
const DIR_BASE: u32 = PAGES << 12;
const TABLE_BASE: u32 = DIR_BASE + 0x1000;

/// Identity-maps the first `PAGES` linear pages and enables paging.
fn paged_machine() -> (Paging, MemoryMap, CpuState) {
    let mut mem = MemoryMap::new(PAGES + 2);
    mem.phys_writed(DIR_BASE, TABLE_BASE | PTE_P | PTE_WR | PTE_US);
    for page in 0..PAGES {
        mem.phys_writed(TABLE_BASE + page * 4, page << 12 | PTE_P | PTE_WR | PTE_US);
    }
    let mut paging = Paging::new();
    paging.set_dir_base(DIR_BASE);
    paging.enable(&mut NopCore, true);
    (paging, mem, CpuState::default())
}

fn bench_linked_reads(c: &mut Criterion) {
    let (mut paging, mut mem, mut cpu) = paged_machine();
    let mut core = NopCore;
    let mut env = Env::new(&mut mem, &mut cpu, &mut core);
    // Warm every slot so the loop below measures pure hits.
    for page in 0..PAGES {
        paging.readd(&mut env, page << 12).unwrap();
    }

    let mut group = c.benchmark_group("tlb");
    group.throughput(Throughput::Elements(u64::from(PAGES)));
    group.bench_function("readd_linked", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for page in 0..PAGES {
                let addr = page << 12 | 0x10;
                sum = sum.wrapping_add(u64::from(paging.readd(&mut env, black_box(addr)).unwrap()));
            }
            black_box(sum)
        })
    });
    group.bench_function("translate_hit", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for page in 0..PAGES {
                let addr = page << 12 | 0x10;
                sum = sum
                    .wrapping_add(u64::from(paging.translate(&mut env, black_box(addr), false).unwrap()));
            }
            black_box(sum)
        })
    });
    group.finish();
}

fn bench_miss_and_clear(c: &mut Criterion) {
    let (mut paging, mut mem, mut cpu) = paged_machine();
    let mut core = NopCore;
    let mut env = Env::new(&mut mem, &mut cpu, &mut core);

    let mut group = c.benchmark_group("tlb");
    group.throughput(Throughput::Elements(u64::from(PAGES)));
    group.bench_function("readd_cold_after_clear", |b| {
        b.iter(|| {
            paging.clear_tlb();
            let mut sum = 0u64;
            for page in 0..PAGES {
                sum = sum.wrapping_add(u64::from(paging.readd(&mut env, page << 12).unwrap()));
            }
            black_box(sum)
        })
    });
    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_linked_reads, bench_miss_and_clear
}
criterion_main!(benches);

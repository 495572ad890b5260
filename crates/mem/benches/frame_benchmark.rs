use criterion::{Criterion, criterion_group, criterion_main};
use mem::addr::PhysAddr;
use mem::page::PhysPage;
use mem::phys::FrameTable;

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Frame Table");

    group.bench_function("bitmap allocate", |f| {
        let mut table = FrameTable::new();
        table
            .add_region(PhysAddr::new(0), PhysAddr::new(64 * 1024 * 1024))
            .unwrap();

        let mut pages = Box::new([PhysPage::new(0); 512]);

        f.iter(|| {
            for i in 0..512 {
                pages[i] = table.alloc().unwrap();
            }

            for i in 0..512 {
                table.free(pages[i]);
            }
        });
    });

    group.bench_function("stack allocate", |f| {
        let mut table = FrameTable::new();
        table
            .add_region(PhysAddr::new(0), PhysAddr::new(64 * 1024 * 1024))
            .unwrap();
        table.enable_stack();

        let mut pages = Box::new([PhysPage::new(0); 512]);

        f.iter(|| {
            for i in 0..512 {
                pages[i] = table.alloc().unwrap();
            }

            for i in 0..512 {
                table.free(pages[i]);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

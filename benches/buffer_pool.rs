use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use meridian_http::{BufferPool, BufferPoolConfig};

fn acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_acquire_release");
    for size in [4 * 1024usize, 64 * 1024, 256 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let pool = BufferPool::new(BufferPoolConfig::new());
            b.iter(|| {
                let buf = pool.acquire(size);
                buf.extend_from_slice(&[0u8; 64]);
                drop(buf);
            });
        });
    }
    group.finish();
}

fn view_fanout(c: &mut Criterion) {
    c.bench_function("buffer_pool_view_fanout_8", |b| {
        let pool = BufferPool::new(BufferPoolConfig::new());
        b.iter(|| {
            let buf = pool.acquire(4 * 1024);
            buf.extend_from_slice(b"some header bytes to view into");
            let views: Vec<_> = (0..8).map(|_| buf.view()).collect();
            drop(views);
            drop(buf);
        });
    });
}

criterion_group!(benches, acquire_release, view_fanout);
criterion_main!(benches);

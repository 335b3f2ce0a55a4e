use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use n64tex::{
    ColorIndexed8, Format, Layout, Rgba16, Rgba16Lut, TMEM_LEN, Tmem, decode, row_bytes,
};

fn pattern() -> Box<Tmem> {
    let mut tmem = Box::new([0u8; TMEM_LEN]);
    let mut state = 0x1234_5678u32;
    for byte in tmem.iter_mut() {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        *byte = state as u8;
    }

    tmem
}

fn texture<F: Format>(c: &mut Criterion, name: &str, width: usize, height: usize) {
    let tmem = pattern();
    let layout = Layout {
        base: 0,
        stride: row_bytes::<F>(width),
        width,
        height,
        palette: 0,
    };

    let mut group = c.benchmark_group(name);
    group.throughput(criterion::Throughput::Elements((width * height) as u64));
    group.bench_function("Decode", |b| {
        b.iter_with_large_drop(|| decode::<F>(black_box(&tmem), black_box(&layout)))
    });
    group.finish();
}

fn rgba16(c: &mut Criterion) {
    texture::<Rgba16>(c, "RGBA16", 32, 64);
}

fn ci8(c: &mut Criterion) {
    texture::<ColorIndexed8<Rgba16Lut>>(c, "CI8", 32, 64);
}

criterion_group!(benches, rgba16, ci8);
criterion_main!(benches);

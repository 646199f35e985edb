use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array4;
use oct_ssm::data::{extract_patches, reconstruct_from_patches, PatchConfig};
use oct_ssm::{Architecture, SeparationNet};

fn bench_patches(c: &mut Criterion) {
    let batch = Array4::from_shape_fn((2, 1, 128, 128), |(b, _, r, col)| ((b + r * col) % 17) as f32 / 17.0);
    let config = PatchConfig::new(32).with_stride(16);

    c.bench_function("extract_reconstruct_128", |b| {
        b.iter(|| {
            let (patches, locations) = extract_patches(black_box(&batch), &config).unwrap();
            reconstruct_from_patches(&patches, &locations, batch.dim(), &config).unwrap()
        })
    });
}

fn bench_forward(c: &mut Criterion) {
    let input = Array4::from_shape_fn((1, 1, 64, 64), |(_, _, r, col)| ((r + col) % 9) as f32 / 9.0);
    let simple = SeparationNet::new(Architecture::Simple, 8, 0).unwrap();
    let attention = SeparationNet::new(Architecture::Attention, 8, 0).unwrap();
    let patch = PatchConfig::new(32);

    c.bench_function("forward_simple_64", |b| b.iter(|| simple.forward(black_box(&input)).unwrap()));
    c.bench_function("forward_attention_64", |b| b.iter(|| attention.forward(black_box(&input)).unwrap()));
    c.bench_function("forward_patched_64", |b| {
        b.iter(|| simple.forward_patched(black_box(&input), &patch).unwrap())
    });
}

criterion_group!(benches, bench_patches, bench_forward);
criterion_main!(benches);

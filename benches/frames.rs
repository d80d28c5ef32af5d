use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ndarray::Array3;

use emdata::io::MRCWriter;
use emdata::IngestBuilder;

fn write_stack(path: &std::path::Path) {
    let data = Array3::from_shape_fn((64, 256, 256), |(z, y, x)| (z + y + x) as f32);
    MRCWriter::new(path).write(data.view()).unwrap();
}

fn open_run(path: &std::path::Path) {
    let run = IngestBuilder::new().without_cache().open(path).unwrap();
    assert_eq!(run.datasets()[0].frame_count(), 64);
}

fn force_all(path: &std::path::Path) {
    let run = IngestBuilder::new().without_cache().open(path).unwrap();
    let total: usize = run.datasets()[0]
        .frames
        .frames()
        .iter()
        .map(|f| f.compute().unwrap().len())
        .sum();
    assert_eq!(total, 64 * 256 * 256);
}

fn ingest_documents(path: &std::path::Path) {
    let n = emdata::ingest(path).unwrap().count();
    assert_eq!(n, 4);
}

fn frame_reading(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.mrc");
    write_stack(&path);
    c.bench_function("open_run", |b| b.iter(|| open_run(black_box(&path))));
    c.bench_function("force_all_frames", |b| b.iter(|| force_all(black_box(&path))));
    c.bench_function("ingest_documents", |b| {
        b.iter(|| ingest_documents(black_box(&path)))
    });
}

criterion_group!(benches, frame_reading);
criterion_main!(benches);

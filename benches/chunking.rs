use criterion::{Criterion, criterion_group, criterion_main};
use embedq::database::models::ContentType;
use embedq::embeddings::chunking::{ChunkerConfig, chunk_text};
use std::hint::black_box;

pub fn criterion_benchmark(c: &mut Criterion) {
    let paragraph =
        "Practical discussion of embedding pipelines, worker pools, and provider limits. "
            .repeat(40);
    let content = vec![paragraph; 12].join("\n\n");
    let config = ChunkerConfig::default();

    c.bench_function("chunking", |b| {
        b.iter(|| chunk_text(black_box(&content), ContentType::Post, black_box(&config)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

use criterion::{criterion_group, criterion_main, Criterion};
use quire_core::{
    rebase_steps, recreate_transform, Assoc, Document, Mappable, Rebaseable, Schema, Transform,
};
use std::hint::black_box;
use std::sync::Arc;

fn typed_transform(schema: &Arc<Schema>, base: &Document, chars: usize) -> Transform {
    let mut tr = Transform::new(schema.clone(), base.clone());
    for i in 0..chars {
        let _ = tr.insert_text(1 + i, "x");
    }
    tr
}

fn bench_mapping_through_typing(c: &mut Criterion) {
    let schema = Arc::new(Schema::default());
    let base = Document::from_paragraphs(&["lorem ipsum dolor sit amet"; 20]);
    let tr = typed_transform(&schema, &base, 200);

    c.bench_function("map_position_200_steps", |b| {
        b.iter(|| black_box(tr.mapping().map(black_box(100), Assoc::After)))
    });
}

fn bench_rebase(c: &mut Criterion) {
    let schema = Arc::new(Schema::default());
    let base = Document::from_paragraphs(&["lorem ipsum dolor sit amet"; 20]);
    let local = typed_transform(&schema, &base, 50);
    let rebaseables: Vec<Rebaseable> = local
        .steps()
        .iter()
        .zip(local.docs())
        .map(|(s, d)| Rebaseable::new(s.clone(), s.invert(d)))
        .collect();
    let mut remote = Transform::new(schema.clone(), base.clone());
    let _ = remote.delete(200, 260);

    c.bench_function("rebase_50_over_1", |b| {
        b.iter(|| {
            let mut tr = Transform::new(schema.clone(), local.doc().clone());
            black_box(rebase_steps(&rebaseables, remote.steps(), &mut tr).ok());
        })
    });
}

fn bench_recreate(c: &mut Criterion) {
    let schema = Arc::new(Schema::default());
    let from = Document::from_paragraphs(&["lorem ipsum dolor sit amet"; 50]);
    let mut edited = Transform::new(schema.clone(), from.clone());
    let _ = edited.insert_text(703, "inserted text");
    let to = edited.doc().clone();

    c.bench_function("recreate_transform_50_blocks", |b| {
        b.iter(|| black_box(recreate_transform(schema.clone(), &from, &to).ok()))
    });
}

criterion_group!(
    benches,
    bench_mapping_through_typing,
    bench_rebase,
    bench_recreate
);
criterion_main!(benches);

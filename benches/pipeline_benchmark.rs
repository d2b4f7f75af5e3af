use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;

use Torvane::core::collection::Collection;
use Torvane::core::value::Document;

/// Helper to create test documents
fn create_test_document(id: u64) -> Document {
    let mut rng = rand::thread_rng();
    let categories = ["alpha", "beta", "gamma", "delta"];
    let json = format!(
        r#"{{"_id": {}, "c": "{}", "v": {}, "tags": ["t{}", "t{}"]}}"#,
        id,
        categories[rng.gen_range(0..categories.len())],
        rng.gen_range(0..1000),
        rng.gen_range(0..8),
        rng.gen_range(0..8)
    );
    Document::from_json(&serde_json::from_str(&json).unwrap()).unwrap()
}

fn pipeline(json: &str) -> Vec<serde_json::Value> {
    serde_json::from_str(json).unwrap()
}

fn bench_batch_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_aggregate");
    for size in [1_000u64, 10_000] {
        let docs: Vec<Document> = (0..size).map(create_test_document).collect();
        let mut coll = Collection::new(docs);
        let pipe = pipeline(
            r#"[
                {"$match": {"v": {"$gte": 100}}},
                {"$group": {"_id": "$c", "total": {"$sum": "$v"}, "n": {"$sum": 1}}}
            ]"#,
        );
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(coll.aggregate(&pipe).unwrap()));
        });
    }
    group.finish();
}

fn bench_incremental_group_maintenance(c: &mut Criterion) {
    c.bench_function("ivm_group_insert_remove", |b| {
        let docs: Vec<Document> = (0..5_000).map(create_test_document).collect();
        let mut coll = Collection::new(docs);
        coll.install(&pipeline(
            r#"[{"$group": {"_id": "$c", "total": {"$sum": "$v"}, "hi": {"$max": "$v"}}}]"#,
        ))
        .unwrap();
        let mut next = 5_000u64;
        b.iter(|| {
            let row = coll.insert(create_test_document(next)).unwrap();
            next += 1;
            coll.remove(row).unwrap();
            black_box(());
        });
    });
}

fn bench_topk_maintenance(c: &mut Criterion) {
    c.bench_function("ivm_topk_insert", |b| {
        let docs: Vec<Document> = (0..10_000).map(create_test_document).collect();
        let mut coll = Collection::new(docs);
        coll.install(&pipeline(r#"[{"$sort": {"v": -1}}, {"$limit": 10}]"#)).unwrap();
        let mut next = 10_000u64;
        b.iter(|| {
            coll.insert(create_test_document(next)).unwrap();
            next += 1;
        });
    });
}

fn bench_fused_vs_unfused_materialize(c: &mut Criterion) {
    let docs: Vec<Document> = (0..10_000).map(create_test_document).collect();
    let pipe = pipeline(
        r#"[
            {"$match": {"v": {"$gte": 500}}},
            {"$project": {"c": 1, "v": 1, "_id": 0}}
        ]"#,
    );
    c.bench_function("fused_match_project_10k", |b| {
        let mut coll = Collection::new(docs.clone());
        b.iter(|| black_box(coll.aggregate(&pipe).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_batch_aggregate,
    bench_incremental_group_maintenance,
    bench_topk_maintenance,
    bench_fused_vs_unfused_materialize
);
criterion_main!(benches);

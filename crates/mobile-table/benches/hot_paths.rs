use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mobile_table::{ColumnType, LocalStore, Query, QueryOrder, field, parse_filter};
use serde_json::json;

const FILTER: &str = "startswith(name,'item 1') and (price gt 100 or done eq false)";

fn seeded_store() -> LocalStore {
    let store = LocalStore::in_memory();
    store
        .define_table(
            "items",
            [
                ("name", ColumnType::String),
                ("price", ColumnType::Number),
                ("done", ColumnType::Boolean),
            ],
        )
        .unwrap();
    store.initialize().unwrap();

    let items: Vec<_> = (0..10_000)
        .map(|n| {
            json!({
                "id": n.to_string(),
                "name": format!("item {n}"),
                "price": n % 500,
                "done": n % 3 == 0,
            })
        })
        .collect();
    store.upsert_many("items", &items, false).unwrap();
    store
}

fn bench_build_and_render(c: &mut Criterion) {
    c.bench_function("build_and_render_query", |b| {
        b.iter(|| {
            let q = Query::table("items")
                .starts_with("name", black_box("item 1"))
                .and_with(field("price").gt().val(100).or().field("done").eq().val(false))
                .order_by("price", QueryOrder::Descending)
                .top(20);
            (q.filter_text(), q.row_set_modifiers())
        })
    });
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_filter", |b| {
        b.iter(|| parse_filter(black_box(FILTER)).unwrap())
    });
}

fn bench_local_read(c: &mut Criterion) {
    let store = seeded_store();
    let query = Query::table("items")
        .with_filter(parse_filter(FILTER).unwrap())
        .order_by("price", QueryOrder::Descending)
        .skip(10)
        .top(50)
        .include_inline_count();

    c.bench_function("local_store_read", |b| {
        b.iter(|| store.read(black_box(&query)).unwrap())
    });
}

fn bench_upsert_batch(c: &mut Criterion) {
    let store = seeded_store();
    let batch: Vec<_> = (0..100)
        .map(|n| json!({"id": (n * 7).to_string(), "name": "updated", "price": n}))
        .collect();

    c.bench_function("local_store_upsert_100", |b| {
        b.iter(|| store.upsert_many("items", black_box(&batch), false).unwrap())
    });
}

criterion_group!(
    hot_paths,
    bench_build_and_render,
    bench_parse,
    bench_local_read,
    bench_upsert_batch
);
criterion_main!(hot_paths);

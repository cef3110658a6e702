//! Local store tests: schema lifecycle, writes, and query execution

use std::path::PathBuf;
use std::sync::Arc;

use mobile_table::{ColumnType, LocalStore, LocalStoreError, Query, QueryOrder, StoreState, field};
use serde_json::{Value, json};

const TABLE: &str = "TypesTable";

fn columns() -> Vec<(&'static str, ColumnType)> {
    vec![
        ("col1", ColumnType::String),
        ("col2", ColumnType::Number),
        ("col3", ColumnType::Other),
        ("col4", ColumnType::Date),
        ("col5", ColumnType::Boolean),
    ]
}

fn rows() -> Vec<Value> {
    let flags = [false, false, true, false, true, false];
    flags
        .iter()
        .enumerate()
        .map(|(i, flag)| {
            json!({
                "id": (i + 1).to_string(),
                "col1": format!("item {}", i + 1),
                "col2": (i as f64) * 1.5,
                "col3": {"n": i},
                "col4": format!("2014-0{}-15T08:00:00Z", i + 1),
                "col5": flag,
            })
        })
        .collect()
}

fn seeded_store() -> LocalStore {
    let store = LocalStore::in_memory();
    store.define_table(TABLE, columns()).unwrap();
    store.initialize().unwrap();
    store.upsert_many(TABLE, &rows(), false).unwrap();
    store
}

fn ids(rows: &[mobile_table::Row]) -> Vec<&str> {
    rows.iter().map(|r| r["id"].as_str().unwrap()).collect()
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mobile-table-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

// ============ Lifecycle ============

#[test]
fn initialize_twice_fails() {
    let store = LocalStore::in_memory();
    store.define_table(TABLE, columns()).unwrap();
    store.initialize().unwrap();
    let err = store.initialize().unwrap_err();
    assert!(matches!(err, LocalStoreError::AlreadyInitialized));
    assert_eq!(err.to_string(), "the local store is already initialized");
}

#[test]
fn define_after_initialize_fails() {
    let store = LocalStore::in_memory();
    store.initialize().unwrap();
    assert_eq!(store.state().unwrap(), StoreState::Initialized);
    let err = store.define_table(TABLE, columns()).unwrap_err();
    assert!(matches!(err, LocalStoreError::DefineAfterInitialize));
    assert_eq!(
        err.to_string(),
        "cannot define a table after the local store has been initialized"
    );
}

// ============ Boolean coercion ============

#[test]
fn boolean_equality_uses_native_literals() {
    let store = seeded_store();

    let unset = store
        .read(&Query::table(TABLE).field("col5").eq().val(false))
        .unwrap();
    assert_eq!(ids(&unset.rows), ["1", "2", "4", "6"]);

    let set = store
        .read(&Query::table(TABLE).field("col5").eq().val(true))
        .unwrap();
    assert_eq!(ids(&set.rows), ["3", "5"]);
    assert_eq!(set.rows[0]["col5"], json!(true));
}

// ============ Writes ============

#[test]
fn upsert_replaces_by_id() {
    let store = seeded_store();
    store
        .upsert(TABLE, &json!({"id": "2", "col1": "changed"}))
        .unwrap();

    let row = store.lookup(TABLE, "2").unwrap().unwrap();
    assert_eq!(row["col1"], json!("changed"));
    // Columns missing from the item are cleared
    assert_eq!(row["col2"], Value::Null);

    // The replaced row moves to the end of the scan order
    let all = store.read(&Query::table(TABLE)).unwrap();
    assert_eq!(ids(&all.rows), ["1", "3", "4", "5", "6", "2"]);
}

#[test]
fn lookup_returns_typed_values() {
    let store = seeded_store();
    let row = store.lookup(TABLE, "3").unwrap().unwrap();
    assert_eq!(row["col1"], json!("item 3"));
    assert_eq!(row["col2"], json!(3.0));
    assert_eq!(row["col3"], json!({"n": 2}));
    assert_eq!(row["col4"], json!("2014-03-15T08:00:00.000Z"));
    assert_eq!(row["col5"], json!(true));

    assert!(store.lookup(TABLE, "missing").unwrap().is_none());
}

#[test]
fn table_and_column_names_are_case_insensitive() {
    let store = seeded_store();
    store
        .upsert("typestable", &json!({"ID": "9", "COL1": "upper"}))
        .unwrap();
    let row = store.lookup("TYPESTABLE", "9").unwrap().unwrap();
    assert_eq!(row["col1"], json!("upper"));
}

#[test]
fn unknown_properties() {
    let store = seeded_store();
    let item = json!({"id": "7", "col1": "x", "extra": 1});

    let err = store.upsert(TABLE, &item).unwrap_err();
    assert!(matches!(err, LocalStoreError::UnknownColumn { ref column, .. } if column == "extra"));

    let written = store
        .upsert_many(TABLE, std::slice::from_ref(&item), true)
        .unwrap();
    assert_eq!(written, 1);
    assert!(!store.lookup(TABLE, "7").unwrap().unwrap().contains_key("extra"));
}

#[test]
fn invalid_items() {
    let store = seeded_store();
    assert!(matches!(
        store.upsert(TABLE, &json!([1, 2])),
        Err(LocalStoreError::NotAnObject)
    ));
    assert!(matches!(
        store.upsert(TABLE, &json!({"col1": "no id"})),
        Err(LocalStoreError::MissingId)
    ));
    assert!(matches!(
        store.upsert(TABLE, &json!({"id": "8", "col5": "maybe"})),
        Err(LocalStoreError::TypeMismatch { .. })
    ));
    // A failed batch writes nothing
    let batch = [json!({"id": "8"}), json!({"id": "9", "col2": "NaN-ish"})];
    assert!(store.upsert_many(TABLE, &batch, false).is_err());
    assert!(store.lookup(TABLE, "8").unwrap().is_none());
}

#[test]
fn deletes() {
    let store = seeded_store();
    assert!(store.delete(TABLE, "1").unwrap());
    assert!(!store.delete(TABLE, "1").unwrap());
    assert_eq!(store.delete_many(TABLE, ["2", "3", "nope"]).unwrap(), 2);

    let removed = store
        .delete_query(&Query::table(TABLE).field("col5").eq().val(true))
        .unwrap();
    assert_eq!(removed, 1);

    let left = store.read(&Query::table(TABLE)).unwrap();
    assert_eq!(ids(&left.rows), ["4", "6"]);

    assert_eq!(store.delete_query(&Query::table(TABLE)).unwrap(), 2);
    assert!(store.read(&Query::table(TABLE)).unwrap().rows.is_empty());
}

// ============ Reads ============

#[test]
fn order_skip_top_select() {
    let store = seeded_store();
    let query = Query::table(TABLE)
        .field("col2")
        .gt()
        .val(0)
        .order_by("col2", QueryOrder::Descending)
        .skip(1)
        .top(2)
        .select(["id", "col1"]);
    let result = store.read(&query).unwrap();
    assert_eq!(ids(&result.rows), ["5", "4"]);
    assert_eq!(result.rows[0].len(), 2);
    assert_eq!(result.rows[0]["col1"], json!("item 5"));
    assert_eq!(result.count, None);
}

#[test]
fn order_by_a_column_outside_the_selection() {
    let store = seeded_store();
    let query = Query::table(TABLE)
        .order_by("col4", QueryOrder::Descending)
        .top(3)
        .select(["col1"]);
    let result = store.read(&query).unwrap();
    let names: Vec<_> = result.rows.iter().map(|r| r["col1"].clone()).collect();
    assert_eq!(names, [json!("item 6"), json!("item 5"), json!("item 4")]);
    assert!(result.rows.iter().all(|r| r.len() == 1));
}

#[test]
fn ordering_by_several_keys() {
    let store = seeded_store();
    let query = Query::table(TABLE)
        .order_by("col5", QueryOrder::Descending)
        .order_by("col4", QueryOrder::Ascending);
    let result = store.read(&query).unwrap();
    assert_eq!(ids(&result.rows), ["3", "5", "1", "2", "4", "6"]);
}

#[test]
fn dates_compare_lexicographically() {
    let store = seeded_store();
    let query = Query::table(TABLE)
        .field("col4")
        .ge()
        .val("2014-04-01T00:00:00.000Z")
        .and()
        .month(field("col4"))
        .lt()
        .val(6);
    let result = store.read(&query).unwrap();
    assert_eq!(ids(&result.rows), ["4", "5"]);
}

#[test]
fn inline_count_counts_before_paging() {
    let store = seeded_store();
    let query = Query::table(TABLE)
        .field("col5")
        .eq()
        .val(false)
        .top(1)
        .select(["id"])
        .include_inline_count();
    let result = store.read(&query).unwrap();
    assert_eq!(result.count, Some(4));
    assert_eq!(
        result.to_json(),
        json!({"count": 4, "results": [{"id": "1"}]})
    );

    let plain = store
        .read(&Query::table(TABLE).top(1).select(["id"]))
        .unwrap();
    assert_eq!(plain.to_json(), json!([{"id": "1"}]));
}

#[test]
fn bad_queries_are_store_errors() {
    let store = seeded_store();
    let err = store
        .read(&Query::table(TABLE).field("nope").eq().val(1))
        .unwrap_err();
    assert!(matches!(err, LocalStoreError::UnknownColumn { .. }));

    let err = store
        .read(&Query::table(TABLE).field("col1").eq())
        .unwrap_err();
    assert!(matches!(err, LocalStoreError::Query(_)));

    let err = store
        .read(&Query::table(TABLE).select(["nope"]))
        .unwrap_err();
    assert!(matches!(err, LocalStoreError::UnknownColumn { .. }));
}

// ============ Persistence ============

#[test]
fn rows_survive_reopening() {
    let dir = temp_dir("reopen");
    {
        let store = LocalStore::open(&dir);
        store.define_table(TABLE, columns()).unwrap();
        store.initialize().unwrap();
        store.upsert_many(TABLE, &rows(), false).unwrap();
        store.delete(TABLE, "6").unwrap();
    }
    assert!(dir.join("typestable.ipc").exists());

    // Reopen with an extra column
    let store = LocalStore::open(&dir);
    let mut extended = columns();
    extended.push(("note", ColumnType::String));
    store.define_table(TABLE, extended).unwrap();
    store.initialize().unwrap();

    let row = store.lookup(TABLE, "3").unwrap().unwrap();
    assert_eq!(row["col5"], json!(true));
    assert_eq!(row["note"], Value::Null);

    store
        .upsert(TABLE, &json!({"id": "3", "note": "kept"}))
        .unwrap();
    let all = store.read(&Query::table(TABLE)).unwrap();
    assert_eq!(ids(&all.rows), ["1", "2", "4", "5", "3"]);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn failed_initialize_keeps_definitions() {
    let dir = temp_dir("corrupt");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("typestable.ipc"), b"not an arrow file").unwrap();

    let store = LocalStore::open(&dir);
    store.define_table(TABLE, columns()).unwrap();
    let err = store.initialize().unwrap_err();
    assert!(matches!(err, LocalStoreError::Polars(_)));
    assert_eq!(store.state().unwrap(), StoreState::Defining);

    std::fs::remove_file(dir.join("typestable.ipc")).unwrap();
    store.initialize().unwrap();
    assert!(store.lookup(TABLE, "1").unwrap().is_none());
    store.upsert(TABLE, &json!({"id": "1"})).unwrap();
    assert!(store.lookup(TABLE, "1").unwrap().is_some());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn failed_writes_leave_rows_unchanged() {
    let dir = temp_dir("unwritable");
    let store = LocalStore::open(&dir);
    store.define_table(TABLE, columns()).unwrap();
    store.initialize().unwrap();
    store.upsert_many(TABLE, &rows(), false).unwrap();
    std::fs::remove_dir_all(&dir).unwrap();

    let err = store
        .upsert(TABLE, &json!({"id": "7", "col1": "new"}))
        .unwrap_err();
    assert!(matches!(err, LocalStoreError::Io(_)));
    assert!(store.lookup(TABLE, "7").unwrap().is_none());

    assert!(store.delete(TABLE, "1").is_err());
    assert!(store.delete_many(TABLE, ["2", "3"]).is_err());
    assert!(
        store
            .delete_query(&Query::table(TABLE).field("col5").eq().val(true))
            .is_err()
    );
    let all = store.read(&Query::table(TABLE)).unwrap();
    assert_eq!(ids(&all.rows), ["1", "2", "3", "4", "5", "6"]);
}

// ============ Concurrency ============

#[test]
fn concurrent_writers_are_serialized() {
    let store = Arc::new(LocalStore::in_memory());
    store.define_table(TABLE, columns()).unwrap();
    store.define_table("other", [("n", ColumnType::Number)]).unwrap();
    store.initialize().unwrap();

    std::thread::scope(|s| {
        for worker in 0..4 {
            let store = Arc::clone(&store);
            s.spawn(move || {
                for i in 0..25 {
                    let id = format!("{worker}-{i}");
                    store
                        .upsert(TABLE, &json!({"id": &id, "col2": i}))
                        .unwrap();
                    store.upsert("other", &json!({"id": &id, "n": i})).unwrap();
                }
            });
        }
    });

    let query = Query::table(TABLE).include_inline_count();
    assert_eq!(store.read(&query).unwrap().count, Some(100));
    let query = Query::table("other").include_inline_count();
    assert_eq!(store.read(&query).unwrap().count, Some(100));
}

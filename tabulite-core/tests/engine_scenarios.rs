//! End-to-end engine scenarios

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use tabulite_core::annotations::{MergeStrategy, TagMode, TagRowsRequest};
use tabulite_core::query::{
    AggOperator, AggregationSpec, FilterNode, FilterOperator, GroupByColumns, GroupByRequest,
    Predicate, SearchRequest,
};
use tabulite_core::storage::RowBatch;
use tabulite_core::{
    ApplyFilterRequest, ApplySortsRequest, ColumnType, Config, Engine, Error, IngestSink,
    LoadProgress, LoadRequest, LoadSummary, NoopSink, SortSpec, Value,
};

/// Sink recording callback order for assertions
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl IngestSink for RecordingSink {
    async fn on_start(&self, columns: &[String]) {
        self.events.lock().push(format!("start:{}", columns.join(",")));
    }

    async fn on_batch(&self, batch: &RowBatch) {
        self.events.lock().push(format!("batch:{}", batch.row_count()));
    }

    async fn on_progress(&self, progress: &LoadProgress) {
        self.events
            .lock()
            .push(format!("progress:{}", progress.rows_parsed));
    }

    async fn on_complete(&self, summary: &LoadSummary) {
        self.events
            .lock()
            .push(format!("complete:{}", summary.total_rows));
    }

    async fn on_error(&self, error: &Error) {
        self.events.lock().push(format!("error:{}", error.kind()));
    }
}

async fn write_file(temp: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = temp.path().join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

async fn engine_with(temp: &TempDir, name: &str, data: &[u8]) -> Engine {
    let engine = Engine::open(temp.path(), Config::default()).await.unwrap();
    let path = write_file(temp, name, data).await;
    engine
        .load_file(LoadRequest::new(&path), Arc::new(NoopSink))
        .await
        .unwrap();
    engine
}

fn eq(column: &str, value: serde_json::Value) -> FilterNode {
    FilterNode::predicate(column, FilterOperator::Eq, value)
}

#[tokio::test]
async fn scenario_basic_load() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(temp.path(), Config::default()).await.unwrap();
    let path = write_file(&temp, "basic.csv", b"name,age\nAlice,30\nBob,25\n").await;

    let sink = Arc::new(RecordingSink::default());
    let summary = engine
        .load_file(LoadRequest::new(&path), sink.clone())
        .await
        .unwrap();

    assert_eq!(summary.columns, vec!["name", "age"]);
    assert_eq!(summary.column_types["name"], ColumnType::Text);
    assert_eq!(summary.column_types["age"], ColumnType::Number);
    assert_eq!(summary.total_rows, 2);

    let page = engine.fetch_rows(0, 10).await.unwrap();
    assert_eq!(page.total_rows, 2);
    assert_eq!(page.matched_rows, 2);
    assert_eq!(page.rows[0].row_id, 0);
    assert_eq!(page.rows[0].get("name"), &Value::Text("Alice".to_string()));
    assert_eq!(page.rows[0].get("age"), &Value::Number(30.0));
    assert_eq!(page.rows[1].row_id, 1);
    assert_eq!(page.rows[1].get("name"), &Value::Text("Bob".to_string()));
    assert_eq!(page.rows[1].get("age"), &Value::Number(25.0));

    // callbacks in strict order: start, then batches/progress, one
    // completion last
    let events = sink.events.lock().clone();
    assert_eq!(events[0], "start:name,age");
    assert_eq!(events[events.len() - 1], "complete:2");
    assert!(events.iter().any(|e| e.starts_with("batch:")));
}

#[tokio::test]
async fn scenario_filter() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        &temp,
        "cities.csv",
        b"name,city\nAlice,Paris\nBob,London\nCarol,Paris\n",
    )
    .await;

    let outcome = engine
        .apply_filter(ApplyFilterRequest {
            expression: Some(eq("city", json!("Paris"))),
            offset: None,
            limit: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.total_rows, 3);
    assert_eq!(outcome.matched_rows, 2);
    let names: Vec<_> = outcome
        .rows
        .iter()
        .map(|r| r.get("name").display_string())
        .collect();
    assert_eq!(names, vec!["Alice", "Carol"]);

    // fetch_rows pages the filtered view
    let page = engine.fetch_rows(1, 10).await.unwrap();
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.rows[0].get("name"), &Value::Text("Carol".to_string()));

    // clearing the filter restores everything
    let cleared = engine
        .apply_filter(ApplyFilterRequest::default())
        .await
        .unwrap();
    assert_eq!(cleared.matched_rows, 3);
}

#[tokio::test]
async fn scenario_fuzzy_salvage() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, "log.csv", b"msg\nlogin success\nlogout\n").await;

    let outcome = engine
        .apply_filter(ApplyFilterRequest {
            expression: Some(FilterNode::Predicate(Predicate {
                column: "msg".to_string(),
                operator: FilterOperator::Eq,
                value: Some(json!("login sucess")),
                value2: None,
                case_sensitive: false,
                fuzzy: true,
            })),
            offset: None,
            limit: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.matched_rows, 1);
    assert_eq!(outcome.rows[0].row_id, 0);

    let uses = outcome.fuzzy_used.expect("salvage must report back");
    assert_eq!(uses[0].query, "login sucess");
    assert!(uses[0]
        .suggestions
        .iter()
        .any(|s| s.token == "login" || s.token == "success"));
    assert!(uses[0].suggestions.iter().all(|s| s.distance <= 2));
}

#[tokio::test]
async fn scenario_group() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        &temp,
        "amounts.csv",
        b"category,amount\nA,10\nA,\nB,5\n",
    )
    .await;

    let outcome = engine
        .group_by(GroupByRequest {
            group_by: GroupByColumns::Single("category".to_string()),
            aggregations: vec![
                AggregationSpec {
                    operator: AggOperator::Count,
                    column: None,
                    alias: None,
                },
                AggregationSpec {
                    operator: AggOperator::Sum,
                    column: Some("amount".to_string()),
                    alias: Some("sum".to_string()),
                },
                AggregationSpec {
                    operator: AggOperator::Avg,
                    column: Some("amount".to_string()),
                    alias: Some("avg".to_string()),
                },
            ],
            offset: None,
            limit: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.total_groups, 2);
    assert_eq!(outcome.total_rows, 3);
    let a = &outcome.groups[0];
    assert_eq!(a.row_count, 2);
    assert_eq!(a.aggregates["count"], Value::Number(2.0));
    assert_eq!(a.aggregates["sum"], Value::Number(10.0));
    assert_eq!(a.aggregates["avg"], Value::Number(10.0));
    let b = &outcome.groups[1];
    assert_eq!(b.aggregates["count"], Value::Number(1.0));
    assert_eq!(b.aggregates["sum"], Value::Number(5.0));
    assert_eq!(b.aggregates["avg"], Value::Number(5.0));
}

#[tokio::test]
async fn scenario_sort_stability() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, "stab.csv", b"s\n1\n1\n0\n").await;

    let outcome = engine
        .apply_sorts(ApplySortsRequest {
            sorts: vec![SortSpec::asc("s")],
            ..ApplySortsRequest::default()
        })
        .await
        .unwrap();

    assert!(outcome.sort_complete);
    let ids: Vec<u32> = outcome.rows.iter().map(|r| r.row_id).collect();
    assert_eq!(ids, vec![2, 0, 1]);
    assert_eq!(outcome.matched_rows, 3);
    assert_eq!(outcome.sorted_row_count, 3);
}

#[tokio::test]
async fn scenario_checkpoint_seek() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(temp.path(), Config::default()).await.unwrap();

    let mut data = String::from("n\n");
    for i in 0..175_000u32 {
        data.push_str(&i.to_string());
        data.push('\n');
    }
    let path = write_file(&temp, "big.csv", data.as_bytes()).await;
    engine
        .load_file(LoadRequest::new(&path), Arc::new(NoopSink))
        .await
        .unwrap();

    let index = engine.load_row_index(&path).await.unwrap().unwrap();
    assert_eq!(index.row_count, 175_000);
    assert_eq!(index.checkpoint_interval, 50_000);
    let rows: Vec<u32> = index.entries.iter().map(|e| e.row_index).collect();
    assert_eq!(rows, vec![0, 50_000, 100_000, 150_000]);

    // nearest preceding checkpoint first, then interior ones
    let hits = engine.seek_rows(&path, 120_000, 40_000).await.unwrap();
    let rows: Vec<u32> = hits.iter().map(|e| e.row_index).collect();
    assert_eq!(rows, vec![100_000, 150_000]);

    // a narrow window keeps just the nearest preceding checkpoint
    let hits = engine.seek_rows(&path, 120_000, 100).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].row_index, 100_000);

    // byte offsets are real row starts: header is 2 bytes, so row 0
    // begins at offset 2
    assert_eq!(index.entries[0].byte_offset, 2);
}

#[tokio::test]
async fn sorted_filtered_window_is_consistent() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        &temp,
        "mix.csv",
        b"name,city,age\nAlice,Paris,30\nBob,London,25\nCarol,Paris,41\nDave,Paris,19\n",
    )
    .await;

    engine
        .apply_filter(ApplyFilterRequest {
            expression: Some(eq("city", json!("Paris"))),
            offset: None,
            limit: None,
        })
        .await
        .unwrap();

    let outcome = engine
        .apply_sorts(ApplySortsRequest {
            sorts: vec![SortSpec::desc("age")],
            ..ApplySortsRequest::default()
        })
        .await
        .unwrap();

    // the permutation covers exactly the filtered set
    assert_eq!(outcome.matched_rows, 3);
    let ids: Vec<u32> = outcome.rows.iter().map(|r| r.row_id).collect();
    assert_eq!(ids, vec![2, 0, 3]);
}

#[tokio::test]
async fn progressive_sort_completes_in_background() {
    let temp = TempDir::new().unwrap();
    let mut data = String::from("n\n");
    for i in (0..500u32).rev() {
        data.push_str(&i.to_string());
        data.push('\n');
    }
    let engine = engine_with(&temp, "prog.csv", data.as_bytes()).await;

    let outcome = engine
        .apply_sorts(ApplySortsRequest {
            sorts: vec![SortSpec::asc("n")],
            progressive: true,
            visible_rows: Some(50),
            limit: Some(50),
            ..ApplySortsRequest::default()
        })
        .await
        .unwrap();

    assert!(!outcome.sort_complete);
    assert_eq!(outcome.sorted_row_count, 50);
    // the visible head is sorted: values 450..=499 reversed in the
    // file, so the smallest of the first 50 ids leads
    let first: Vec<String> = outcome
        .rows
        .iter()
        .take(3)
        .map(|r| r.get("n").display_string())
        .collect();
    assert_eq!(first, vec!["450", "451", "452"]);

    // the deferred full sort lands and updates the stored permutation
    let mut full_sorted = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let page = engine.fetch_rows(0, 3).await.unwrap();
        let values: Vec<String> = page
            .rows
            .iter()
            .map(|r| r.get("n").display_string())
            .collect();
        if values == vec!["0", "1", "2"] {
            full_sorted = true;
            break;
        }
    }
    assert!(full_sorted, "deferred sort never completed");
}

#[tokio::test]
async fn progressive_below_threshold_sorts_fully() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, "small.csv", b"n\n3\n1\n2\n").await;

    let outcome = engine
        .apply_sorts(ApplySortsRequest {
            sorts: vec![SortSpec::asc("n")],
            progressive: true,
            visible_rows: Some(50),
            ..ApplySortsRequest::default()
        })
        .await
        .unwrap();
    assert!(outcome.sort_complete);
}

#[tokio::test]
async fn global_search_honors_filter_and_limit() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(
        &temp,
        "search.csv",
        b"name,city\nAlice,Paris\nBob,London\nCarol,Paris\nalina,Oslo\n",
    )
    .await;

    let outcome = engine
        .global_search(SearchRequest {
            query: "ali".to_string(),
            columns: vec!["name".to_string()],
            filter: Some(eq("city", json!("Paris"))),
            limit: None,
            case_sensitive: false,
        })
        .await
        .unwrap();
    assert_eq!(outcome.rows, vec![0]);
    assert_eq!(outcome.total_rows, 4);
}

#[tokio::test]
async fn tagging_round_trip_and_tag_filter() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, "tags.csv", b"name\nAlice\nBob\nCarol\n").await;

    engine
        .update_label(tabulite_core::annotations::Label {
            id: "bug".to_string(),
            name: "Bug".to_string(),
            color: "#cc0000".to_string(),
            description: None,
            created_at: 0,
            updated_at: 0,
        })
        .await
        .unwrap();
    engine
        .tag_rows(TagRowsRequest {
            row_ids: vec![0, 2],
            label_ids: Some(vec!["bug".to_string()]),
            note: None,
            mode: TagMode::Replace,
        })
        .await
        .unwrap();

    // filter on the reserved tag column
    let outcome = engine
        .apply_filter(ApplyFilterRequest {
            expression: Some(eq("__tag__", json!("bug"))),
            offset: None,
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(outcome.matched_rows, 2);

    let outcome = engine
        .apply_filter(ApplyFilterRequest {
            expression: Some(eq("__tag__", json!("__no_label__"))),
            offset: None,
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(outcome.matched_rows, 1);
    assert_eq!(outcome.rows[0].row_id, 1);

    // import(export(), merge) is a fixpoint
    let exported = engine.export_tags().await.unwrap();
    engine
        .import_tags(exported.clone(), MergeStrategy::Merge)
        .await
        .unwrap();
    let after = engine.load_tags().await.unwrap();
    assert_eq!(after.labels, exported.labels);
    assert_eq!(after.tags, exported.tags);

    // persisted annotations survive a reload of the same file
    engine.persist_tags().await.unwrap();
    let path = temp.path().join("tags.csv");
    engine
        .load_file(LoadRequest::new(&path), Arc::new(NoopSink))
        .await
        .unwrap();
    let rehydrated = engine.load_tags().await.unwrap();
    assert_eq!(rehydrated.labels.len(), 1);
    assert!(rehydrated.tags[&0].label_ids.contains("bug"));
}

#[tokio::test]
async fn fuzzy_snapshot_reused_only_for_identical_file() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(temp.path(), Config::default()).await.unwrap();
    let path = write_file(&temp, "reuse.csv", b"msg\nlogin success\nlogout\n").await;

    let first = engine
        .load_file(LoadRequest::new(&path), Arc::new(NoopSink))
        .await
        .unwrap();
    assert!(!first.fuzzy_reused);

    let second = engine
        .load_file(LoadRequest::new(&path), Arc::new(NoopSink))
        .await
        .unwrap();
    assert!(second.fuzzy_reused);

    // touching the file invalidates the snapshot
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    tokio::fs::write(&path, b"msg\nlogin success\nlogout\nshutdown\n")
        .await
        .unwrap();
    let third = engine
        .load_file(LoadRequest::new(&path), Arc::new(NoopSink))
        .await
        .unwrap();
    assert!(!third.fuzzy_reused);
}

#[tokio::test]
async fn gzip_sources_decompress_transparently() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let temp = TempDir::new().unwrap();
    let engine = Engine::open(temp.path(), Config::default()).await.unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"name,age\nAlice,30\n").unwrap();
    let compressed = encoder.finish().unwrap();
    let path = write_file(&temp, "data.csv.gz", &compressed).await;

    let summary = engine
        .load_file(LoadRequest::new(&path), Arc::new(NoopSink))
        .await
        .unwrap();
    assert_eq!(summary.total_rows, 1);
    assert_eq!(summary.column_types["age"], ColumnType::Number);
    assert_eq!(summary.bytes_parsed, 18);
}

#[tokio::test]
async fn reload_preempts_inflight_ingestion() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(temp.path(), Config::default()).await.unwrap();

    let mut data = String::from("n\n");
    for i in 0..50_000u32 {
        data.push_str(&i.to_string());
        data.push('\n');
    }
    let slow_path = write_file(&temp, "slow.csv", data.as_bytes()).await;
    let fast_path = write_file(&temp, "fast.csv", b"x\n1\n").await;

    let first = {
        let engine = engine.clone();
        let mut request = LoadRequest::new(&slow_path);
        request.batch_size = Some(100);
        tokio::spawn(async move { engine.load_file(request, Arc::new(NoopSink)).await })
    };
    // give the first load a head start, then pre-empt it
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    engine
        .load_file(LoadRequest::new(&fast_path), Arc::new(NoopSink))
        .await
        .unwrap();

    // the first load either finished before the reload or observed
    // the pre-emption; the dataset always belongs to the second load
    if let Err(e) = first.await.unwrap() {
        assert!(matches!(e, Error::CancelledByReload(_)));
    }
    let summary = engine.dataset_summary().await.unwrap();
    assert_eq!(summary.columns, vec!["x"]);
    assert_eq!(summary.total_rows, 1);
}

#[tokio::test]
async fn filter_invariants_hold() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, "inv.csv", b"v\n1\n2\n3\n4\n5\n").await;

    // applyFilter(null).matchedRows == totalRows
    let outcome = engine
        .apply_filter(ApplyFilterRequest::default())
        .await
        .unwrap();
    assert_eq!(outcome.matched_rows, outcome.total_rows);

    // fetch_rows_by_ids preserves caller order
    let rows = engine.fetch_rows_by_ids(&[3, 0, 4]).await.unwrap();
    let ids: Vec<u32> = rows.iter().map(|r| r.row_id).collect();
    assert_eq!(ids, vec![3, 0, 4]);
}

#[tokio::test]
async fn engine_stats_reflect_activity() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(&temp, "stats.csv", b"a\nx\ny\n").await;
    let stats = engine.stats().await;
    let dataset = stats.dataset.unwrap();
    assert_eq!(dataset.total_rows, 2);
    assert!(dataset.eof);
    assert_eq!(dataset.store.batches_stored, 1);
    assert!(dataset.fuzzy_tokens > 0);

    let annotations = stats.annotations.unwrap();
    assert_eq!(annotations.labels, 0);
    assert!(!annotations.status.dirty);
}

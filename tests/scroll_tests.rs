use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use docsql::models::structs::FieldMapping;
use docsql::query_ast::errors::{BackendError, QueryAstError};
use docsql::query_ast::executor::{MappingLookup, SearchBackend, execute_query};
use docsql::query_ast::scroll::{SessionOptions, SessionOutcome};
use docsql::query_ast::{Node, QueryAst, SelectItem};
use docsql::stream::OutputSink;
use docsql::{FieldType, OutputFormat};

struct MockBackend {
    explain: Result<Value, BackendError>,
    first: Result<Value, BackendError>,
    pages: Mutex<VecDeque<Result<Value, BackendError>>>,
    scroll_delay: Duration,
    explained: Mutex<Vec<String>>,
    searched: Mutex<Vec<Value>>,
    scroll_calls: AtomicUsize,
    cleared: Mutex<Vec<String>>,
}

impl MockBackend {
    fn new(first: Value, rest: Vec<Value>) -> Self {
        Self {
            explain: Ok(json!({"from": 0, "size": 200})),
            first: Ok(first),
            pages: Mutex::new(rest.into_iter().map(Ok).collect()),
            scroll_delay: Duration::ZERO,
            explained: Mutex::new(Vec::new()),
            searched: Mutex::new(Vec::new()),
            scroll_calls: AtomicUsize::new(0),
            cleared: Mutex::new(Vec::new()),
        }
    }

    fn scrolls(&self) -> usize {
        self.scroll_calls.load(Ordering::SeqCst)
    }

    fn cleared(&self) -> Vec<String> {
        self.cleared.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchBackend for MockBackend {
    async fn explain(&self, sql: &str) -> Result<Value, BackendError> {
        self.explained.lock().unwrap().push(sql.to_string());
        self.explain.clone()
    }

    async fn search(&self, _index: &str, query: &Value, keep_alive: &str) -> Result<Value, BackendError> {
        assert_eq!(keep_alive, "1m");
        self.searched.lock().unwrap().push(query.clone());
        self.first.clone()
    }

    async fn scroll(&self, _scroll_id: &str, _keep_alive: &str) -> Result<Value, BackendError> {
        self.scroll_calls.fetch_add(1, Ordering::SeqCst);
        if !self.scroll_delay.is_zero() {
            tokio::time::sleep(self.scroll_delay).await;
        }
        let next = self.pages.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(hits_page("done", &[])))
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), BackendError> {
        self.cleared.lock().unwrap().push(scroll_id.to_string());
        Ok(())
    }
}

struct StaticMapping(FieldMapping);

#[async_trait]
impl MappingLookup for StaticMapping {
    async fn get_mapping(&self, _index: &str) -> Result<FieldMapping, BackendError> {
        Ok(self.0.clone())
    }
}

fn mapping() -> StaticMapping {
    let mut m = FieldMapping::new();
    m.insert("iso", FieldType::Text);
    m.insert("pop", FieldType::Long);
    StaticMapping(m)
}

#[derive(Default)]
struct RecordingSink {
    out: String,
    chunks: usize,
    ends: usize,
    aborts: Vec<String>,
}

impl RecordingSink {
    fn terminal_calls(&self) -> usize {
        self.ends + self.aborts.len()
    }
}

impl OutputSink for RecordingSink {
    fn write_chunk(&mut self, chunk: &str) -> std::io::Result<()> {
        self.out.push_str(chunk);
        self.chunks += 1;
        Ok(())
    }

    fn end(&mut self) -> std::io::Result<()> {
        self.ends += 1;
        Ok(())
    }

    fn abort(&mut self, error: &QueryAstError) {
        self.aborts.push(error.to_string());
    }
}

fn hits_page(scroll_id: &str, docs: &[Value]) -> Value {
    let hits: Vec<Value> = docs.iter().map(|d| json!({"_index": "countries", "_source": d})).collect();
    json!({
        "_scroll_id": scroll_id,
        "hits": {"total": {"value": 100, "relation": "eq"}, "hits": hits}
    })
}

fn docs(from: u64, n: u64) -> Vec<Value> {
    (from..from + n).map(|i| json!({"iso": format!("C{}", i), "pop": i})).collect()
}

fn select_all() -> QueryAst {
    let mut q = QueryAst::new("countries");
    q.select = vec![SelectItem::wildcard()];
    q
}

#[tokio::test]
async fn three_pages_make_one_json_document() {
    let backend = MockBackend::new(
        hits_page("s1", &docs(0, 2)),
        vec![hits_page("s2", &docs(2, 2)), hits_page("s3", &docs(4, 1))],
    );
    let meta = json!({"clone": {"dataset": "d-1"}});
    let options = SessionOptions { clone_metadata: Some(meta.clone()), ..SessionOptions::default() };
    let mut sink = RecordingSink::default();

    let outcome = execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, options).await.unwrap();

    assert_eq!(outcome, SessionOutcome::Completed { returned: 5 });
    let doc: Value = serde_json::from_str(&sink.out).unwrap();
    assert_eq!(doc["data"].as_array().unwrap().len(), 5);
    assert_eq!(doc["data"][4], json!({"iso": "C4", "pop": 4}));
    assert_eq!(doc["meta"], meta);
    assert_eq!(sink.ends, 1);
    assert!(sink.aborts.is_empty());
    // the fourth page comes back empty and ends the loop
    assert_eq!(backend.scrolls(), 3);
    assert!(backend.cleared().is_empty());
    assert_eq!(backend.explained.lock().unwrap()[0], "SELECT * FROM countries");
}

#[tokio::test]
async fn download_has_no_meta() {
    let backend = MockBackend::new(hits_page("s1", &docs(0, 2)), vec![hits_page("s2", &docs(2, 2))]);
    let options = SessionOptions { is_download: true, clone_metadata: Some(json!({"x": 1})), ..SessionOptions::default() };
    let mut sink = RecordingSink::default();

    execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, options).await.unwrap();

    let doc: Value = serde_json::from_str(&sink.out).unwrap();
    assert_eq!(doc["data"].as_array().unwrap().len(), 4);
    assert!(doc.get("meta").is_none());
}

#[tokio::test]
async fn zero_hits_emit_one_empty_envelope() {
    let backend = MockBackend::new(hits_page("s1", &[]), vec![]);
    let mut sink = RecordingSink::default();

    let outcome =
        execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, SessionOptions::default()).await.unwrap();

    assert_eq!(outcome.returned(), 0);
    assert_eq!(sink.chunks, 1);
    assert_eq!(sink.out, r#"{"data":[],"meta":{}}"#);
    assert_eq!(backend.scrolls(), 0);
    assert_eq!(sink.terminal_calls(), 1);
}

#[tokio::test]
async fn timeout_closes_stream_once_and_reports_over_budget() {
    let mut backend = MockBackend::new(
        hits_page("s1", &docs(0, 2)),
        vec![hits_page("s2", &docs(2, 2)), hits_page("s3", &docs(4, 2))],
    );
    backend.scroll_delay = Duration::from_millis(50);
    let options = SessionOptions { timeout: Duration::from_millis(10), ..SessionOptions::default() };
    let mut sink = RecordingSink::default();

    let outcome = execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, options).await.unwrap();

    assert_eq!(outcome, SessionOutcome::OverBudget { returned: 2 });
    assert!(matches!(outcome.into_result(), Err(QueryAstError::TimeoutExceeded { returned: 2 })));
    // truncated but well formed
    let doc: Value = serde_json::from_str(&sink.out).unwrap();
    assert_eq!(doc["data"].as_array().unwrap().len(), 2);
    assert_eq!(sink.ends, 1);
    assert!(sink.aborts.is_empty());
    assert_eq!(backend.scrolls(), 1);
    assert_eq!(backend.cleared(), vec!["s2".to_string()]);
}

#[tokio::test]
async fn missing_index_aborts_before_streaming() {
    let mut backend = MockBackend::new(json!({}), vec![]);
    backend.first = Err(BackendError::Status { status: 404, reason: "no such index [nope]".into() });
    let mut sink = RecordingSink::default();

    let err = execute_query(&select_all(), "nope", &backend, &mapping(), &mut sink, SessionOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QueryAstError::IndexNotFound(ref i) if i == "nope"));
    assert_eq!(sink.aborts, vec!["table not found: nope".to_string()]);
    assert_eq!(sink.ends, 0);
    assert!(sink.out.is_empty());
}

#[tokio::test]
async fn translation_errors_are_classified() {
    let mut backend = MockBackend::new(json!({}), vec![]);
    backend.explain = Err(BackendError::Status { status: 500, reason: "Index 2 out of bounds for length 2".into() });
    let mut sink = RecordingSink::default();
    let err = execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, SessionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueryAstError::SemanticallyInvalidQuery(_)));
    assert_eq!(sink.terminal_calls(), 1);

    backend.explain = Err(BackendError::Status { status: 400, reason: "Invalid SQL query".into() });
    let mut sink = RecordingSink::default();
    let err = execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, SessionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueryAstError::InvalidQuery { status: 400, .. }));
    assert_eq!(sink.aborts.len(), 1);
}

#[tokio::test]
async fn scroll_failure_mid_stream_aborts_once() {
    let backend = MockBackend::new(hits_page("s1", &docs(0, 2)), vec![]);
    backend.pages.lock().unwrap().push_back(Err(BackendError::Transport("connection reset".into())));
    let mut sink = RecordingSink::default();

    let err = execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, SessionOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QueryAstError::Backend(BackendError::Transport(_))));
    assert_eq!(sink.ends, 0);
    assert_eq!(sink.aborts.len(), 1);
    assert_eq!(backend.cleared(), vec!["s1".to_string()]);
}

#[tokio::test]
async fn limit_truncates_and_releases_cursor() {
    let backend = MockBackend::new(
        hits_page("s1", &docs(0, 2)),
        vec![hits_page("s2", &docs(2, 2)), hits_page("s3", &docs(4, 2))],
    );
    let mut query = select_all();
    query.limit = Some(3);
    let mut sink = RecordingSink::default();

    let outcome = execute_query(&query, "countries", &backend, &mapping(), &mut sink, SessionOptions::default()).await.unwrap();

    assert_eq!(outcome.returned(), 3);
    let doc: Value = serde_json::from_str(&sink.out).unwrap();
    assert_eq!(doc["data"].as_array().unwrap().len(), 3);
    assert_eq!(backend.scrolls(), 1);
    assert_eq!(backend.cleared(), vec!["s2".to_string()]);
}

#[tokio::test]
async fn csv_header_written_once_across_pages() {
    let backend = MockBackend::new(hits_page("s1", &docs(0, 2)), vec![hits_page("s2", &docs(2, 1))]);
    let options = SessionOptions { format: OutputFormat::Csv, ..SessionOptions::default() };
    let mut sink = RecordingSink::default();

    execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, options).await.unwrap();

    assert_eq!(sink.out, "iso,pop\nC0,0\nC1,1\nC2,2\n");
    assert_eq!(sink.out.matches("iso,pop").count(), 1);
}

#[tokio::test]
async fn csv_columns_follow_select_list() {
    let backend = MockBackend::new(
        hits_page("s1", &[json!({"iso": "A"})]),
        vec![hits_page("s2", &[json!({"iso": "B", "pop": 7})])],
    );
    let mut query = QueryAst::new("countries");
    query.select = vec![SelectItem::literal("iso"), SelectItem::literal("pop")];
    let options = SessionOptions { format: OutputFormat::Csv, is_download: true, ..SessionOptions::default() };
    let mut sink = RecordingSink::default();

    let outcome = execute_query(&query, "countries", &backend, &mapping(), &mut sink, options).await.unwrap();

    assert_eq!(outcome, SessionOutcome::Completed { returned: 2 });
    assert_eq!(sink.out, "iso,pop\nA,\nB,7\n");
    assert_eq!(sink.terminal_calls(), 1);
}

#[tokio::test]
async fn aggregation_is_a_single_chunk() {
    let response = json!({
        "_scroll_id": "agg",
        "hits": {"total": {"value": 3, "relation": "eq"}, "hits": []},
        "aggregations": {
            "iso.keyword": {"buckets": [
                {"key": "COL", "doc_count": 2, "COUNT(*)": {"value": 2}},
                {"key": "USA", "doc_count": 1, "COUNT(*)": {"value": 1}}
            ]}
        }
    });
    let backend = MockBackend::new(response, vec![]);
    let mut query = QueryAst::new("countries");
    query.select = vec![
        SelectItem::literal("iso"),
        SelectItem::function("COUNT", vec![Node::Raw("*".into())]).with_alias("the_count"),
    ];
    query.group = vec![Node::literal("iso")];
    let mut sink = RecordingSink::default();

    let outcome =
        execute_query(&query, "countries", &backend, &mapping(), &mut sink, SessionOptions::default()).await.unwrap();

    assert_eq!(outcome, SessionOutcome::Completed { returned: 2 });
    assert_eq!(sink.chunks, 1);
    let doc: Value = serde_json::from_str(&sink.out).unwrap();
    assert_eq!(doc["data"], json!([{"iso": "COL", "the_count": 2}, {"iso": "USA", "the_count": 1}]));
    assert_eq!(backend.scrolls(), 0);
    assert_eq!(
        backend.explained.lock().unwrap()[0],
        "SELECT iso, COUNT(*) AS the_count FROM countries GROUP BY iso.keyword LIMIT 9999999"
    );
}

#[tokio::test]
async fn geojson_rows_become_features() {
    let doc = json!({"name": "a", "the_geom": {"type": "Point", "coordinates": [1, 2]}});
    let backend = MockBackend::new(hits_page("s1", &[doc]), vec![]);
    let options = SessionOptions { format: OutputFormat::GeoJson, is_download: true, ..SessionOptions::default() };
    let mut sink = RecordingSink::default();

    execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, options).await.unwrap();

    let out: Value = serde_json::from_str(&sink.out).unwrap();
    let features = &out["data"][0]["features"];
    assert_eq!(out["data"][0]["type"], "FeatureCollection");
    assert_eq!(features[0]["geometry"]["type"], "Point");
    assert_eq!(features[0]["properties"], json!({"name": "a"}));
}

#[tokio::test]
async fn sort_clause_is_augmented_before_search() {
    let mut backend = MockBackend::new(hits_page("s1", &[]), vec![]);
    backend.explain = Ok(json!({"sort": [{"pop": {"order": "desc"}}]}));
    let mut sink = RecordingSink::default();

    execute_query(&select_all(), "countries", &backend, &mapping(), &mut sink, SessionOptions::default()).await.unwrap();

    let sent = backend.searched.lock().unwrap()[0].clone();
    assert_eq!(sent["sort"][0]["pop"], json!({"order": "desc", "unmapped_type": "long", "missing": "_last"}));
}

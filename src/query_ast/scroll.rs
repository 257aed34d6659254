//! Scroll-cursor session: translate, open the cursor, page through it and stream every page
//! through the chunk encoder.
//!
//! The wall-clock budget is cooperative. The watchdog only raises a flag; a request that is
//! already in flight is allowed to finish and the flag is read between pages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use sqlformat::{FormatOptions, QueryParams};
use tokio::task::JoinHandle;

use super::ast::{QueryAst, SelectItem};
use super::emitter::emit_sql;
use super::errors::{BackendError, QueryAstError};
use super::executor::{SCROLL_KEEP_ALIVE, SearchBackend};
use crate::export::ChunkEncoder;
use crate::flatten::{flatten_page, output_columns, to_features};
use crate::models::enums::OutputFormat;
use crate::models::structs::{ResultPage, Row};
use crate::stream::OutputSink;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub format: OutputFormat,
    pub is_download: bool,
    /// Echoed back under `"meta"` at the end of non-download JSON responses.
    pub clone_metadata: Option<Value>,
    pub timeout: Duration,
    pub keep_alive: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Json,
            is_download: false,
            clone_metadata: None,
            timeout: DEFAULT_QUERY_TIMEOUT,
            keep_alive: SCROLL_KEEP_ALIVE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    Exhausted,
    LimitReached,
    TimedOut,
    Failed,
}

/// How a session that started streaming ended. Failures come back as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { returned: u64 },
    /// The budget ran out; the stream was closed early and may be truncated.
    OverBudget { returned: u64 },
}

impl SessionOutcome {
    pub fn returned(&self) -> u64 {
        match self {
            SessionOutcome::Completed { returned } | SessionOutcome::OverBudget { returned } => *returned,
        }
    }

    /// Treat an over-budget session as a failure.
    pub fn into_result(self) -> Result<u64, QueryAstError> {
        match self {
            SessionOutcome::Completed { returned } => Ok(returned),
            SessionOutcome::OverBudget { returned } => Err(QueryAstError::TimeoutExceeded { returned }),
        }
    }
}

/// Flags a session once its budget has elapsed. Never cancels anything itself.
pub struct Watchdog {
    flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn start(budget: Duration) -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let tripped = flag.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            tripped.store(true, Ordering::SeqCst);
            debug!("query budget of {:?} elapsed", budget);
        });
        Self { flag, handle: Some(handle) }
    }

    pub fn tripped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn cancel(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct CursorSession<'a, B: SearchBackend + ?Sized> {
    backend: &'a B,
    target_index: String,
    query: QueryAst,
    original_select: Vec<SelectItem>,
    options: SessionOptions,
    encoder: ChunkEncoder,
    sql: String,
    page: Option<ResultPage>,
    scroll_id: Option<String>,
    cursor_live: bool,
    total_returned: u64,
    state: SessionState,
    watchdog: Watchdog,
    started: Instant,
}

impl<'a, B: SearchBackend + ?Sized> CursorSession<'a, B> {
    /// Translate `query`, open the scroll cursor on `index` and hold the first page.
    ///
    /// `original_select` is the caller's select list before rewriting; its aliases name the
    /// output columns.
    pub async fn init(
        backend: &'a B,
        index: &str,
        query: QueryAst,
        original_select: Vec<SelectItem>,
        options: SessionOptions,
    ) -> Result<Self, QueryAstError> {
        let sql = emit_sql(&query)?;
        if log::log_enabled!(log::Level::Debug) {
            debug!("translation SQL:\n{}", sqlformat::format(&sql, &QueryParams::None, &FormatOptions::default()));
        }

        let watchdog = Watchdog::start(options.timeout);
        let started = Instant::now();

        let mut native = backend.explain(&sql).await.map_err(translation_error)?;
        augment_sort(&mut native);

        let body = backend.search(index, &native, &options.keep_alive).await.map_err(|e| match e.status() {
            Some(404) => QueryAstError::IndexNotFound(index.to_string()),
            _ => QueryAstError::Backend(e),
        })?;
        let page = ResultPage::from_response(body);
        let scroll_id = page.scroll_id().map(str::to_string);
        info!(
            "opened cursor on {} ({}; first page {} hits)",
            index,
            if page.is_aggregation() { "aggregation" } else { "hits" },
            page.hit_count()
        );

        let mut encoder = ChunkEncoder::new(options.format, options.is_download, options.clone_metadata.clone());
        // sparse hits would otherwise lose fields absent from the first page
        if options.format == OutputFormat::Csv
            && !page.is_aggregation()
            && let Some(columns) = output_columns(&original_select)
        {
            encoder = encoder.with_columns(columns);
        }
        Ok(Self {
            backend,
            target_index: index.to_string(),
            query,
            original_select,
            options,
            encoder,
            sql,
            page: Some(page),
            cursor_live: scroll_id.is_some(),
            scroll_id,
            total_returned: 0,
            state: SessionState::Initialized,
            watchdog,
            started,
        })
    }

    /// Stream every page into `sink` and terminate it exactly once.
    pub async fn drive(mut self, sink: &mut dyn OutputSink) -> Result<SessionOutcome, QueryAstError> {
        let result = self.stream_pages(sink).await;
        self.watchdog.cancel();

        let result = match result {
            Ok(()) => sink.end().map_err(QueryAstError::from),
            Err(e) => {
                self.state = SessionState::Failed;
                error!("query on {} failed after {} rows: {}\n{}", self.target_index, self.total_returned, e, self.sql);
                sink.abort(&e);
                Err(e)
            }
        };
        self.release_cursor().await;
        result?;

        let elapsed = self.started.elapsed();
        if self.state == SessionState::TimedOut {
            error!(
                "query on {} exceeded its {:?} budget; response truncated at {} rows",
                self.target_index, self.options.timeout, self.total_returned
            );
            return Ok(SessionOutcome::OverBudget { returned: self.total_returned });
        }
        info!("query on {} returned {} rows in {:?}", self.target_index, self.total_returned, elapsed);
        Ok(SessionOutcome::Completed { returned: self.total_returned })
    }

    async fn stream_pages(&mut self, sink: &mut dyn OutputSink) -> Result<(), QueryAstError> {
        let Some(mut current) = self.page.take() else { return Ok(()) };

        if current.is_aggregation() {
            let rows = self.rows_for(&current);
            self.total_returned = rows.len() as u64;
            let chunk = self.encoder.encode(&rows, false)?;
            sink.write_chunk(&chunk)?;
            self.state = SessionState::Exhausted;
            return Ok(());
        }

        let limit = self.query.limit;
        loop {
            if self.watchdog.tripped() {
                self.state = SessionState::TimedOut;
                break;
            }
            if current.hit_count() == 0 {
                self.state = SessionState::Exhausted;
                self.cursor_live = false;
                break;
            }
            if limit.is_some_and(|l| self.total_returned >= l) {
                self.state = SessionState::LimitReached;
                break;
            }

            let mut rows = self.rows_for(&current);
            if let Some(l) = limit {
                rows.truncate(usize::try_from(l - self.total_returned).unwrap_or(usize::MAX));
            }
            self.total_returned += rows.len() as u64;

            let next = if limit.is_none_or(|l| self.total_returned < l) {
                Some(self.fetch_next().await?)
            } else {
                None
            };
            let has_more = next.as_ref().is_some_and(|p| p.hit_count() > 0);
            let chunk = self.encoder.encode(&rows, has_more)?;
            sink.write_chunk(&chunk)?;
            debug!("wrote {} rows ({} total, more: {})", rows.len(), self.total_returned, has_more);

            match next {
                Some(page) => current = page,
                None => {
                    self.state = SessionState::LimitReached;
                    break;
                }
            }
        }

        if !self.encoder.is_closed() {
            // nothing emitted yet, or the loop stopped before the last page
            let tail = self.encoder.finish()?;
            sink.write_chunk(&tail)?;
        }
        Ok(())
    }

    async fn fetch_next(&mut self) -> Result<ResultPage, QueryAstError> {
        let Some(id) = self.scroll_id.clone() else {
            return Ok(ResultPage::Hits { hits: Vec::new(), scroll_id: None, total: None });
        };
        let body = self.backend.scroll(&id, &self.options.keep_alive).await?;
        let page = ResultPage::from_response(body);
        if let Some(next_id) = page.scroll_id() {
            self.scroll_id = Some(next_id.to_string());
        }
        Ok(page)
    }

    fn rows_for(&self, page: &ResultPage) -> Vec<Row> {
        let rows = flatten_page(page, &self.original_select);
        match self.options.format {
            OutputFormat::GeoJson => to_features(rows),
            _ => rows,
        }
    }

    /// Best effort; the engine expires the cursor on its own after the keep-alive.
    async fn release_cursor(&mut self) {
        if !self.cursor_live {
            return;
        }
        self.cursor_live = false;
        if let Some(id) = self.scroll_id.take()
            && let Err(e) = self.backend.clear_scroll(&id).await
        {
            warn!("failed to clear scroll cursor on {}: {}", self.target_index, e);
        }
    }
}

fn translation_error(e: BackendError) -> QueryAstError {
    match e {
        BackendError::Status { reason, .. } if reason.to_ascii_lowercase().contains("out of bounds") => {
            QueryAstError::SemanticallyInvalidQuery(reason)
        }
        BackendError::Status { status, reason } => QueryAstError::InvalidQuery { status, detail: reason },
        other => QueryAstError::Backend(other),
    }
}

/// Documents lacking a sort field must not abort the sort: every field sort gets
/// `unmapped_type: long` and sorts missing values last.
pub fn augment_sort(native: &mut Value) {
    let Some(sort) = native.get_mut("sort") else { return };
    if !sort.is_array() {
        *sort = Value::Array(vec![sort.take()]);
    }
    let Some(entries) = sort.as_array_mut() else { return };
    for entry in entries.iter_mut() {
        match entry {
            Value::String(field) if !field.starts_with('_') => {
                let mut spec = Map::new();
                spec.insert("order".into(), Value::String("asc".into()));
                let mut wrapped = Map::new();
                wrapped.insert(field.clone(), Value::Object(with_missing_defaults(spec)));
                *entry = Value::Object(wrapped);
            }
            Value::Object(fields) => {
                for (field, spec) in fields.iter_mut() {
                    if field.starts_with('_') {
                        continue;
                    }
                    *spec = match spec.take() {
                        Value::Object(o) => Value::Object(with_missing_defaults(o)),
                        Value::String(order) => {
                            let mut o = Map::new();
                            o.insert("order".into(), Value::String(order));
                            Value::Object(with_missing_defaults(o))
                        }
                        other => other,
                    };
                }
            }
            _ => {}
        }
    }
}

fn with_missing_defaults(mut spec: Map<String, Value>) -> Map<String, Value> {
    spec.insert("unmapped_type".into(), Value::String("long".into()));
    spec.insert("missing".into(), Value::String("_last".into()));
    spec
}

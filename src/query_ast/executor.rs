//! Search-engine abstraction and the top-level query pipeline.
//!
//! The scroll engine only talks to the engine through [`SearchBackend`], and the rewriter
//! only through [`MappingLookup`], so both can run against an in-memory double in tests.

use log::{debug, error};
use serde_json::Value;

use super::ast::QueryAst;
use super::errors::{BackendError, QueryAstError};
use super::rewrite::rewrite_query;
use super::scroll::{CursorSession, SessionOptions, SessionOutcome};
use crate::models::structs::FieldMapping;
use crate::stream::OutputSink;

/// Keep-alive sent with every search/scroll request.
pub const SCROLL_KEEP_ALIVE: &str = "1m";

/// Contract consumed from the search engine.
#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    /// Translate SQL text into the engine's native query document.
    async fn explain(&self, sql: &str) -> Result<Value, BackendError>;

    /// Open a scroll cursor; the response carries the first page and `_scroll_id`.
    async fn search(&self, index: &str, query: &Value, keep_alive: &str) -> Result<Value, BackendError>;

    /// Fetch the next page of an open cursor.
    async fn scroll(&self, scroll_id: &str, keep_alive: &str) -> Result<Value, BackendError>;

    /// Release a cursor before its keep-alive lapses.
    async fn clear_scroll(&self, _scroll_id: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Field mapping source for the rewriter.
#[async_trait::async_trait]
pub trait MappingLookup: Send + Sync {
    async fn get_mapping(&self, index: &str) -> Result<FieldMapping, BackendError>;
}

/// Rewrite, translate, scroll and stream one query into `sink`.
///
/// The sink always receives exactly one terminal call: `abort` when the query fails before
/// streaming starts, otherwise whatever [`CursorSession::drive`] decides.
pub async fn execute_query<B, M>(
    query: &QueryAst,
    index: &str,
    backend: &B,
    mappings: &M,
    sink: &mut dyn OutputSink,
    options: SessionOptions,
) -> Result<SessionOutcome, QueryAstError>
where
    B: SearchBackend + ?Sized,
    M: MappingLookup + ?Sized,
{
    let rewritten = match rewrite_query(query, index, mappings).await {
        Ok(q) => q,
        Err(e) => {
            error!("rewrite failed for index {}: {}", index, e);
            sink.abort(&e);
            return Err(e);
        }
    };
    debug!("rewritten query: {:?}", rewritten);

    let session = match CursorSession::init(backend, index, rewritten, query.select.clone(), options).await {
        Ok(s) => s,
        Err(e) => {
            error!("query init failed for index {}: {}", index, e);
            sink.abort(&e);
            return Err(e);
        }
    };
    session.drive(sink).await
}

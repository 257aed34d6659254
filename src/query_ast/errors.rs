#[derive(thiserror::Error, Debug)]
pub enum QueryAstError {
    #[error("parse error: {0}")] Parse(String),
    #[error("unsupported feature: {0}")] Unsupported(&'static str),
    #[error("emit error: {0}")] Emit(String),
    #[error(transparent)] Rewrite(#[from] RewriteError),
    /// The translation endpoint rejected the query; status and reason are passed through as-is.
    #[error("invalid query ({status}): {detail}")] InvalidQuery { status: u16, detail: String },
    #[error("semantically invalid query: {0}")] SemanticallyInvalidQuery(String),
    #[error("table not found: {0}")] IndexNotFound(String),
    #[error("timeout exceeded after {returned} rows")] TimeoutExceeded { returned: u64 },
    #[error(transparent)] Backend(#[from] BackendError),
    #[error("encode error: {0}")] Encode(String),
    #[error("io error: {0}")] Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum RewriteError {
    #[error("mapping lookup failed: {0}")] Mapping(BackendError),
}

/// Failures talking to the search engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("search engine returned {status}: {reason}")] Status { status: u16, reason: String },
    #[error("transport error: {0}")] Transport(String),
    #[error("decode error: {0}")] Decode(String),
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeoError {
    #[error("invalid geometry: {0}")] InvalidGeometry(String),
    #[error("unsupported geometry type: {0}")] Unsupported(String),
}

impl From<csv::Error> for QueryAstError { fn from(e: csv::Error) -> Self { QueryAstError::Encode(e.to_string()) } }
impl From<serde_json::Error> for QueryAstError { fn from(e: serde_json::Error) -> Self { QueryAstError::Encode(e.to_string()) } }

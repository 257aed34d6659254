//! SQL adapter for document search indexes.
//!
//! A parsed [`query_ast::QueryAst`] is rewritten against the index mapping, translated by the
//! engine's SQL plugin, paged through a scroll cursor and streamed out as JSON, GeoJSON or CSV.

pub mod config;
pub mod export;
pub mod flatten;
pub mod models;
pub mod query_ast;
pub mod stream;

pub use config::AdapterConfig;
pub use export::{ChunkEncoder, convert_to_chunk};
pub use flatten::flatten_page;
pub use models::{FieldMapping, FieldType, OutputFormat, ResultPage, Row};
pub use query_ast::{QueryAst, QueryAstError, SessionOptions, SessionOutcome, execute_query};
pub use stream::{ChannelSink, OutputSink, StreamEvent, WriterSink};

/// Install the `env_logger` backend. `RUST_LOG` wins; otherwise this crate logs at info.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_module("docsql", log::LevelFilter::Info)
        .is_test(false)
        .try_init();
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

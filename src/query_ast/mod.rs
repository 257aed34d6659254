//! Query tree, rewriting and the scroll-driven execution pipeline.
//!
//! `parser` (feature `sql_parser`) turns SQL text into a [`QueryAst`]; `rewrite` adapts it to
//! the index mapping; `scroll` translates, pages and streams it through a [`SearchBackend`].

pub mod ast;
pub mod emitter;
pub mod errors;
pub mod executor;
pub mod executors;
pub mod geo;
pub mod mapping_cache;
#[cfg(feature = "sql_parser")]
pub mod parser;
pub mod rewrite;
pub mod scroll;

pub use ast::*;
pub use errors::*;
pub use executor::{MappingLookup, SearchBackend, execute_query};
pub use scroll::{CursorSession, SessionOptions, SessionOutcome};

pub mod elasticsearch;

pub use elasticsearch::ElasticsearchBackend;

use std::io::{BufWriter, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{error, info};
use serde_json::Value;

use docsql::config::{self, AdapterConfig};
use docsql::query_ast::emitter::emit_sql;
use docsql::query_ast::executor::{SearchBackend, execute_query};
use docsql::query_ast::executors::ElasticsearchBackend;
use docsql::query_ast::mapping_cache::CachedMappingLookup;
use docsql::query_ast::parser::parse_sql;
use docsql::query_ast::rewrite::rewrite_query;
use docsql::{OutputFormat, WriterSink};

/// docsql - run SQL against a document index and stream the rows
#[derive(Parser, Debug)]
#[command(name = "docsql")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $DOCSQL_CONFIG, then ~/.docsql/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine URL, overrides the config file
    #[arg(long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a query and stream the result to stdout
    Query {
        sql: String,

        /// Index to search (defaults to the FROM clause)
        #[arg(long)]
        index: Option<String>,

        /// json, geojson or csv
        #[arg(long, default_value = "json")]
        format: OutputFormat,

        /// Omit the trailing "meta" member
        #[arg(long)]
        download: bool,

        /// JSON document echoed back as "meta"
        #[arg(long)]
        meta: Option<String>,

        /// Query time budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print the rewritten SQL and the engine's native translation
    Explain {
        sql: String,

        #[arg(long)]
        index: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    docsql::init_logging();

    let cli = Cli::parse();
    let config_file = cli.config.clone().unwrap_or_else(config::config_path);
    let mut config = AdapterConfig::load_from(&config_file)?;
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    info!("docsql {} using {} (config {})", docsql::version(), config.endpoint, config_file.display());

    let backend = ElasticsearchBackend::from_config(&config)?;

    match cli.command {
        Command::Query { sql, index, format, download, meta, timeout } => {
            let query = parse_sql(&sql)?;
            let index = index.unwrap_or_else(|| query.from.clone());
            let mut options = config.session_options();
            options.format = format;
            options.is_download = download;
            options.clone_metadata = meta.map(|m| serde_json::from_str::<Value>(&m)).transpose()?;
            if let Some(secs) = timeout {
                options.timeout = std::time::Duration::from_secs(secs);
            }

            let mut sink = WriterSink::new(BufWriter::new(std::io::stdout()));
            let outcome = if config.cache_mappings {
                let mappings = CachedMappingLookup::new(backend.clone(), config.mapping_cache_ttl());
                execute_query(&query, &index, &backend, &mappings, &mut sink, options).await?
            } else {
                execute_query(&query, &index, &backend, &backend, &mut sink, options).await?
            };
            let mut out = sink.into_inner();
            if format != OutputFormat::Csv {
                writeln!(out)?;
            }
            out.flush()?;

            let returned = outcome.returned();
            if let Err(e) = outcome.into_result() {
                error!("{}", e);
                std::process::exit(2);
            }
            info!("{} rows returned", returned);
        }
        Command::Explain { sql, index } => {
            let query = parse_sql(&sql)?;
            let index = index.unwrap_or_else(|| query.from.clone());
            let rewritten = rewrite_query(&query, &index, &backend).await?;
            let emitted = emit_sql(&rewritten)?;
            let native = backend.explain(&emitted).await?;
            println!("{}", emitted);
            println!("{}", serde_json::to_string_pretty(&native)?);
        }
    }
    Ok(())
}

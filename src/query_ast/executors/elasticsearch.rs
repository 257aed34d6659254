//! Elasticsearch / OpenDistro REST backend
//!
//! Translation goes through the SQL plugin's `_explain` endpoint; paging uses the standard
//! `_search?scroll=` / `_search/scroll` pair.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Method, Url};
use serde_json::{Value, json};

use crate::config::AdapterConfig;
use crate::models::structs::FieldMapping;
use crate::query_ast::errors::BackendError;
use crate::query_ast::executor::{MappingLookup, SearchBackend};

pub const DEFAULT_EXPLAIN_PATH: &str = "_opendistro/_sql/_explain";

#[derive(Clone)]
pub struct ElasticsearchBackend {
    client: Client,
    endpoint: Url,
    explain_path: String,
    auth: Option<(String, Option<String>)>,
}

impl ElasticsearchBackend {
    pub fn new(endpoint: &str, request_timeout: Option<Duration>) -> Result<Self, BackendError> {
        let endpoint = Url::parse(endpoint).map_err(|e| BackendError::Transport(format!("invalid endpoint {}: {}", endpoint, e)))?;
        if endpoint.cannot_be_a_base() {
            return Err(BackendError::Transport(format!("invalid endpoint {}", endpoint)));
        }
        let mut builder = Client::builder();
        if let Some(t) = request_timeout {
            builder = builder.timeout(t);
        }
        let client = builder.build().map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint, explain_path: DEFAULT_EXPLAIN_PATH.to_string(), auth: None })
    }

    pub fn from_config(config: &AdapterConfig) -> Result<Self, BackendError> {
        let mut backend = Self::new(&config.endpoint, config.request_timeout())?
            .with_explain_path(&config.explain_path);
        if let Some(user) = &config.username {
            backend = backend.with_basic_auth(user, config.password.clone());
        }
        Ok(backend)
    }

    pub fn with_explain_path(mut self, path: &str) -> Self {
        self.explain_path = path.trim_matches('/').to_string();
        self
    }

    pub fn with_basic_auth(mut self, username: &str, password: Option<String>) -> Self {
        self.auth = Some((username.to_string(), password));
        self
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            for seg in segments {
                path.push(seg);
            }
        }
        url
    }

    fn explain_url(&self) -> Url {
        let parts: Vec<&str> = self.explain_path.split('/').filter(|s| !s.is_empty()).collect();
        self.url(&parts)
    }

    async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value, BackendError> {
        debug!("{} {}", method, url);
        let mut req = self.client.request(method, url);
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, pass.as_ref());
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await.map_err(|e| BackendError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| BackendError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(BackendError::Status { status: status.as_u16(), reason: error_reason(&text) });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

/// Pull the human-readable reason out of an engine error body.
fn error_reason(body: &str) -> String {
    let Ok(v) = serde_json::from_str::<Value>(body) else { return body.trim().to_string() };
    let err = &v["error"];
    if let Some(s) = err.as_str() {
        return s.to_string();
    }
    let reason = err["reason"].as_str().or_else(|| err["root_cause"][0]["reason"].as_str());
    match (reason, err["details"].as_str()) {
        (Some(r), Some(d)) if !d.is_empty() => format!("{}: {}", r, d),
        (Some(r), _) => r.to_string(),
        (None, _) => body.trim().to_string(),
    }
}

#[async_trait]
impl SearchBackend for ElasticsearchBackend {
    async fn explain(&self, sql: &str) -> Result<Value, BackendError> {
        self.send(Method::POST, self.explain_url(), Some(&json!({ "query": sql }))).await
    }

    async fn search(&self, index: &str, query: &Value, keep_alive: &str) -> Result<Value, BackendError> {
        let mut url = self.url(&[index, "_search"]);
        url.query_pairs_mut().append_pair("scroll", keep_alive);
        self.send(Method::POST, url, Some(query)).await
    }

    async fn scroll(&self, scroll_id: &str, keep_alive: &str) -> Result<Value, BackendError> {
        let body = json!({ "scroll": keep_alive, "scroll_id": scroll_id });
        self.send(Method::POST, self.url(&["_search", "scroll"]), Some(&body)).await
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), BackendError> {
        let body = json!({ "scroll_id": [scroll_id] });
        self.send(Method::DELETE, self.url(&["_search", "scroll"]), Some(&body)).await.map(|_| ())
    }
}

#[async_trait]
impl MappingLookup for ElasticsearchBackend {
    async fn get_mapping(&self, index: &str) -> Result<FieldMapping, BackendError> {
        let body = self.send(Method::GET, self.url(&[index, "_mapping"]), None).await?;
        Ok(FieldMapping::from_mapping_response(&body))
    }
}

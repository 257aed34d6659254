use dirs::home_dir;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::query_ast::executor::SCROLL_KEEP_ALIVE;
use crate::query_ast::executors::elasticsearch::DEFAULT_EXPLAIN_PATH;
use crate::query_ast::scroll::SessionOptions;

/// Environment variable pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "DOCSQL_CONFIG";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub endpoint: String,
    pub explain_path: String,
    pub scroll_keep_alive: String,
    pub query_timeout_secs: u64,
    pub request_timeout_secs: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cache_mappings: bool,
    pub mapping_cache_ttl_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9200".into(),
            explain_path: DEFAULT_EXPLAIN_PATH.into(),
            scroll_keep_alive: SCROLL_KEEP_ALIVE.into(),
            query_timeout_secs: 60,
            request_timeout_secs: None,
            username: None,
            password: None,
            cache_mappings: false,
            mapping_cache_ttl_secs: 300,
        }
    }
}

impl AdapterConfig {
    /// Defaults, then the config file (if any), then `DOCSQL_*` environment overrides.
    pub fn load() -> Result<Self, String> {
        Self::load_from(&config_path())
    }

    /// Same layering as [`AdapterConfig::load`] with an explicit file. A missing file is not an error.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let mut config = if path.exists() { Self::from_file(path)? } else { Self::default() };
        config.apply_env(|k| std::env::var(k).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path).map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent()
            && let Err(e) = fs::create_dir_all(dir)
        {
            return Err(format!("Cannot create directory {}: {}", dir.display(), e));
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        fs::write(path, content).map_err(|e| format!("Cannot write config {}: {}", path.display(), e))
    }

    /// Apply `DOCSQL_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DOCSQL_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = lookup("DOCSQL_EXPLAIN_PATH") {
            self.explain_path = v;
        }
        if let Some(v) = lookup("DOCSQL_SCROLL_KEEP_ALIVE") {
            self.scroll_keep_alive = v;
        }
        if let Some(v) = lookup("DOCSQL_QUERY_TIMEOUT_SECS") {
            self.query_timeout_secs = parse_num("DOCSQL_QUERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DOCSQL_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = Some(parse_num("DOCSQL_REQUEST_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("DOCSQL_USERNAME") {
            self.username = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("DOCSQL_PASSWORD") {
            self.password = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("DOCSQL_CACHE_MAPPINGS") {
            self.cache_mappings = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("DOCSQL_MAPPING_CACHE_TTL_SECS") {
            self.mapping_cache_ttl_secs = parse_num("DOCSQL_MAPPING_CACHE_TTL_SECS", &v)?;
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn mapping_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.mapping_cache_ttl_secs)
    }

    /// Session options carrying this config's timeout and keep-alive.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeout: self.query_timeout(),
            keep_alive: self.scroll_keep_alive.clone(),
            ..SessionOptions::default()
        }
    }
}

fn parse_num(key: &str, value: &str) -> Result<u64, String> {
    value.trim().parse().map_err(|_| format!("{} must be a whole number, got {:?}", key, value))
}

/// Default ~/.docsql directory
fn default_config_dir() -> PathBuf {
    if let Some(mut hd) = home_dir() {
        hd.push(".docsql");
        hd
    } else {
        PathBuf::from(".docsql")
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(custom) = std::env::var(CONFIG_PATH_ENV) {
        if custom.trim().is_empty() {
            warn!("{} is set but empty, ignoring", CONFIG_PATH_ENV);
        } else {
            return PathBuf::from(custom);
        }
    }
    default_config_dir().join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AdapterConfig = serde_json::from_str(r#"{"endpoint":"https://es:9243","cache_mappings":true}"#).unwrap();
        assert_eq!(config.endpoint, "https://es:9243");
        assert!(config.cache_mappings);
        assert_eq!(config.query_timeout_secs, 60);
        assert_eq!(config.explain_path, "_opendistro/_sql/_explain");
        assert_eq!(config.scroll_keep_alive, "1m");
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DOCSQL_ENDPOINT", "http://other:9200"),
            ("DOCSQL_QUERY_TIMEOUT_SECS", "5"),
            ("DOCSQL_USERNAME", "reader"),
            ("DOCSQL_PASSWORD", ""),
            ("DOCSQL_CACHE_MAPPINGS", "TRUE"),
        ]);
        let mut config = AdapterConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.endpoint, "http://other:9200");
        assert_eq!(config.query_timeout(), Duration::from_secs(5));
        assert_eq!(config.username.as_deref(), Some("reader"));
        assert_eq!(config.password, None);
        assert!(config.cache_mappings);
        assert_eq!(config.session_options().timeout, Duration::from_secs(5));
    }

    #[test]
    fn bad_number_is_reported() {
        let mut config = AdapterConfig::default();
        let err = config
            .apply_env(|k| (k == "DOCSQL_MAPPING_CACHE_TTL_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.contains("DOCSQL_MAPPING_CACHE_TTL_SECS"));
    }

    #[test]
    fn save_and_reload() {
        let path = std::env::temp_dir().join(format!("docsql-config-{}.json", std::process::id()));
        let config = AdapterConfig { request_timeout_secs: Some(30), ..AdapterConfig::default() };
        config.save(&path).unwrap();
        assert_eq!(AdapterConfig::from_file(&path).unwrap(), config);
        let _ = fs::remove_file(&path);
    }
}
